//! Configuration: model, discovery, load/save, migration.

mod discovery;
mod migrate;
mod model;

pub use discovery::{CONFIG_ENV_VAR, discover, user_config_path};
pub use migrate::migrate;
pub use model::{
    AuthConfig, Config, DetailLevel, FindToolsConfig, IndexConfig, LoggingConfig,
    OperationsConfig, SCHEMA_VERSION, SearchMode, SecurityConfig, SelectionCacheConfig,
    UpstreamConfig, UpstreamTransport,
};

use std::path::Path;

use crate::error::CoreError;

impl Config {
    /// Read, migrate and validate a config file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    /// Parse config text (already located at `path`, used for error context).
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, CoreError> {
        let mut table: toml::Table = text.parse().map_err(|e: toml::de::Error| {
            CoreError::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        migrate(&mut table)?;
        let config: Config = table.try_into().map_err(|e: toml::de::Error| {
            CoreError::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize and atomically write the config.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let text = toml::to_string_pretty(self).map_err(|e| CoreError::ConfigValidation {
            reason: format!("unserializable config: {e}"),
        })?;
        let io_err = |source| CoreError::ConfigIo {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, text).map_err(|source| CoreError::ConfigIo {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (key, upstream) in &self.upstreams {
            if !is_valid_upstream_key(key) {
                return Err(CoreError::ConfigValidation {
                    reason: format!("upstream key '{key}' must match [A-Za-z0-9_-]+"),
                });
            }
            match &upstream.transport {
                UpstreamTransport::Subprocess { command, .. } => {
                    if command.is_empty() {
                        return Err(CoreError::ConfigValidation {
                            reason: format!("upstream '{key}': command is empty"),
                        });
                    }
                }
                UpstreamTransport::StreamableHttp { url, .. } => {
                    if !(url.starts_with("http://") || url.starts_with("https://")) {
                        return Err(CoreError::ConfigValidation {
                            reason: format!("upstream '{key}': url '{url}' is not http(s)"),
                        });
                    }
                }
            }
        }
        let find_tools = &self.operations.find_tools;
        if find_tools.max_limit == 0 || find_tools.default_limit == 0 {
            return Err(CoreError::ConfigValidation {
                reason: "operations.findTools limits must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn is_valid_upstream_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_save_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            schemaVersion = 1

            [upstreams.fs]
            transport = "subprocess"
            command = "npx"
            args = ["-y", "pkg"]

            [security.tools]
            allow = ["fs:*"]

            [operations.findTools]
            defaultLimit = 5
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.operations.find_tools.default_limit, 5);
        assert_eq!(config.operations.find_tools.max_limit, 50);

        let out = tmp.path().join("saved.toml");
        config.save(&out).unwrap();
        let reloaded = Config::load(&out).unwrap();
        assert_eq!(config, reloaded);
    }

    #[test]
    fn legacy_file_is_migrated_on_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [servers.fs]
            transport = "subprocess"
            command = "npx"
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.schema_version, SCHEMA_VERSION);
        assert!(config.upstreams.contains_key("fs"));
    }

    #[test]
    fn invalid_upstream_key_is_rejected() {
        let config = Config::from_toml(
            r#"
            schemaVersion = 1

            [upstreams."bad key"]
            transport = "subprocess"
            command = "npx"
            "#,
            Path::new("test.toml"),
        );
        assert!(matches!(config, Err(CoreError::ConfigValidation { .. })));
    }

    #[test]
    fn non_http_url_is_rejected() {
        let config = Config::from_toml(
            r#"
            schemaVersion = 1

            [upstreams.x]
            transport = "streamableHttp"
            url = "ftp://example.com"
            "#,
            Path::new("test.toml"),
        );
        assert!(matches!(config, Err(CoreError::ConfigValidation { .. })));
    }

    #[test]
    fn missing_file_is_config_io() {
        let err = Config::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, CoreError::ConfigIo { .. }));
    }
}
