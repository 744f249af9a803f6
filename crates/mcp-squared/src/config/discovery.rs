//! Config file discovery.
//!
//! Resolution order: `MCP_SQUARED_CONFIG` env var, nearest ancestor project
//! file, then the per-user config home. First hit wins.

use std::path::{Path, PathBuf};

use crate::error::CoreError;

/// Environment variable naming an explicit config path.
pub const CONFIG_ENV_VAR: &str = "MCP_SQUARED_CONFIG";

/// Project-local file names, checked in order at every ancestor.
const PROJECT_FILES: [&str; 2] = ["mcp-squared.toml", ".mcp-squared/config.toml"];

/// Locate the active config file starting from `cwd`.
pub fn discover(cwd: &Path) -> Result<PathBuf, CoreError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR)
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }

    for dir in cwd.ancestors() {
        for name in PROJECT_FILES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    let user = user_config_path();
    if user.is_file() {
        return Ok(user);
    }

    Err(CoreError::ConfigNotFound)
}

/// The per-user config location (`<config home>/mcp-squared/config.toml`).
pub fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mcp-squared")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn project_file_beats_user_file() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join("mcp-squared.toml"), "schemaVersion = 1").unwrap();

        let found = discover(&nested).unwrap();
        assert_eq!(found, tmp.path().join("mcp-squared.toml"));
    }

    #[test]
    fn dotdir_variant_is_found() {
        let tmp = TempDir::new().unwrap();
        let dotdir = tmp.path().join(".mcp-squared");
        std::fs::create_dir_all(&dotdir).unwrap();
        std::fs::write(dotdir.join("config.toml"), "schemaVersion = 1").unwrap();

        let found = discover(tmp.path()).unwrap();
        assert_eq!(found, dotdir.join("config.toml"));
    }

    #[test]
    fn nearest_ancestor_wins() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("inner");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join("mcp-squared.toml"), "# outer").unwrap();
        std::fs::write(nested.join("mcp-squared.toml"), "# inner").unwrap();

        let found = discover(&nested).unwrap();
        assert_eq!(found, nested.join("mcp-squared.toml"));
    }
}
