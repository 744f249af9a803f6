//! Importing upstreams from other agent tools' config files.
//!
//! The external format is the common `mcpServers` JSON map (Claude Desktop,
//! Cursor and friends). Parsing stays deliberately thin; the interesting
//! part is the merge: identical definitions are recognized as in-sync so a
//! re-import is idempotent, and differing ones are conflicts that need
//! `--force`.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use mcp_squared::Config;
use mcp_squared::config::{UpstreamConfig, UpstreamTransport};

#[derive(Debug, Deserialize)]
struct ExternalFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, ExternalServer>,
}

#[derive(Debug, Deserialize)]
struct ExternalServer {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// How one incoming upstream relates to the existing config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    New,
    InSync,
    Conflict,
}

#[derive(Debug, Default)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub in_sync: Vec<String>,
    pub conflicts: Vec<String>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        !self.added.is_empty()
    }
}

/// Parse an external `mcpServers` JSON document into upstream configs.
pub fn parse_external(json: &str) -> Result<BTreeMap<String, UpstreamConfig>> {
    let file: ExternalFile = serde_json::from_str(json).context("not an mcpServers document")?;
    let mut upstreams = BTreeMap::new();
    for (key, server) in file.mcp_servers {
        let transport = match (&server.command, &server.url) {
            (Some(command), _) => UpstreamTransport::Subprocess {
                command: command.clone(),
                args: server.args.clone(),
                cwd: None,
                env: server.env.clone(),
            },
            (None, Some(url)) => UpstreamTransport::StreamableHttp {
                url: url.clone(),
                headers: server.headers.clone(),
                auth: None,
            },
            (None, None) => bail!("server '{key}' has neither a command nor a url"),
        };
        upstreams.insert(
            key,
            UpstreamConfig {
                enabled: true,
                label: None,
                transport,
            },
        );
    }
    Ok(upstreams)
}

/// Classify one incoming upstream against the current config.
pub fn classify(config: &Config, key: &str, incoming: &UpstreamConfig) -> Disposition {
    match config.upstreams.get(key) {
        None => Disposition::New,
        Some(existing) if existing.transport == incoming.transport => Disposition::InSync,
        Some(_) => Disposition::Conflict,
    }
}

/// Merge incoming upstreams into the config. In-sync entries produce zero
/// changes; conflicts are skipped unless `force`.
pub fn merge(
    config: &mut Config,
    incoming: BTreeMap<String, UpstreamConfig>,
    force: bool,
) -> MergeReport {
    let mut report = MergeReport::default();
    for (key, upstream) in incoming {
        match classify(config, &key, &upstream) {
            Disposition::New => {
                config.upstreams.insert(key.clone(), upstream);
                report.added.push(key);
            }
            Disposition::InSync => report.in_sync.push(key),
            Disposition::Conflict => {
                if force {
                    config.upstreams.insert(key.clone(), upstream);
                    report.added.push(key);
                } else {
                    report.conflicts.push(key);
                }
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTERNAL: &str = r#"{
        "mcpServers": {
            "test": {
                "command": "npx",
                "args": ["-y", "pkg"]
            }
        }
    }"#;

    fn existing_config() -> Config {
        let mut config = Config::default();
        let incoming = parse_external(EXTERNAL).unwrap();
        merge(&mut config, incoming, false);
        config
    }

    #[test]
    fn identical_reimport_is_in_sync_with_zero_changes() {
        let mut config = existing_config();
        let before = config.clone();

        let incoming = parse_external(EXTERNAL).unwrap();
        let report = merge(&mut config, incoming, false);

        assert_eq!(report.in_sync, vec!["test"]);
        assert!(report.added.is_empty());
        assert!(report.conflicts.is_empty());
        assert!(!report.changed());
        assert_eq!(config, before, "merge produced zero changes");
    }

    #[test]
    fn differing_definition_is_a_conflict_unless_forced() {
        let mut config = existing_config();
        let incoming = parse_external(
            r#"{"mcpServers": {"test": {"command": "uvx", "args": ["other"]}}}"#,
        )
        .unwrap();

        let report = merge(&mut config, incoming.clone(), false);
        assert_eq!(report.conflicts, vec!["test"]);
        match &config.upstreams["test"].transport {
            UpstreamTransport::Subprocess { command, .. } => assert_eq!(command, "npx"),
            other => panic!("unexpected transport {other:?}"),
        }

        let report = merge(&mut config, incoming, true);
        assert_eq!(report.added, vec!["test"]);
        match &config.upstreams["test"].transport {
            UpstreamTransport::Subprocess { command, .. } => assert_eq!(command, "uvx"),
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn url_servers_map_to_streamable_http() {
        let incoming = parse_external(
            r#"{"mcpServers": {"linear": {"url": "https://mcp.linear.app/mcp"}}}"#,
        )
        .unwrap();
        match &incoming["linear"].transport {
            UpstreamTransport::StreamableHttp { url, .. } => {
                assert_eq!(url, "https://mcp.linear.app/mcp");
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn server_without_command_or_url_is_rejected() {
        assert!(parse_external(r#"{"mcpServers": {"broken": {}}}"#).is_err());
    }
}
