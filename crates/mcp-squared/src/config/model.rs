//! Typed configuration model.
//!
//! The on-disk format is TOML with camelCase keys. Every section defaults so
//! a minimal file (or an empty one) loads into a fully usable config.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::policy::SecurityPolicy;

/// Current config schema version.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub upstreams: BTreeMap<String, UpstreamConfig>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    /// Absent means the hardened default (confirm everything).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<SecurityPolicy>,
}

impl SecurityConfig {
    pub fn effective_policy(&self) -> SecurityPolicy {
        self.tools.clone().unwrap_or_else(SecurityPolicy::hardened)
    }
}

/// One upstream MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub transport: UpstreamTransport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "camelCase")]
pub enum UpstreamTransport {
    /// Child process speaking MCP over stdio.
    #[serde(rename_all = "camelCase")]
    Subprocess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        /// Values may reference the process environment as `$NAME`/`${NAME}`;
        /// they are expanded at dial time.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Streaming HTTP endpoint.
    ///
    /// `auth` precedes `headers` so a plain `auth = true` serializes before
    /// the headers table.
    #[serde(rename_all = "camelCase")]
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<AuthConfig>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl UpstreamTransport {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamTransport::Subprocess { .. } => "subprocess",
            UpstreamTransport::StreamableHttp { .. } => "streamableHttp",
        }
    }
}

/// OAuth block on an HTTP upstream: a plain `true`, or structured options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthConfig {
    Enabled(bool),
    #[serde(rename_all = "camelCase")]
    Options {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        callback_port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_name: Option<String>,
    },
}

impl AuthConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, AuthConfig::Enabled(false))
    }

    pub fn callback_port(&self) -> Option<u16> {
        match self {
            AuthConfig::Options { callback_port, .. } => *callback_port,
            AuthConfig::Enabled(_) => None,
        }
    }

    pub fn client_name(&self) -> Option<&str> {
        match self {
            AuthConfig::Options { client_name, .. } => client_name.as_deref(),
            AuthConfig::Enabled(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationsConfig {
    #[serde(default)]
    pub find_tools: FindToolsConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub selection_cache: SelectionCacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindToolsConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default)]
    pub default_mode: SearchMode,
    #[serde(default)]
    pub default_detail_level: DetailLevel,
}

impl Default for FindToolsConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            default_mode: SearchMode::default(),
            default_detail_level: DetailLevel::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Fast,
    Semantic,
    Hybrid,
}

/// How much of each tool record `find_tools` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DetailLevel {
    /// Names only.
    L0,
    /// Names and descriptions.
    #[default]
    L1,
    /// Names, descriptions and input schemas.
    L2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexConfig {
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_cooccurrence")]
    pub min_cooccurrence_threshold: u32,
    #[serde(default = "default_max_bundles")]
    pub max_bundle_suggestions: usize,
}

impl Default for SelectionCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_cooccurrence_threshold: default_min_cooccurrence(),
            max_bundle_suggestions: default_max_bundles(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_limit() -> usize {
    10
}

fn default_max_limit() -> usize {
    50
}

fn default_refresh_interval_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_min_cooccurrence() -> u32 {
    2
}

fn default_max_bundles() -> usize {
    3
}
