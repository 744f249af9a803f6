//! Structured error type for the core crate.
//!
//! Every variant carries typed context and a stable machine-readable code so
//! callers (CLI, daemon clients) can branch without string matching.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by config loading, migration and policy compilation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    #[error("no configuration file found (searched env, project and user locations)")]
    ConfigNotFound,

    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("invalid configuration: {reason}")]
    ConfigValidation { reason: String },

    #[error("config schema version {found} is newer than supported version {supported}")]
    UnknownSchemaVersion { found: u32, supported: u32 },

    #[error("invalid {list} pattern '{pattern}': {reason}")]
    PolicyPattern {
        list: &'static str,
        pattern: String,
        reason: String,
    },
}

impl CoreError {
    /// Stable code for wire payloads and exit-path logging.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigNotFound => "config_not_found",
            CoreError::ConfigIo { .. } => "config_io",
            CoreError::ConfigParse { .. } => "config_parse",
            CoreError::ConfigValidation { .. } => "config_validation",
            CoreError::UnknownSchemaVersion { .. } => "unknown_schema_version",
            CoreError::PolicyPattern { .. } => "policy_pattern",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::ConfigNotFound.code(), "config_not_found");
        assert_eq!(
            CoreError::UnknownSchemaVersion {
                found: 9,
                supported: 1
            }
            .code(),
            "unknown_schema_version"
        );
    }

    #[test]
    fn unknown_schema_version_names_both_versions() {
        let msg = CoreError::UnknownSchemaVersion {
            found: 3,
            supported: 1,
        }
        .to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains('1'));
    }
}
