//! Structured error type for the broker runtime.
//!
//! Every variant carries typed context and a stable `code()` so wire payloads
//! and logs can classify failures without string matching. Policy outcomes
//! (`PolicyBlocked`, `PolicyConfirmationRequired`) are represented here for
//! transport boundaries, but inside the session server they are returned as
//! data, not errors.

use thiserror::Error;

use mcp_squared::CoreError;

/// Why a dial attempt failed, distinguishing the cases an operator has to
/// treat differently.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DialFailure {
    #[error("executable '{command}' not found")]
    ExecutableNotFound { command: String },

    #[error("child exited before the MCP handshake ({detail})")]
    ChildExited { detail: String },

    #[error("MCP handshake timed out after {seconds}s")]
    HandshakeTimeout { seconds: u64 },

    #[error("network unreachable: {reason}")]
    NetworkUnreachable { reason: String },

    #[error("TLS failure: {reason}")]
    Tls { reason: String },

    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("failed to dial upstream '{upstream}': {failure}")]
    UpstreamDialFailed {
        upstream: String,
        #[source]
        failure: DialFailure,
    },

    #[error("listing tools on upstream '{upstream}' failed: {reason}")]
    UpstreamToolListFailed { upstream: String, reason: String },

    #[error("call to '{tool}' on upstream '{upstream}' failed: {reason}")]
    UpstreamCallFailed {
        upstream: String,
        tool: String,
        reason: String,
    },

    #[error("upstream '{upstream}' is {status}, not connected")]
    UpstreamNotConnected { upstream: String, status: String },

    #[error("unknown upstream '{upstream}'")]
    UnknownUpstream { upstream: String },

    #[error("tool '{tool}' not found in any connected upstream")]
    ToolNotFound { tool: String },

    #[error("tool name '{tool}' is ambiguous; candidates: {}", alternatives.join(", "))]
    AmbiguousTool {
        tool: String,
        alternatives: Vec<String>,
    },

    #[error("blocked by security policy: {reason}")]
    PolicyBlocked { reason: String },

    #[error("confirmation required: {reason}")]
    PolicyConfirmationRequired { token: String, reason: String },

    #[error("token store I/O failed: {reason}")]
    TokenStoreIo { reason: String },

    #[error("OAuth callback timed out after {seconds}s")]
    OAuthCallbackTimeout { seconds: u64 },

    #[error("OAuth state parameter mismatch")]
    OAuthStateMismatch,

    #[error(
        "OAuth authorization required for upstream '{upstream}'; run `mcp-squared auth {upstream}`"
    )]
    NeedsManualAuth { upstream: String },

    #[error("index store I/O failed: {reason}")]
    IndexStoreIo { reason: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    IndexSchemaMismatch { expected: usize, actual: usize },

    #[error("IPC peer is unauthorized")]
    IpcUnauthorized,

    #[error("IPC frame of {size} bytes exceeds the {max}-byte limit")]
    IpcFrameTooLarge { size: usize, max: usize },

    #[error("IPC peer is gone: {reason}")]
    IpcPeerGone { reason: String },

    #[error("unknown monitor command '{command}'")]
    MonitorCommandUnknown { command: String },

    #[error("stale instance registry entry at {path}")]
    InstanceRegistryStale { path: String },
}

impl BrokerError {
    /// Stable code for wire payloads and counters.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Core(e) => e.code(),
            BrokerError::UpstreamDialFailed { .. } => "upstream_dial_failed",
            BrokerError::UpstreamToolListFailed { .. } => "upstream_tool_list_failed",
            BrokerError::UpstreamCallFailed { .. } => "upstream_call_failed",
            BrokerError::UpstreamNotConnected { .. } => "upstream_not_connected",
            BrokerError::UnknownUpstream { .. } => "unknown_upstream",
            BrokerError::ToolNotFound { .. } => "tool_not_found",
            BrokerError::AmbiguousTool { .. } => "ambiguous_tool",
            BrokerError::PolicyBlocked { .. } => "policy_blocked",
            BrokerError::PolicyConfirmationRequired { .. } => "policy_confirmation_required",
            BrokerError::TokenStoreIo { .. } => "token_store_io",
            BrokerError::OAuthCallbackTimeout { .. } => "oauth_callback_timeout",
            BrokerError::OAuthStateMismatch => "oauth_state_mismatch",
            BrokerError::NeedsManualAuth { .. } => "needs_manual_auth",
            BrokerError::IndexStoreIo { .. } => "index_store_io",
            BrokerError::IndexSchemaMismatch { .. } => "index_schema_mismatch",
            BrokerError::IpcUnauthorized => "ipc_unauthorized",
            BrokerError::IpcFrameTooLarge { .. } => "ipc_frame_too_large",
            BrokerError::IpcPeerGone { .. } => "ipc_peer_gone",
            BrokerError::MonitorCommandUnknown { .. } => "monitor_command_unknown",
            BrokerError::InstanceRegistryStale { .. } => "instance_registry_stale",
        }
    }

    /// True for the auth-shaped failures that should flip an upstream into
    /// `auth_pending` instead of plain `error`.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            BrokerError::UpstreamDialFailed {
                failure: DialFailure::Unauthorized { .. },
                ..
            } | BrokerError::NeedsManualAuth { .. }
        )
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(e: rusqlite::Error) -> Self {
        BrokerError::IndexStoreIo {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            BrokerError::UpstreamDialFailed {
                upstream: "fs".into(),
                failure: DialFailure::HandshakeTimeout { seconds: 10 },
            }
            .code(),
            "upstream_dial_failed"
        );
        assert_eq!(BrokerError::IpcUnauthorized.code(), "ipc_unauthorized");
    }

    #[test]
    fn unauthorized_dial_is_auth_shaped() {
        let err = BrokerError::UpstreamDialFailed {
            upstream: "linear".into(),
            failure: DialFailure::Unauthorized {
                reason: "401".into(),
            },
        };
        assert!(err.is_unauthorized());

        let err = BrokerError::UpstreamDialFailed {
            upstream: "fs".into(),
            failure: DialFailure::ExecutableNotFound {
                command: "npx".into(),
            },
        };
        assert!(!err.is_unauthorized());
    }

    #[test]
    fn manual_auth_message_names_the_subcommand() {
        let msg = BrokerError::NeedsManualAuth {
            upstream: "linear".into(),
        }
        .to_string();
        assert!(msg.contains("auth linear"));
    }
}
