//! Per-upstream connection state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rmcp::RoleClient;
use rmcp::service::{RunningService, ServerSink};
use serde::Serialize;

use mcp_squared::config::UpstreamConfig;
use mcp_squared::sanitize::{sanitize_description, sanitize_tool_name};

use crate::cataloger::handler::BrokerClientHandler;
use crate::model::CatalogedTool;

pub(crate) type ClientService = RunningService<RoleClient, BrokerClientHandler>;

/// Where an upstream currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    AuthPending,
}

impl std::fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpstreamStatus::Disconnected => "disconnected",
            UpstreamStatus::Connecting => "connecting",
            UpstreamStatus::Connected => "connected",
            UpstreamStatus::Error => "error",
            UpstreamStatus::AuthPending => "auth_pending",
        };
        f.write_str(s)
    }
}

/// Mutable runtime state for one upstream. Owned exclusively by the
/// cataloger; everything handed out is a copy or a [`UpstreamView`].
pub(crate) struct ConnectionState {
    pub config: UpstreamConfig,
    pub status: UpstreamStatus,
    pub last_error: Option<String>,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub tools: Vec<CatalogedTool>,
    /// Token-store version remembered when auth became pending.
    pub auth_version_seen: u64,
    /// Backoff bookkeeping for plain (non-auth) errors.
    pub retry_backoff: Duration,
    pub next_retry_at: Option<Instant>,
    pub service: Option<ClientService>,
    pub peer: Option<ServerSink>,
}

impl ConnectionState {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            status: UpstreamStatus::Disconnected,
            last_error: None,
            server_name: None,
            server_version: None,
            tools: Vec::new(),
            auth_version_seen: 0,
            retry_backoff: Duration::from_secs(1),
            next_retry_at: None,
            service: None,
            peer: None,
        }
    }

    /// Tools are only valid while connected; leaving that state clears them.
    pub fn set_status(&mut self, status: UpstreamStatus) {
        if status != UpstreamStatus::Connected {
            self.tools.clear();
        }
        self.status = status;
    }
}

pub(crate) type SharedConnections = Arc<Mutex<HashMap<String, ConnectionState>>>;

/// Read-only snapshot of one upstream for `list_namespaces` and the monitor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamView {
    pub key: String,
    pub status: UpstreamStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    pub tool_count: usize,
    pub transport: &'static str,
    pub auth_pending: bool,
}

impl UpstreamView {
    pub(crate) fn from_state(key: &str, state: &ConnectionState) -> Self {
        Self {
            key: key.to_string(),
            status: state.status,
            error: state.last_error.clone(),
            server_name: state.server_name.clone(),
            server_version: state.server_version.clone(),
            tool_count: state.tools.len(),
            transport: state.config.transport.kind(),
            auth_pending: state.status == UpstreamStatus::AuthPending,
        }
    }
}

/// Normalize one upstream-supplied tool into the catalog form.
pub(crate) fn cataloged_from_rmcp(
    upstream_key: &str,
    tool: &rmcp::model::Tool,
    description_cap: usize,
) -> CatalogedTool {
    let description = tool
        .description
        .as_deref()
        .map(|d| sanitize_description(d, description_cap))
        .filter(|d| !d.is_empty());
    CatalogedTool {
        upstream_key: upstream_key.to_string(),
        name: sanitize_tool_name(&tool.name),
        description,
        input_schema: serde_json::Value::Object(tool.input_schema.as_ref().clone()),
    }
}
