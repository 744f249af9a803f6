//! MCP client handler for upstream connections.
//!
//! One handler per upstream connection. Its only live duty is reacting to
//! `notifications/tools/list_changed`: re-fetch the list, sanitize it, swap
//! it into the shared connection state, and emit a sync event so the
//! retriever re-indexes.

use rmcp::RoleClient;
use rmcp::handler::client::ClientHandler;
use rmcp::model::{ClientCapabilities, ClientInfo, Implementation, ProtocolVersion};
use rmcp::service::NotificationContext;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cataloger::CatalogEvent;
use crate::cataloger::connection::{SharedConnections, cataloged_from_rmcp};

pub struct BrokerClientHandler {
    upstream_key: String,
    client_impl: Implementation,
    connections: SharedConnections,
    events: broadcast::Sender<CatalogEvent>,
    description_cap: usize,
}

impl BrokerClientHandler {
    pub(crate) fn new(
        upstream_key: String,
        client_impl: Implementation,
        connections: SharedConnections,
        events: broadcast::Sender<CatalogEvent>,
        description_cap: usize,
    ) -> Self {
        Self {
            upstream_key,
            client_impl,
            connections,
            events,
            description_cap,
        }
    }
}

impl ClientHandler for BrokerClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            meta: None,
            protocol_version: ProtocolVersion::default(),
            capabilities: ClientCapabilities::default(),
            client_info: self.client_impl.clone(),
        }
    }

    async fn on_tool_list_changed(&self, context: NotificationContext<RoleClient>) -> () {
        let peer = context.peer;
        match peer.list_all_tools().await {
            Ok(tools) => {
                let cataloged = tools
                    .iter()
                    .map(|t| cataloged_from_rmcp(&self.upstream_key, t, self.description_cap))
                    .collect::<Vec<_>>();
                let count = cataloged.len();
                if let Some(state) = self.connections.lock().get_mut(&self.upstream_key) {
                    state.tools = cataloged;
                }
                info!(
                    upstream = %self.upstream_key,
                    tools = count,
                    "tool list refreshed after list_changed notification"
                );
                let _ = self.events.send(CatalogEvent::ToolsSynced {
                    upstream: self.upstream_key.clone(),
                });
            }
            Err(e) => {
                warn!(
                    upstream = %self.upstream_key,
                    error = %e,
                    "failed to refresh tool list after list_changed notification"
                );
            }
        }
    }
}
