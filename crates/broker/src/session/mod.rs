//! Per-client session server exposing the meta-tools.
//!
//! Each connected client gets one `SessionServer`: an MCP server advertising
//! exactly `find_tools`, `describe_tools`, `execute`, `list_namespaces` and
//! `clear_selection_cache`. All sessions share the cataloger, retriever,
//! policy engine and stats; the session itself only carries its recent
//! find-tools buffer and liveness timestamps.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::{ErrorData as McpError, ServerHandler, schemars, tool, tool_handler, tool_router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::debug;

use mcp_squared::config::{DetailLevel, OperationsConfig, SearchMode};
use mcp_squared::naming::qualified;
use mcp_squared::policy::{Decision, PolicyEngine};

use crate::cataloger::Cataloger;
use crate::error::BrokerError;
use crate::retriever::{Retriever, SearchOptions};
use crate::stats::BrokerStats;
use crate::util::now_ms;

/// How many find_tools result sets each session remembers.
const RECENT_FIND_SETS: usize = 5;

/// Shared dependencies handed to every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub cataloger: Arc<Cataloger>,
    pub retriever: Arc<Retriever>,
    pub policy: Arc<PolicyEngine>,
    pub stats: Arc<BrokerStats>,
    pub operations: OperationsConfig,
    /// Global admission pool capping concurrent in-flight executes.
    pub execute_permits: Arc<Semaphore>,
}

/// Read-only session descriptor for the monitor's `clients` command.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub connected_at: i64,
    pub last_seen: i64,
    pub is_owner: bool,
}

struct SessionState {
    session_id: String,
    client_id: Option<String>,
    is_owner: bool,
    connected_at: i64,
    last_seen: Mutex<i64>,
    recent_finds: Mutex<VecDeque<Vec<String>>>,
}

#[derive(Clone)]
pub struct SessionServer {
    deps: SessionDeps,
    state: Arc<SessionState>,
    tool_router: ToolRouter<Self>,
}

// --- Meta-tool parameter structs ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct FindToolsParams {
    /// What the caller is trying to do, in natural language.
    pub query: String,
    /// Maximum number of results (server-side cap applies).
    #[serde(default)]
    pub limit: Option<usize>,
    /// Search mode: "fast", "semantic" or "hybrid".
    #[serde(default)]
    pub mode: Option<String>,
    /// Detail level: "L0" names, "L1" + descriptions, "L2" + input schemas.
    #[serde(default)]
    pub detail_level: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DescribeToolsParams {
    /// Tool names, bare or qualified as `upstream:tool`.
    pub names: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ExecuteParams {
    /// Tool to invoke, bare or qualified as `upstream:tool`.
    pub tool_name: String,
    /// Arguments forwarded verbatim to the upstream tool.
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
    /// Single-use token from a prior confirmation-required reply.
    #[serde(default)]
    pub confirmation_token: Option<String>,
}

impl SessionServer {
    pub fn new(deps: SessionDeps, session_id: String, client_id: Option<String>) -> Self {
        Self::with_ownership(deps, session_id, client_id, false)
    }

    pub fn with_ownership(
        deps: SessionDeps,
        session_id: String,
        client_id: Option<String>,
        is_owner: bool,
    ) -> Self {
        let now = now_ms();
        Self {
            deps,
            state: Arc::new(SessionState {
                session_id,
                client_id,
                is_owner,
                connected_at: now,
                last_seen: Mutex::new(now),
                recent_finds: Mutex::new(VecDeque::new()),
            }),
            tool_router: Self::tool_router(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.state.session_id.clone(),
            client_id: self.state.client_id.clone(),
            connected_at: self.state.connected_at,
            last_seen: *self.state.last_seen.lock(),
            is_owner: self.state.is_owner,
        }
    }

    fn touch(&self) {
        *self.state.last_seen.lock() = now_ms();
    }

    fn remember_find(&self, names: Vec<String>) {
        if names.is_empty() {
            return;
        }
        let mut recents = self.state.recent_finds.lock();
        recents.push_back(names);
        while recents.len() > RECENT_FIND_SETS {
            recents.pop_front();
        }
    }

    fn last_find_set(&self) -> Option<Vec<String>> {
        self.state.recent_finds.lock().back().cloned()
    }

    fn json_result(value: serde_json::Value) -> Result<CallToolResult, McpError> {
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    fn json_error(value: serde_json::Value) -> Result<CallToolResult, McpError> {
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::error(vec![Content::text(text)]))
    }

    fn parse_mode(mode: Option<&str>) -> Result<Option<SearchMode>, String> {
        match mode {
            None => Ok(None),
            Some("fast") => Ok(Some(SearchMode::Fast)),
            Some("semantic") => Ok(Some(SearchMode::Semantic)),
            Some("hybrid") => Ok(Some(SearchMode::Hybrid)),
            Some(other) => Err(format!(
                "unknown mode '{other}'; expected fast, semantic or hybrid"
            )),
        }
    }

    fn parse_detail(&self, detail: Option<&str>) -> Result<DetailLevel, String> {
        match detail {
            None => Ok(self.deps.operations.find_tools.default_detail_level),
            Some("L0") | Some("l0") => Ok(DetailLevel::L0),
            Some("L1") | Some("l1") => Ok(DetailLevel::L1),
            Some("L2") | Some("l2") => Ok(DetailLevel::L2),
            Some(other) => Err(format!(
                "unknown detail level '{other}'; expected L0, L1 or L2"
            )),
        }
    }
}

#[tool_router]
impl SessionServer {
    #[tool(
        description = "Search the catalog of upstream tools by task description. Returns ranked matches with a requiresConfirmation flag, plus frequently co-used tool suggestions."
    )]
    async fn find_tools(
        &self,
        Parameters(params): Parameters<FindToolsParams>,
    ) -> Result<CallToolResult, McpError> {
        self.touch();

        let mode = match Self::parse_mode(params.mode.as_deref()) {
            Ok(mode) => mode,
            Err(reason) => {
                self.deps.stats.record_request(false);
                return Self::json_error(json!({ "error": reason }));
            }
        };
        let detail = match self.parse_detail(params.detail_level.as_deref()) {
            Ok(detail) => detail,
            Err(reason) => {
                self.deps.stats.record_request(false);
                return Self::json_error(json!({ "error": reason }));
            }
        };

        let results = match self
            .deps
            .retriever
            .search(
                &params.query,
                SearchOptions {
                    limit: params.limit,
                    mode,
                },
            )
            .await
        {
            Ok(results) => results,
            Err(e) => {
                self.deps.stats.record_request(false);
                return Self::json_error(json!({ "error": e.to_string() }));
            }
        };

        // Policy filtering preserves the ranking.
        let mut visible = Vec::new();
        let mut qualified_names = Vec::new();
        for hit in results.hits {
            let tool = &hit.tool.tool;
            let visibility = self
                .deps
                .policy
                .visibility(&tool.upstream_key, &tool.name);
            if !visibility.visible {
                continue;
            }
            let name = tool.qualified_name();
            let mut entry = json!({
                "name": name,
                "upstreamKey": tool.upstream_key,
                "requiresConfirmation": visibility.requires_confirmation,
            });
            if detail >= DetailLevel::L1
                && let Some(description) = &tool.description
            {
                entry["description"] = json!(description);
            }
            if detail >= DetailLevel::L2 {
                entry["inputSchema"] = tool.input_schema.clone();
            }
            qualified_names.push(name);
            visible.push(entry);
        }

        let mut response = json!({
            "tools": visible,
            "query": params.query,
            "totalMatches": results.total_matches,
        });

        let cache = &self.deps.operations.selection_cache;
        if cache.enabled && !qualified_names.is_empty() {
            match self
                .deps
                .retriever
                .get_suggested_bundles(
                    &qualified_names,
                    cache.min_cooccurrence_threshold,
                    cache.max_bundle_suggestions,
                )
                .await
            {
                Ok(suggestions) if !suggestions.is_empty() => {
                    self.deps.stats.record_cache_hit();
                    response["suggestions"] = json!(suggestions);
                }
                Ok(_) => self.deps.stats.record_cache_miss(),
                Err(e) => debug!(error = %e, "bundle suggestion lookup failed"),
            }
        }

        self.remember_find(qualified_names);
        self.deps.stats.record_request(true);
        Self::json_result(response)
    }

    #[tool(
        description = "Describe tools by name (bare or upstream-qualified), including their input schemas. Ambiguous bare names are reported with their qualified alternatives."
    )]
    async fn describe_tools(
        &self,
        Parameters(params): Parameters<DescribeToolsParams>,
    ) -> Result<CallToolResult, McpError> {
        self.touch();

        let (tools, ambiguous) = match self.deps.retriever.get_tools(&params.names).await {
            Ok(partitioned) => partitioned,
            Err(e) => {
                self.deps.stats.record_request(false);
                return Self::json_error(json!({ "error": e.to_string() }));
            }
        };

        let described: Vec<serde_json::Value> = tools
            .iter()
            .filter_map(|indexed| {
                let tool = &indexed.tool;
                let visibility = self
                    .deps
                    .policy
                    .visibility(&tool.upstream_key, &tool.name);
                // Hidden tools are omitted silently.
                if !visibility.visible {
                    return None;
                }
                Some(json!({
                    "name": tool.qualified_name(),
                    "upstreamKey": tool.upstream_key,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                    "requiresConfirmation": visibility.requires_confirmation,
                }))
            })
            .collect();

        self.deps.stats.record_request(true);
        Self::json_result(json!({
            "tools": described,
            "ambiguous": ambiguous,
        }))
    }

    #[tool(
        description = "Execute an upstream tool. Blocked tools return an error; confirm-listed tools return a single-use confirmation_token to pass on the next call."
    )]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        self.touch();

        let _permit = self
            .deps
            .execute_permits
            .acquire()
            .await
            .map_err(|_| McpError::internal_error("broker is shutting down", None))?;

        let (upstream, bare) = match self.deps.cataloger.resolve(&params.tool_name) {
            Ok(resolved) => resolved,
            Err(e @ BrokerError::AmbiguousTool { .. }) => {
                self.deps.stats.record_request(false);
                let alternatives = match &e {
                    BrokerError::AmbiguousTool { alternatives, .. } => alternatives.clone(),
                    _ => unreachable!(),
                };
                return Self::json_error(json!({
                    "error": e.to_string(),
                    "ambiguous": true,
                    "alternatives": alternatives,
                }));
            }
            Err(e) => {
                self.deps.stats.record_request(false);
                return Self::json_error(json!({ "error": e.to_string(), "code": e.code() }));
            }
        };

        let decision =
            self.deps
                .policy
                .evaluate(&upstream, &bare, params.confirmation_token.as_deref());
        match decision {
            Decision::Block { reason } => {
                self.deps.stats.record_request(false);
                Self::json_error(json!({ "blocked": true, "reason": reason }))
            }
            Decision::Confirm { token, reason } => {
                // A guarded outcome, not an error: the client retries with
                // the token, bare or qualified either way.
                self.deps.stats.record_request(true);
                Self::json_result(json!({
                    "requires_confirmation": true,
                    "confirmation_token": token,
                    "reason": reason,
                }))
            }
            Decision::Allow => {
                let arguments = match params.arguments {
                    Some(serde_json::Value::Object(map)) => Some(map),
                    Some(serde_json::Value::Null) | None => None,
                    Some(other) => {
                        self.deps.stats.record_request(false);
                        return Self::json_error(json!({
                            "error": format!("arguments must be an object, got {other}"),
                        }));
                    }
                };

                let target = qualified(&upstream, &bare);
                match self.deps.cataloger.call_tool(&target, arguments).await {
                    Ok(result) => {
                        self.deps.stats.record_request(true);
                        self.deps.stats.record_tool_call(&target, true);
                        self.record_execution_cooccurrence(target);
                        Ok(result)
                    }
                    Err(e) => {
                        self.deps.stats.record_request(false);
                        self.deps.stats.record_tool_call(&target, false);
                        Self::json_error(json!({ "error": e.to_string(), "code": e.code() }))
                    }
                }
            }
        }
    }

    #[tool(
        description = "List every configured upstream with its connection status, server identity and tool count, plus the map of bare tool names exposed by more than one upstream."
    )]
    async fn list_namespaces(&self) -> Result<CallToolResult, McpError> {
        self.touch();
        let upstreams = self.deps.cataloger.views();
        let conflicts = self.deps.cataloger.conflict_map();
        self.deps.stats.record_request(true);
        Self::json_result(json!({
            "upstreams": upstreams,
            "conflicts": conflicts,
        }))
    }

    #[tool(description = "Reset the co-occurrence counters behind bundle suggestions.")]
    async fn clear_selection_cache(&self) -> Result<CallToolResult, McpError> {
        self.touch();
        match self.deps.retriever.clear_cooccurrences().await {
            Ok(prior) => {
                self.deps.stats.set_cache_size(0);
                self.deps.stats.record_request(true);
                Self::json_result(json!({ "cleared": prior }))
            }
            Err(e) => {
                self.deps.stats.record_request(false);
                Self::json_error(json!({ "error": e.to_string() }))
            }
        }
    }
}

impl SessionServer {
    /// Feed the co-occurrence counter off the critical path: the executed
    /// tool plus the most recent find_tools result set.
    fn record_execution_cooccurrence(&self, executed: String) {
        let Some(mut names) = self.last_find_set() else {
            return;
        };
        if !names.contains(&executed) {
            names.push(executed);
        }
        if names.len() < 2 {
            return;
        }
        let retriever = self.deps.retriever.clone();
        let stats = self.deps.stats.clone();
        tokio::spawn(async move {
            if let Err(e) = retriever.record_cooccurrences(names).await {
                debug!(error = %e, "co-occurrence record failed");
            } else if let Ok(count) = retriever.get_cooccurrence_count().await {
                stats.set_cache_size(count as u64);
            }
        });
    }
}

#[tool_handler]
impl ServerHandler for SessionServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "mcp-squared brokers many upstream MCP servers behind a compact meta-tool \
                 surface.\n\n\
                 Workflow:\n\
                 1. find_tools(\"what you need\") -> ranked candidates (names + flags)\n\
                 2. describe_tools([names]) -> full input schemas when you are ready to call\n\
                 3. execute(tool_name, arguments) -> runs the upstream tool\n\n\
                 If execute returns requires_confirmation, repeat the same call with the \
                 provided confirmation_token; tokens are single-use. Tool names may be bare \
                 or qualified as upstream:tool; use list_namespaces to inspect upstreams \
                 and naming conflicts."
                    .into(),
            ),
            ..Default::default()
        }
    }
}
