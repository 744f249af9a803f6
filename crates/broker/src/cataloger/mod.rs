//! Upstream fleet manager.
//!
//! Owns one connection per enabled upstream: dialing, supervision,
//! re-authentication, tool listing and call forwarding. All sessions share
//! one cataloger; mutating operations are serialized per upstream key.

pub(crate) mod connection;
mod dial;
mod handler;

pub use connection::{UpstreamStatus, UpstreamView};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rmcp::model::{CallToolRequestParam, CallToolResult, Implementation};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use mcp_squared::config::{UpstreamConfig, UpstreamTransport};
use mcp_squared::naming::{ToolName, qualified};

use crate::cataloger::connection::{
    ConnectionState, SharedConnections, UpstreamView as View, cataloged_from_rmcp,
};
use crate::cataloger::dial::{dial_upstream, is_unauthorized_text};
use crate::cataloger::handler::BrokerClientHandler;
use crate::error::BrokerError;
use crate::model::CatalogedTool;
use crate::oauth::{TokenStore, authorize_upstream};

/// Change events published after every sync or status transition.
#[derive(Debug, Clone)]
pub enum CatalogEvent {
    ToolsSynced { upstream: String },
    StatusChanged {
        upstream: String,
        status: UpstreamStatus,
    },
}

#[derive(Debug, Clone)]
pub struct CatalogerOptions {
    pub client_name: String,
    pub client_version: String,
    pub dial_timeout: Duration,
    pub list_timeout: Duration,
    pub call_timeout: Duration,
    pub close_grace: Duration,
    /// Cap for the plain-error retry backoff; also the refresher period.
    pub refresh_interval: Duration,
    /// Whether dial failures may drive an interactive OAuth flow.
    pub interactive: bool,
    pub description_cap: usize,
}

impl Default for CatalogerOptions {
    fn default() -> Self {
        Self {
            client_name: "mcp-squared".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            dial_timeout: Duration::from_secs(10),
            list_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
            close_grace: Duration::from_secs(3),
            refresh_interval: Duration::from_millis(30_000),
            interactive: false,
            description_cap: mcp_squared::sanitize::DEFAULT_DESCRIPTION_CAP,
        }
    }
}

pub struct Cataloger {
    connections: SharedConnections,
    init_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    token_store: Arc<TokenStore>,
    events: broadcast::Sender<CatalogEvent>,
    options: CatalogerOptions,
}

impl Cataloger {
    pub fn new(
        upstreams: &BTreeMap<String, UpstreamConfig>,
        token_store: Arc<TokenStore>,
        options: CatalogerOptions,
    ) -> Self {
        let mut map = HashMap::new();
        for (key, config) in upstreams {
            if config.enabled {
                map.insert(key.clone(), ConnectionState::new(config.clone()));
            } else {
                debug!(upstream = %key, "skipping disabled upstream");
            }
        }
        let (events, _) = broadcast::channel(64);
        Self {
            connections: Arc::new(Mutex::new(map)),
            init_locks: Mutex::new(HashMap::new()),
            token_store,
            events,
            options,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    pub fn upstream_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.connections.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn client_impl(&self) -> Implementation {
        Implementation {
            name: self.options.client_name.clone(),
            version: self.options.client_version.clone(),
            ..Default::default()
        }
    }

    fn init_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.init_locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn set_status(&self, key: &str, status: UpstreamStatus) {
        if let Some(state) = self.connections.lock().get_mut(key) {
            state.set_status(status);
        }
        let _ = self.events.send(CatalogEvent::StatusChanged {
            upstream: key.to_string(),
            status,
        });
    }

    /// Dial every enabled upstream concurrently. Individual failures are
    /// recorded on the connection, not propagated.
    pub async fn connect_all(self: &Arc<Self>) {
        let mut join_set = JoinSet::new();
        for key in self.upstream_keys() {
            let this = self.clone();
            join_set.spawn(async move {
                if let Err(e) = this.connect(&key).await {
                    warn!(upstream = %key, error = %e, "initial connect failed");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    /// Dial one upstream from scratch, replacing any existing connection.
    pub async fn connect(self: &Arc<Self>, key: &str) -> Result<(), BrokerError> {
        let lock = self.init_lock(key);
        let _guard = lock.lock().await;

        let config = {
            let connections = self.connections.lock();
            let state = connections
                .get(key)
                .ok_or_else(|| BrokerError::UnknownUpstream {
                    upstream: key.to_string(),
                })?;
            state.config.clone()
        };

        // Drop a previous transport before re-dialing.
        if let Some(old) = self.connections.lock().get_mut(key).and_then(|s| {
            s.peer = None;
            s.service.take()
        }) {
            let grace = self.options.close_grace;
            tokio::spawn(async move {
                let _ = tokio::time::timeout(grace, old.cancel()).await;
            });
        }

        self.set_status(key, UpstreamStatus::Connecting);
        info!(upstream = %key, transport = config.transport.kind(), "dialing upstream");

        let mut attempted_auth = false;
        let service = loop {
            let handler = BrokerClientHandler::new(
                key.to_string(),
                self.client_impl(),
                self.connections.clone(),
                self.events.clone(),
                self.options.description_cap,
            );
            match dial_upstream(
                key,
                &config.transport,
                handler,
                &self.token_store,
                self.options.dial_timeout,
            )
            .await
            {
                Ok(service) => break service,
                Err(e) if e.is_unauthorized() => {
                    let auth = match &config.transport {
                        UpstreamTransport::StreamableHttp { url, auth: Some(auth), .. }
                            if auth.is_enabled() =>
                        {
                            Some((url.clone(), auth.clone()))
                        }
                        _ => None,
                    };
                    match auth {
                        Some((url, auth)) if self.options.interactive && !attempted_auth => {
                            attempted_auth = true;
                            info!(upstream = %key, "unauthorized; driving interactive OAuth flow");
                            if let Err(auth_err) = authorize_upstream(
                                key,
                                &url,
                                auth.callback_port(),
                                auth.client_name(),
                                true,
                                self.token_store.clone(),
                            )
                            .await
                            {
                                self.mark_auth_pending(key, &auth_err.to_string());
                                return Err(auth_err);
                            }
                            // Credentials changed; retry the dial once.
                            continue;
                        }
                        Some(_) | None => {
                            self.mark_auth_pending(key, &e.to_string());
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    self.mark_error(key, &e.to_string());
                    return Err(e);
                }
            }
        };

        let (server_name, server_version) = match service.peer_info() {
            Some(info) => (
                Some(info.server_info.name.to_string()),
                Some(info.server_info.version.to_string()),
            ),
            None => (None, None),
        };
        let peer = service.peer().clone();

        let tools =
            match tokio::time::timeout(self.options.list_timeout, peer.list_all_tools()).await {
                Ok(Ok(tools)) => tools,
                Ok(Err(e)) => {
                    let reason = e.to_string();
                    if is_unauthorized_text(&reason) {
                        self.mark_auth_pending(key, &reason);
                    } else {
                        self.mark_error(key, &reason);
                    }
                    return Err(BrokerError::UpstreamToolListFailed {
                        upstream: key.to_string(),
                        reason,
                    });
                }
                Err(_) => {
                    let reason = format!(
                        "list_tools timed out after {}s",
                        self.options.list_timeout.as_secs()
                    );
                    self.mark_error(key, &reason);
                    return Err(BrokerError::UpstreamToolListFailed {
                        upstream: key.to_string(),
                        reason,
                    });
                }
            };

        let cataloged: Vec<CatalogedTool> = tools
            .iter()
            .map(|t| cataloged_from_rmcp(key, t, self.options.description_cap))
            .collect();
        let count = cataloged.len();

        {
            let mut connections = self.connections.lock();
            if let Some(state) = connections.get_mut(key) {
                state.set_status(UpstreamStatus::Connected);
                state.last_error = None;
                state.server_name = server_name;
                state.server_version = server_version;
                state.tools = cataloged;
                state.service = Some(service);
                state.peer = Some(peer);
                state.retry_backoff = Duration::from_secs(1);
                state.next_retry_at = None;
            }
        }
        info!(upstream = %key, tools = count, "upstream connected");
        let _ = self.events.send(CatalogEvent::StatusChanged {
            upstream: key.to_string(),
            status: UpstreamStatus::Connected,
        });
        let _ = self.events.send(CatalogEvent::ToolsSynced {
            upstream: key.to_string(),
        });
        Ok(())
    }

    fn mark_auth_pending(&self, key: &str, detail: &str) {
        let version = self.token_store.auth_state_version(key);
        {
            let mut connections = self.connections.lock();
            if let Some(state) = connections.get_mut(key) {
                state.set_status(UpstreamStatus::AuthPending);
                state.auth_version_seen = version;
                state.last_error = Some(format!(
                    "OAuth authorization required; run `mcp-squared auth {key}` ({detail})"
                ));
                state.service = None;
                state.peer = None;
            }
        }
        let _ = self.events.send(CatalogEvent::StatusChanged {
            upstream: key.to_string(),
            status: UpstreamStatus::AuthPending,
        });
    }

    fn mark_error(&self, key: &str, detail: &str) {
        {
            let mut connections = self.connections.lock();
            if let Some(state) = connections.get_mut(key) {
                state.set_status(UpstreamStatus::Error);
                state.last_error = Some(detail.to_string());
                state.service = None;
                state.peer = None;
                let backoff = state.retry_backoff.min(self.options.refresh_interval);
                state.next_retry_at = Some(Instant::now() + backoff);
                state.retry_backoff =
                    (state.retry_backoff * 2).min(self.options.refresh_interval);
            }
        }
        let _ = self.events.send(CatalogEvent::StatusChanged {
            upstream: key.to_string(),
            status: UpstreamStatus::Error,
        });
    }

    /// Refresh one upstream per its current state:
    /// auth-pending upstreams re-dial only once credentials changed,
    /// connected upstreams re-list tools, broken ones re-dial after backoff.
    pub async fn refresh_tools(self: &Arc<Self>, key: &str) -> Result<(), BrokerError> {
        let (status, auth_version_seen, peer, retry_due) = {
            let connections = self.connections.lock();
            let state = connections
                .get(key)
                .ok_or_else(|| BrokerError::UnknownUpstream {
                    upstream: key.to_string(),
                })?;
            (
                state.status,
                state.auth_version_seen,
                state.peer.clone(),
                state
                    .next_retry_at
                    .is_none_or(|at| Instant::now() >= at),
            )
        };

        match status {
            UpstreamStatus::AuthPending => {
                if self.token_store.auth_state_version(key) > auth_version_seen {
                    info!(upstream = %key, "credentials changed; re-dialing");
                    self.connect(key).await
                } else {
                    Ok(())
                }
            }
            UpstreamStatus::Connected => {
                let Some(peer) = peer else {
                    return self.connect(key).await;
                };
                match tokio::time::timeout(self.options.list_timeout, peer.list_all_tools()).await
                {
                    Ok(Ok(tools)) => {
                        let cataloged: Vec<CatalogedTool> = tools
                            .iter()
                            .map(|t| cataloged_from_rmcp(key, t, self.options.description_cap))
                            .collect();
                        if let Some(state) = self.connections.lock().get_mut(key) {
                            state.tools = cataloged;
                        }
                        let _ = self.events.send(CatalogEvent::ToolsSynced {
                            upstream: key.to_string(),
                        });
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        let reason = e.to_string();
                        if is_unauthorized_text(&reason) {
                            self.mark_auth_pending(key, &reason);
                        } else {
                            self.mark_error(key, &reason);
                        }
                        Err(BrokerError::UpstreamToolListFailed {
                            upstream: key.to_string(),
                            reason,
                        })
                    }
                    Err(_) => {
                        let reason = "list_tools timed out".to_string();
                        self.mark_error(key, &reason);
                        Err(BrokerError::UpstreamToolListFailed {
                            upstream: key.to_string(),
                            reason,
                        })
                    }
                }
            }
            UpstreamStatus::Error | UpstreamStatus::Disconnected if retry_due => {
                self.connect(key).await
            }
            _ => Ok(()),
        }
    }

    /// Fan out [`Self::refresh_tools`] over the fleet; one upstream failing
    /// never aborts the sweep.
    pub async fn refresh_all(self: &Arc<Self>) {
        let mut join_set = JoinSet::new();
        for key in self.upstream_keys() {
            let this = self.clone();
            join_set.spawn(async move {
                if let Err(e) = this.refresh_tools(&key).await {
                    debug!(upstream = %key, error = %e, "refresh failed");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    /// Background refresher ticking at the configured interval.
    pub fn spawn_refresher(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.options.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; connect_all already ran.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.refresh_all().await;
            }
        })
    }

    /// Resolve a bare or qualified tool name to `(upstream, tool)`.
    pub fn resolve(&self, name: &str) -> Result<(String, String), BrokerError> {
        match ToolName::parse(name) {
            ToolName::Qualified { upstream, tool } => {
                let connections = self.connections.lock();
                if !connections.contains_key(&upstream) {
                    return Err(BrokerError::UnknownUpstream { upstream });
                }
                Ok((upstream, tool))
            }
            ToolName::Bare(tool) => {
                let connections = self.connections.lock();
                let mut owners: Vec<String> = connections
                    .iter()
                    .filter(|(_, state)| state.tools.iter().any(|t| t.name == tool))
                    .map(|(key, _)| key.clone())
                    .collect();
                owners.sort();
                match owners.len() {
                    0 => Err(BrokerError::ToolNotFound { tool }),
                    1 => Ok((owners.remove(0), tool)),
                    _ => Err(BrokerError::AmbiguousTool {
                        alternatives: owners
                            .iter()
                            .map(|key| qualified(key, &tool))
                            .collect(),
                        tool,
                    }),
                }
            }
        }
    }

    /// Forward a tool call to its upstream, returning the content verbatim.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult, BrokerError> {
        let (upstream, tool) = self.resolve(name)?;

        let peer = {
            let connections = self.connections.lock();
            let state =
                connections
                    .get(&upstream)
                    .ok_or_else(|| BrokerError::UnknownUpstream {
                        upstream: upstream.clone(),
                    })?;
            if state.status != UpstreamStatus::Connected {
                return Err(BrokerError::UpstreamNotConnected {
                    upstream: upstream.clone(),
                    status: state.status.to_string(),
                });
            }
            state.peer.clone().ok_or_else(|| BrokerError::UpstreamNotConnected {
                upstream: upstream.clone(),
                status: "missing transport".to_string(),
            })?
        };

        let request = CallToolRequestParam {
            meta: None,
            name: tool.clone().into(),
            arguments,
            task: None,
        };
        match tokio::time::timeout(self.options.call_timeout, peer.call_tool(request)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(BrokerError::UpstreamCallFailed {
                upstream,
                tool,
                reason: e.to_string(),
            }),
            Err(_) => Err(BrokerError::UpstreamCallFailed {
                upstream,
                tool,
                reason: format!("timed out after {}s", self.options.call_timeout.as_secs()),
            }),
        }
    }

    /// Union of every connected upstream's tools.
    pub fn all_tools(&self) -> Vec<CatalogedTool> {
        let connections = self.connections.lock();
        let mut tools: Vec<CatalogedTool> = connections
            .values()
            .flat_map(|state| state.tools.iter().cloned())
            .collect();
        tools.sort_by(|a, b| {
            a.upstream_key
                .cmp(&b.upstream_key)
                .then_with(|| a.name.cmp(&b.name))
        });
        tools
    }

    pub fn tools_for(&self, key: &str) -> Option<Vec<CatalogedTool>> {
        self.connections.lock().get(key).map(|s| s.tools.clone())
    }

    /// Bare tool names exposed by more than one upstream, with their
    /// qualified forms.
    pub fn conflict_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut by_bare: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for tool in self.all_tools() {
            by_bare
                .entry(tool.name.clone())
                .or_default()
                .push(tool.qualified_name());
        }
        by_bare.retain(|_, owners| owners.len() > 1);
        by_bare
    }

    pub fn views(&self) -> Vec<View> {
        let connections = self.connections.lock();
        let mut views: Vec<View> = connections
            .iter()
            .map(|(key, state)| View::from_state(key, state))
            .collect();
        views.sort_by(|a, b| a.key.cmp(&b.key));
        views
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|s| s.status == UpstreamStatus::Connected)
            .count()
    }

    /// Close every transport. The graceful cancel is awaited (bounded) so
    /// shutdown is deterministic; the child-process transport escalates to a
    /// kill when the graceful window elapses.
    pub async fn shutdown(&self) {
        let services: Vec<(String, connection::ClientService)> = {
            let mut connections = self.connections.lock();
            connections
                .iter_mut()
                .filter_map(|(key, state)| {
                    state.peer = None;
                    state.set_status(UpstreamStatus::Disconnected);
                    state.service.take().map(|s| (key.clone(), s))
                })
                .collect()
        };
        for (key, service) in services {
            match tokio::time::timeout(self.options.close_grace, service.cancel()).await {
                Ok(_) => debug!(upstream = %key, "transport closed"),
                Err(_) => warn!(upstream = %key, "transport close timed out; killing"),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_tools_for_test(&self, key: &str, tools: Vec<CatalogedTool>) {
        let mut connections = self.connections.lock();
        let state = connections
            .entry(key.to_string())
            .or_insert_with(|| {
                ConnectionState::new(UpstreamConfig {
                    enabled: true,
                    label: None,
                    transport: UpstreamTransport::Subprocess {
                        command: "true".into(),
                        args: vec![],
                        cwd: None,
                        env: BTreeMap::new(),
                    },
                })
            });
        state.status = UpstreamStatus::Connected;
        state.tools = tools;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::error::DialFailure;

    fn tool(upstream: &str, name: &str) -> CatalogedTool {
        CatalogedTool {
            upstream_key: upstream.into(),
            name: name.into(),
            description: None,
            input_schema: json!({"type": "object"}),
        }
    }

    fn cataloger() -> (TempDir, Arc<Cataloger>) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TokenStore::new(tmp.path().join("oauth")));
        let cataloger = Arc::new(Cataloger::new(
            &BTreeMap::new(),
            store,
            CatalogerOptions::default(),
        ));
        (tmp, cataloger)
    }

    #[test]
    fn resolve_qualified_and_bare() {
        let (_tmp, c) = cataloger();
        c.inject_tools_for_test("fs", vec![tool("fs", "read_file")]);
        c.inject_tools_for_test("db", vec![tool("db", "query")]);

        assert_eq!(
            c.resolve("fs:read_file").unwrap(),
            ("fs".to_string(), "read_file".to_string())
        );
        assert_eq!(
            c.resolve("query").unwrap(),
            ("db".to_string(), "query".to_string())
        );
        assert!(matches!(
            c.resolve("nope"),
            Err(BrokerError::ToolNotFound { .. })
        ));
        assert!(matches!(
            c.resolve("ghost:read"),
            Err(BrokerError::UnknownUpstream { .. })
        ));
    }

    #[test]
    fn resolve_reports_ambiguity_with_alternatives() {
        let (_tmp, c) = cataloger();
        c.inject_tools_for_test("fs", vec![tool("fs", "read_file")]);
        c.inject_tools_for_test("vault", vec![tool("vault", "read_file")]);

        match c.resolve("read_file") {
            Err(BrokerError::AmbiguousTool { alternatives, .. }) => {
                assert_eq!(alternatives, vec!["fs:read_file", "vault:read_file"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn conflict_map_lists_only_shared_bare_names() {
        let (_tmp, c) = cataloger();
        c.inject_tools_for_test("fs", vec![tool("fs", "read_file"), tool("fs", "stat")]);
        c.inject_tools_for_test("vault", vec![tool("vault", "read_file")]);

        let conflicts = c.conflict_map();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            conflicts["read_file"],
            vec!["fs:read_file", "vault:read_file"]
        );
    }

    #[tokio::test]
    async fn call_on_disconnected_upstream_is_typed() {
        let (_tmp, c) = cataloger();
        c.inject_tools_for_test("fs", vec![tool("fs", "read_file")]);
        {
            // Flip to error after injecting so the tool list stays resolvable
            // via the qualified form.
            let mut connections = c.connections.lock();
            connections.get_mut("fs").unwrap().status = UpstreamStatus::Error;
        }
        let err = c.call_tool("fs:read_file", None).await.unwrap_err();
        match err {
            BrokerError::UpstreamNotConnected { status, .. } => assert_eq!(status, "error"),
            other => panic!("expected UpstreamNotConnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dialing_missing_executable_is_typed() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TokenStore::new(tmp.path().join("oauth")));
        let mut upstreams = BTreeMap::new();
        upstreams.insert(
            "ghost".to_string(),
            UpstreamConfig {
                enabled: true,
                label: None,
                transport: UpstreamTransport::Subprocess {
                    command: "definitely-not-a-real-binary-mcp2".into(),
                    args: vec![],
                    cwd: None,
                    env: BTreeMap::new(),
                },
            },
        );
        let cataloger = Arc::new(Cataloger::new(
            &upstreams,
            store,
            CatalogerOptions::default(),
        ));

        let err = cataloger.connect("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::UpstreamDialFailed {
                failure: DialFailure::ExecutableNotFound { .. },
                ..
            }
        ));
        let views = cataloger.views();
        assert_eq!(views[0].status, UpstreamStatus::Error);
        assert!(views[0].error.is_some());
    }

    #[tokio::test]
    async fn auth_pending_redials_only_after_credentials_change() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TokenStore::new(tmp.path().join("oauth")));
        let mut upstreams = BTreeMap::new();
        upstreams.insert(
            "linear".to_string(),
            UpstreamConfig {
                enabled: true,
                label: None,
                transport: UpstreamTransport::Subprocess {
                    command: "definitely-not-a-real-binary-mcp2".into(),
                    args: vec![],
                    cwd: None,
                    env: BTreeMap::new(),
                },
            },
        );
        let cataloger = Arc::new(Cataloger::new(
            &upstreams,
            store.clone(),
            CatalogerOptions::default(),
        ));

        cataloger.mark_auth_pending("linear", "401 from server");
        assert_eq!(cataloger.views()[0].status, UpstreamStatus::AuthPending);

        // Token store unchanged: the refresh is a no-op, state untouched.
        cataloger.refresh_tools("linear").await.unwrap();
        assert_eq!(cataloger.views()[0].status, UpstreamStatus::AuthPending);

        // New credentials bump the version; the next refresh re-dials (and
        // here fails on the missing executable, leaving a plain error).
        store
            .save("linear", &crate::oauth::StoredCredentials::default())
            .unwrap();
        let err = cataloger.refresh_tools("linear").await.unwrap_err();
        assert!(matches!(err, BrokerError::UpstreamDialFailed { .. }));
        assert_eq!(cataloger.views()[0].status, UpstreamStatus::Error);
    }

    #[test]
    fn disabled_upstreams_are_not_tracked() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TokenStore::new(tmp.path().join("oauth")));
        let mut upstreams = BTreeMap::new();
        upstreams.insert(
            "off".to_string(),
            UpstreamConfig {
                enabled: false,
                label: None,
                transport: UpstreamTransport::Subprocess {
                    command: "true".into(),
                    args: vec![],
                    cwd: None,
                    env: BTreeMap::new(),
                },
            },
        );
        let cataloger = Cataloger::new(&upstreams, store, CatalogerOptions::default());
        assert!(cataloger.upstream_keys().is_empty());
    }
}
