//! Read-only monitor channel.
//!
//! A line-framed command socket for operators and dashboards: `ping`,
//! `stats`, `tools [limit]`, `upstreams`, `clients`. Strictly read-only; it
//! shares nothing with the daemon protocol except the endpoint flavors.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cataloger::Cataloger;
use crate::error::BrokerError;
use crate::instances::{Endpoint, IpcListener};
use crate::session::SessionView;
use crate::stats::BrokerStats;
use crate::util::now_ms;

const DEFAULT_TOOLS_LIMIT: usize = 20;

/// Supplier of the active session list (daemon sessions, or the lone
/// standalone session).
pub type SessionLister = Arc<dyn Fn() -> Vec<SessionView> + Send + Sync>;

/// Deterministic monitor endpoint derived from a primary (daemon/server)
/// endpoint: a `-monitor.sock` sibling for paths, port + 1 for TCP.
pub fn monitor_endpoint_for(primary: &Endpoint) -> Endpoint {
    match primary {
        Endpoint::Unix(path) => {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("broker");
            Endpoint::Unix(path.with_file_name(format!("{stem}-monitor.sock")))
        }
        Endpoint::Tcp(addr) => match addr
            .rsplit_once(':')
            .and_then(|(host, port)| port.parse::<u16>().ok().map(|p| (host, p)))
        {
            Some((host, port)) => Endpoint::Tcp(format!("{host}:{}", port.saturating_add(1))),
            None => Endpoint::Tcp(addr.clone()),
        },
    }
}

#[derive(Clone)]
pub struct MonitorDeps {
    pub stats: Arc<BrokerStats>,
    pub cataloger: Arc<Cataloger>,
    pub sessions: SessionLister,
}

pub struct MonitorServer {
    deps: MonitorDeps,
    endpoint: Endpoint,
    shutdown: CancellationToken,
}

impl MonitorServer {
    pub fn new(deps: MonitorDeps, endpoint: Endpoint) -> Self {
        Self {
            deps,
            endpoint,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> Result<(), BrokerError> {
        let listener =
            IpcListener::bind(&self.endpoint)
                .await
                .map_err(|e| BrokerError::IpcPeerGone {
                    reason: format!("bind {}: {e}", self.endpoint),
                })?;
        info!(endpoint = %self.endpoint, "monitor listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let deps = self.deps.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            let (read, mut write) = tokio::io::split(stream);
                            let mut lines = BufReader::new(read).lines();
                            loop {
                                tokio::select! {
                                    line = lines.next_line() => {
                                        let Ok(Some(line)) = line else { break };
                                        let mut reply = handle_command(&deps, &line);
                                        reply.push('\n');
                                        if write.write_all(reply.as_bytes()).await.is_err() {
                                            break;
                                        }
                                    }
                                    _ = shutdown.cancelled() => break,
                                }
                            }
                            debug!("monitor client disconnected");
                        });
                    }
                    Err(e) => warn!(error = %e, "monitor accept failed"),
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

/// Evaluate one command line into a reply line.
pub fn handle_command(deps: &MonitorDeps, line: &str) -> String {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");

    let outcome = match command {
        "ping" => Ok(json!("pong")),
        "stats" => Ok(json!(deps.stats.snapshot())),
        "tools" => {
            if deps.stats.tool_tracking_enabled() {
                let limit = parts
                    .next()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(DEFAULT_TOOLS_LIMIT);
                Ok(json!(deps.stats.tool_stats(limit)))
            } else {
                Err("tool tracking is disabled".to_string())
            }
        }
        "upstreams" => Ok(json!(deps.cataloger.views())),
        "clients" => Ok(json!((deps.sessions)())),
        other => Err(BrokerError::MonitorCommandUnknown {
            command: other.to_string(),
        }
        .to_string()),
    };

    let reply = match outcome {
        Ok(data) => json!({
            "status": "success",
            "data": data,
            "timestamp": now_ms(),
        }),
        Err(error) => json!({
            "status": "error",
            "error": error,
            "timestamp": now_ms(),
        }),
    };
    reply.to_string()
}

/// One-shot client used by `mcp-squared monitor <command>`.
pub async fn query(endpoint: &Endpoint, command: &str) -> Result<serde_json::Value, BrokerError> {
    let stream = crate::instances::connect_endpoint(endpoint)
        .await
        .map_err(|e| BrokerError::IpcPeerGone {
            reason: format!("connect {endpoint}: {e}"),
        })?;
    let (read, mut write) = tokio::io::split(stream);
    write
        .write_all(format!("{command}\n").as_bytes())
        .await
        .map_err(|e| BrokerError::IpcPeerGone {
            reason: e.to_string(),
        })?;
    let mut lines = BufReader::new(read).lines();
    let line = lines
        .next_line()
        .await
        .map_err(|e| BrokerError::IpcPeerGone {
            reason: e.to_string(),
        })?
        .ok_or_else(|| BrokerError::IpcPeerGone {
            reason: "monitor closed without a reply".to_string(),
        })?;
    serde_json::from_str(&line).map_err(|e| BrokerError::IpcPeerGone {
        reason: format!("malformed monitor reply: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use crate::cataloger::CatalogerOptions;
    use crate::oauth::TokenStore;

    fn deps(track_tools: bool) -> (TempDir, MonitorDeps) {
        let tmp = TempDir::new().unwrap();
        let token_store = Arc::new(TokenStore::new(tmp.path().join("oauth")));
        let cataloger = Arc::new(Cataloger::new(
            &BTreeMap::new(),
            token_store,
            CatalogerOptions::default(),
        ));
        let deps = MonitorDeps {
            stats: Arc::new(BrokerStats::new(track_tools)),
            cataloger,
            sessions: Arc::new(|| Vec::new()),
        };
        (tmp, deps)
    }

    fn parse(reply: &str) -> serde_json::Value {
        serde_json::from_str(reply).unwrap()
    }

    #[test]
    fn ping_replies_pong_with_timestamp() {
        let (_tmp, deps) = deps(false);
        let reply = parse(&handle_command(&deps, "ping"));
        assert_eq!(reply["status"], json!("success"));
        assert_eq!(reply["data"], json!("pong"));
        assert!(reply["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn stats_reports_counters() {
        let (_tmp, deps) = deps(false);
        deps.stats.record_request(true);
        let reply = parse(&handle_command(&deps, "stats"));
        assert_eq!(reply["data"]["totalRequests"], json!(1));
        assert_eq!(reply["data"]["successfulRequests"], json!(1));
    }

    #[test]
    fn tools_respects_tracking_flag_and_limit() {
        let (_tmp, deps) = deps(true);
        deps.stats.record_tool_call("fs:read", true);
        deps.stats.record_tool_call("db:query", true);
        let reply = parse(&handle_command(&deps, "tools 1"));
        assert_eq!(reply["status"], json!("success"));
        assert_eq!(reply["data"].as_array().unwrap().len(), 1);

        let (_tmp2, untracked) = deps_without_tracking();
        let reply = parse(&handle_command(&untracked, "tools"));
        assert_eq!(reply["status"], json!("error"));
    }

    fn deps_without_tracking() -> (TempDir, MonitorDeps) {
        deps(false)
    }

    #[test]
    fn unknown_command_is_an_error_reply() {
        let (_tmp, deps) = deps(false);
        let reply = parse(&handle_command(&deps, "self_destruct"));
        assert_eq!(reply["status"], json!("error"));
        assert!(
            reply["error"]
                .as_str()
                .unwrap()
                .contains("self_destruct")
        );
    }

    #[test]
    fn monitor_endpoint_is_a_sibling() {
        let unix = monitor_endpoint_for(&Endpoint::Unix("/run/m/daemon.sock".into()));
        assert_eq!(unix, Endpoint::Unix("/run/m/daemon-monitor.sock".into()));
        let tcp = monitor_endpoint_for(&Endpoint::Tcp("127.0.0.1:7800".into()));
        assert_eq!(tcp, Endpoint::Tcp("127.0.0.1:7801".into()));
    }

    #[test]
    fn upstreams_and_clients_reply_success() {
        let (_tmp, deps) = deps(false);
        let reply = parse(&handle_command(&deps, "upstreams"));
        assert_eq!(reply["status"], json!("success"));
        assert!(reply["data"].is_array());
        let reply = parse(&handle_command(&deps, "clients"));
        assert!(reply["data"].as_array().unwrap().is_empty());
    }
}
