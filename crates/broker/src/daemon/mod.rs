//! Shared daemon: owns the upstream fleet and serves many ephemeral proxy
//! clients over a local socket.
//!
//! Each client connection performs a hello/welcome handshake (optionally
//! secret-gated), then speaks MCP wrapped in line-framed JSON. Every session
//! gets its own [`SessionServer`] bridged over an in-memory duplex pipe, so
//! the daemon never interprets MCP payloads itself.

pub mod frames;

pub use frames::{Frame, MAX_FRAME_BYTES, PROTOCOL_VERSION, ServerMeta};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rmcp::ServiceExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::instances::{BoxedStream, Endpoint, IpcListener};
use crate::session::{SessionDeps, SessionServer, SessionView};

/// How often the daemon pings a client; silence past twice this reaps the
/// session.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

async fn send_frame(tx: &mpsc::Sender<Frame>, frame: Frame) {
    let _ = tx.send(frame).await;
}

#[derive(Clone)]
pub struct DaemonOptions {
    pub endpoint: Endpoint,
    pub secret: Option<String>,
    pub heartbeat_interval: Duration,
}

struct SessionEntry {
    server: SessionServer,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

pub struct Daemon {
    deps: SessionDeps,
    options: DaemonOptions,
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(deps: SessionDeps, options: DaemonOptions) -> Arc<Self> {
        Arc::new(Self {
            deps,
            options,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn session_views(&self) -> Vec<SessionView> {
        let sessions = self.sessions.lock();
        let mut views: Vec<SessionView> =
            sessions.values().map(|s| s.server.view()).collect();
        views.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        views
    }

    /// Accept connections until the shutdown token fires, then notify every
    /// live session and remove the socket endpoint.
    pub async fn run(self: &Arc<Self>) -> Result<(), BrokerError> {
        let listener =
            IpcListener::bind(&self.options.endpoint)
                .await
                .map_err(|e| BrokerError::IpcPeerGone {
                    reason: format!("bind {}: {e}", self.options.endpoint),
                })?;
        info!(endpoint = %self.options.endpoint, "daemon listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let daemon = self.clone();
                        tokio::spawn(async move { daemon.handle_conn(stream).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        // Tell every session the daemon is going away before the socket
        // disappears; reconnecting clients will find (or spawn) a new one.
        let entries: Vec<(String, mpsc::Sender<Frame>, CancellationToken)> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .map(|(id, s)| (id.clone(), s.outbound.clone(), s.cancel.clone()))
                .collect()
        };
        for (id, outbound, cancel) in entries {
            let _ = outbound
                .send(Frame::Shutdown {
                    reason: "daemon terminating".to_string(),
                })
                .await;
            cancel.cancel();
            debug!(session = %id, "session notified of shutdown");
        }

        if let Endpoint::Unix(path) = &self.options.endpoint {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    pub(crate) async fn handle_conn(self: Arc<Self>, stream: BoxedStream) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();

        // Writer task: one per connection, fed by a bounded queue so a slow
        // peer backpressures instead of ballooning memory.
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(64);
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let Ok(line) = frame.encode() else { break };
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Handshake: first frame must be a valid hello.
        let hello = tokio::time::timeout(Duration::from_secs(10), lines.next_line()).await;
        let (session_id, client_id) = match hello {
            Ok(Ok(Some(line))) => match Frame::parse(&line) {
                Ok(Frame::Hello {
                    protocol,
                    session_id,
                    client_id,
                    token,
                }) => {
                    if protocol != PROTOCOL_VERSION {
                        send_frame(&outbound_tx, Frame::Error {
                            reason: format!(
                                "unsupported protocol {protocol}, expected {PROTOCOL_VERSION}"
                            ),
                        })
                        .await;
                        drop(outbound_tx);
                        let _ = writer.await;
                        return;
                    }
                    if let Some(secret) = &self.options.secret
                        && token.as_deref() != Some(secret.as_str())
                    {
                        warn!(session = %session_id, "rejected unauthorized hello");
                        send_frame(&outbound_tx, Frame::Error {
                            reason: "unauthorized".to_string(),
                        })
                        .await;
                        drop(outbound_tx);
                        let _ = writer.await;
                        return;
                    }
                    (session_id, client_id)
                }
                _ => {
                    send_frame(&outbound_tx, Frame::Error {
                        reason: "expected hello frame".to_string(),
                    })
                    .await;
                    drop(outbound_tx);
                    let _ = writer.await;
                    return;
                }
            },
            _ => {
                drop(outbound_tx);
                let _ = writer.await;
                return;
            }
        };

        let is_owner = self.sessions.lock().is_empty();
        let session =
            SessionServer::with_ownership(self.deps.clone(), session_id.clone(), client_id, is_owner);
        self.deps.stats.connection_opened();

        // Bridge: the session server speaks MCP over an in-memory pipe; this
        // connection shuttles lines between the pipe and the socket.
        let (client_io, server_io) = tokio::io::duplex(MAX_FRAME_BYTES);
        let running = match session.clone().serve(server_io).await {
            Ok(running) => running,
            Err(e) => {
                warn!(session = %session_id, error = %e, "session server failed to start");
                send_frame(&outbound_tx, Frame::Error {
                    reason: format!("session start failed: {e}"),
                })
                .await;
                self.deps.stats.connection_closed();
                drop(outbound_tx);
                let _ = writer.await;
                return;
            }
        };

        let cancel = CancellationToken::new();
        self.sessions.lock().insert(
            session_id.clone(),
            SessionEntry {
                server: session.clone(),
                outbound: outbound_tx.clone(),
                cancel: cancel.clone(),
            },
        );

        send_frame(&outbound_tx, Frame::Welcome {
            session_id: session_id.clone(),
            server_info: ServerMeta::default(),
        })
        .await;
        info!(session = %session_id, owner = is_owner, "session opened");

        let (session_read, mut session_write) = tokio::io::split(client_io);

        // Session → socket: responses and unsolicited notifications alike.
        let from_session = {
            let tx = outbound_tx.clone();
            let session_id = session_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(session_read).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                let Ok(payload) = serde_json::from_str(&line) else {
                                    continue;
                                };
                                if tx
                                    .send(Frame::Mcp {
                                        session_id: session_id.clone(),
                                        payload,
                                    })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            _ => break,
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
            })
        };

        // Heartbeat: ping every interval, reap after two silent intervals.
        let last_seen = Arc::new(Mutex::new(Instant::now()));
        let heartbeat = {
            let tx = outbound_tx.clone();
            let last_seen = last_seen.clone();
            let cancel = cancel.clone();
            let interval = self.options.heartbeat_interval;
            let session_id = session_id.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if last_seen.lock().elapsed() > interval * 2 {
                                warn!(session = %session_id, "heartbeat lost; reaping session");
                                cancel.cancel();
                                break;
                            }
                            if tx.send(Frame::Ping).await.is_err() {
                                break;
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            })
        };

        // Socket → session.
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        _ => break,
                    };
                    *last_seen.lock() = Instant::now();
                    match Frame::parse(&line) {
                        Ok(Frame::Mcp { session_id: target, payload }) => {
                            if target != session_id {
                                send_frame(&outbound_tx, Frame::Error {
                                    reason: format!("unknown session '{target}'"),
                                })
                                .await;
                                continue;
                            }
                            let mut line = payload.to_string();
                            line.push('\n');
                            if session_write.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Frame::Ping) => send_frame(&outbound_tx, Frame::Pong).await,
                        Ok(Frame::Pong) => {}
                        Ok(Frame::Shutdown { .. }) => break,
                        Ok(Frame::Hello { .. }) => {
                            send_frame(&outbound_tx, Frame::Error {
                                reason: "session already established".to_string(),
                            })
                            .await;
                        }
                        Ok(Frame::Welcome { .. }) | Ok(Frame::Error { .. }) => {
                            debug!(session = %session_id, "ignoring server-only frame from client");
                        }
                        Err(e @ BrokerError::IpcFrameTooLarge { .. }) => {
                            send_frame(&outbound_tx, Frame::Error { reason: e.to_string() }).await;
                            break;
                        }
                        Err(e) => {
                            send_frame(&outbound_tx, Frame::Error { reason: e.to_string() }).await;
                        }
                    }
                }
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
            }
        }

        // Teardown in reverse order of creation.
        cancel.cancel();
        let _ = running.cancel().await;
        heartbeat.abort();
        from_session.abort();
        self.sessions.lock().remove(&session_id);
        self.deps.stats.connection_closed();
        drop(outbound_tx);
        let _ = writer.await;
        info!(session = %session_id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::Semaphore;

    use mcp_squared::config::OperationsConfig;
    use mcp_squared::policy::{PolicyEngine, SecurityPolicy};

    use crate::cataloger::{Cataloger, CatalogerOptions};
    use crate::index::{IndexStore, NoopEmbedder};
    use crate::oauth::TokenStore;
    use crate::retriever::Retriever;
    use crate::stats::BrokerStats;

    async fn daemon(secret: Option<&str>) -> (TempDir, Arc<Daemon>) {
        let tmp = TempDir::new().unwrap();
        let token_store = Arc::new(TokenStore::new(tmp.path().join("oauth")));
        let cataloger = Arc::new(Cataloger::new(
            &BTreeMap::new(),
            token_store,
            CatalogerOptions::default(),
        ));
        let store = IndexStore::open_in_memory().await.unwrap();
        let retriever = Arc::new(Retriever::new(
            store,
            cataloger.clone(),
            Arc::new(NoopEmbedder),
            Default::default(),
        ));
        let deps = SessionDeps {
            cataloger,
            retriever,
            policy: Arc::new(
                PolicyEngine::compile(
                    &SecurityPolicy::permissive(),
                    Duration::from_secs(600),
                )
                .unwrap(),
            ),
            stats: Arc::new(BrokerStats::new(false)),
            operations: OperationsConfig::default(),
            execute_permits: Arc::new(Semaphore::new(4)),
        };
        let daemon = Daemon::new(
            deps,
            DaemonOptions {
                endpoint: Endpoint::Unix(tmp.path().join("daemon.sock")),
                secret: secret.map(str::to_string),
                heartbeat_interval: Duration::from_secs(15),
            },
        );
        (tmp, daemon)
    }

    async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> Frame {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("read timed out")
            .expect("read failed")
            .expect("stream closed");
        Frame::parse(&line).expect("valid frame")
    }

    #[tokio::test]
    async fn handshake_yields_welcome_and_tracks_session() {
        let (_tmp, daemon) = daemon(None).await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(daemon.clone().handle_conn(Box::pin(server)));

        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        let hello = Frame::Hello {
            protocol: PROTOCOL_VERSION,
            session_id: "sess-42".into(),
            client_id: Some("test-ide".into()),
            token: None,
        };
        write.write_all(hello.encode().unwrap().as_bytes()).await.unwrap();

        match read_frame(&mut lines).await {
            Frame::Welcome { session_id, server_info } => {
                assert_eq!(session_id, "sess-42");
                assert_eq!(server_info.name, "mcp-squared");
            }
            other => panic!("expected welcome, got {other:?}"),
        }

        let views = daemon.session_views();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].id, "sess-42");
        assert_eq!(views[0].client_id.as_deref(), Some("test-ide"));
        assert!(views[0].is_owner);

        // Client-initiated ping gets a pong.
        write.write_all(Frame::Ping.encode().unwrap().as_bytes()).await.unwrap();
        match read_frame(&mut lines).await {
            Frame::Pong => {}
            other => panic!("expected pong, got {other:?}"),
        }

        drop(write);
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(daemon.session_views().is_empty());
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let (_tmp, daemon) = daemon(Some("s3cret")).await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(daemon.clone().handle_conn(Box::pin(server)));

        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        let hello = Frame::Hello {
            protocol: PROTOCOL_VERSION,
            session_id: "sess-1".into(),
            client_id: None,
            token: Some("wrong".into()),
        };
        write.write_all(hello.encode().unwrap().as_bytes()).await.unwrap();

        match read_frame(&mut lines).await {
            Frame::Error { reason } => assert_eq!(reason, "unauthorized"),
            other => panic!("expected error, got {other:?}"),
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(daemon.session_views().is_empty());
    }

    #[tokio::test]
    async fn mcp_round_trip_through_session_server() {
        let (_tmp, daemon) = daemon(None).await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let _handle = tokio::spawn(daemon.clone().handle_conn(Box::pin(server)));

        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        let hello = Frame::Hello {
            protocol: PROTOCOL_VERSION,
            session_id: "sess-7".into(),
            client_id: None,
            token: None,
        };
        write.write_all(hello.encode().unwrap().as_bytes()).await.unwrap();
        let Frame::Welcome { .. } = read_frame(&mut lines).await else {
            panic!("expected welcome");
        };

        let initialize = Frame::Mcp {
            session_id: "sess-7".into(),
            payload: serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": {},
                    "clientInfo": {"name": "test", "version": "0.0.0"}
                }
            }),
        };
        write
            .write_all(initialize.encode().unwrap().as_bytes())
            .await
            .unwrap();

        match read_frame(&mut lines).await {
            Frame::Mcp { payload, .. } => {
                assert_eq!(payload["id"], serde_json::json!(1));
                assert!(payload["result"]["capabilities"].is_object());
            }
            other => panic!("expected mcp response, got {other:?}"),
        }
    }
}
