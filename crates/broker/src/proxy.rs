//! stdio ↔ daemon bridge.
//!
//! A proxy is the process an MCP client actually launches: it reads raw MCP
//! frames from stdin, wraps them for the daemon socket, and unwraps the
//! daemon's session frames back onto stdout. When no daemon is running and
//! auto-spawn is enabled, it forks one and waits for the instance registry
//! to announce the socket.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::daemon::{Frame, PROTOCOL_VERSION};
use crate::error::BrokerError;
use crate::instances::{
    connect_endpoint, Endpoint, InstanceEntry, InstanceRegistry, InstanceRole,
};

/// How long to wait for an auto-spawned daemon to appear in the registry.
const SPAWN_WAIT: Duration = Duration::from_secs(10);
const SPAWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Explicit daemon endpoint; otherwise discovered via the registry.
    pub daemon_endpoint: Option<Endpoint>,
    pub daemon_secret: Option<String>,
    /// Fork a daemon when none is running.
    pub auto_spawn: bool,
    /// Extra argv passed to the spawned daemon (config path, socket, ...).
    pub spawn_args: Vec<String>,
    pub client_id: Option<String>,
}

/// Locate a live daemon endpoint, spawning one when allowed.
pub async fn locate_daemon(
    registry: &InstanceRegistry,
    options: &ProxyOptions,
) -> Result<Endpoint, BrokerError> {
    if let Some(endpoint) = &options.daemon_endpoint {
        return Ok(endpoint.clone());
    }
    if let Some(entry) = registry.find_live(InstanceRole::Daemon).await? {
        return Ok(entry.endpoint());
    }
    if !options.auto_spawn {
        return Err(BrokerError::IpcPeerGone {
            reason: "no daemon running and auto-spawn is disabled".to_string(),
        });
    }

    spawn_daemon(options)?;
    let deadline = tokio::time::Instant::now() + SPAWN_WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Some(entry) = registry.find_live(InstanceRole::Daemon).await? {
            return Ok(entry.endpoint());
        }
        tokio::time::sleep(SPAWN_POLL).await;
    }
    Err(BrokerError::IpcPeerGone {
        reason: format!(
            "spawned daemon did not register within {}s",
            SPAWN_WAIT.as_secs()
        ),
    })
}

fn spawn_daemon(options: &ProxyOptions) -> Result<(), BrokerError> {
    let exe = std::env::current_exe().map_err(|e| BrokerError::IpcPeerGone {
        reason: format!("cannot locate own executable: {e}"),
    })?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("daemon")
        .args(&options.spawn_args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New session: the daemon must outlive this proxy and its terminal.
        cmd.process_group(0);
    }
    cmd.spawn().map_err(|e| BrokerError::IpcPeerGone {
        reason: format!("failed to spawn daemon: {e}"),
    })?;
    info!("spawned background daemon");
    Ok(())
}

/// Run the bridge until stdin closes or the daemon ends the session.
pub async fn run_proxy(
    registry: &InstanceRegistry,
    options: ProxyOptions,
) -> Result<(), BrokerError> {
    let endpoint = locate_daemon(registry, &options).await?;
    debug!(endpoint = %endpoint, "connecting to daemon");

    let stream = connect_endpoint(&endpoint)
        .await
        .map_err(|e| BrokerError::IpcPeerGone {
            reason: format!("connect {endpoint}: {e}"),
        })?;
    let (daemon_read, mut daemon_write) = tokio::io::split(stream);
    let mut daemon_lines = BufReader::new(daemon_read).lines();

    let session_id = Uuid::new_v4().to_string();
    let hello = Frame::Hello {
        protocol: PROTOCOL_VERSION,
        session_id: session_id.clone(),
        client_id: options.client_id.clone(),
        token: options.daemon_secret.clone(),
    };
    daemon_write
        .write_all(hello.encode()?.as_bytes())
        .await
        .map_err(peer_gone)?;

    match daemon_lines.next_line().await.map_err(peer_gone)? {
        Some(line) => match Frame::parse(&line)? {
            Frame::Welcome { .. } => {}
            Frame::Error { reason } if reason == "unauthorized" => {
                return Err(BrokerError::IpcUnauthorized);
            }
            Frame::Error { reason } => {
                return Err(BrokerError::IpcPeerGone { reason });
            }
            other => {
                return Err(BrokerError::IpcPeerGone {
                    reason: format!("unexpected handshake frame: {other:?}"),
                });
            }
        },
        None => {
            return Err(BrokerError::IpcPeerGone {
                reason: "daemon closed during handshake".to_string(),
            });
        }
    }
    info!(session = %session_id, "proxy session established");

    // Keep a registry entry so monitors can see this proxy.
    let _instance = registry
        .register(InstanceEntry::new(
            InstanceRole::Proxy,
            endpoint.to_string(),
        ))
        .ok();

    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = stdin_lines.next_line() => {
                let Ok(Some(line)) = line else {
                    debug!("stdin closed; shutting down proxy");
                    break;
                };
                let Ok(payload) = serde_json::from_str(&line) else {
                    warn!("dropping malformed MCP frame from stdin");
                    continue;
                };
                let frame = Frame::Mcp {
                    session_id: session_id.clone(),
                    payload,
                };
                if daemon_write.write_all(frame.encode()?.as_bytes()).await.is_err() {
                    break;
                }
            }
            line = daemon_lines.next_line() => {
                let Ok(Some(line)) = line else {
                    debug!("daemon closed the connection");
                    break;
                };
                match Frame::parse(&line) {
                    Ok(Frame::Mcp { payload, .. }) => {
                        let mut out = payload.to_string();
                        out.push('\n');
                        if stdout.write_all(out.as_bytes()).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                    }
                    Ok(Frame::Ping) => {
                        if daemon_write
                            .write_all(Frame::Pong.encode()?.as_bytes())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Frame::Shutdown { reason }) => {
                        info!(reason = %reason, "daemon shut the session down");
                        break;
                    }
                    Ok(Frame::Error { reason }) => {
                        warn!(reason = %reason, "daemon reported an error");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "dropping malformed daemon frame");
                    }
                }
            }
        }
    }

    Ok(())
}

fn peer_gone(e: std::io::Error) -> BrokerError {
    BrokerError::IpcPeerGone {
        reason: e.to_string(),
    }
}
