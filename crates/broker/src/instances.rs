//! On-disk registry of live broker processes.
//!
//! Every server, daemon or proxy writes one JSON file under the per-user
//! runtime directory and removes it on exit. Listing can prune entries whose
//! process died or whose socket no longer answers, so a crashed daemon never
//! wedges discovery.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::util::now_ms;

/// A socket endpoint: a filesystem path or `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix("tcp://") {
            Some(addr) => Endpoint::Tcp(addr.to_string()),
            None => Endpoint::Unix(PathBuf::from(s)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Byte stream over either endpoint flavor.
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IpcStream for T {}

pub type BoxedStream = Pin<Box<dyn IpcStream>>;

/// Connect to an endpoint, boxing over the transport.
pub async fn connect_endpoint(endpoint: &Endpoint) -> std::io::Result<BoxedStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::pin(stream))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(path) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("unix sockets unavailable on this host: {}", path.display()),
        )),
        Endpoint::Tcp(addr) => {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            Ok(Box::pin(stream))
        }
    }
}

/// Listener over either endpoint flavor. Binding a unix path clears any
/// stale socket file left by a crashed process.
pub enum IpcListener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(tokio::net::TcpListener),
}

impl IpcListener {
    pub async fn bind(endpoint: &Endpoint) -> std::io::Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                Ok(IpcListener::Unix(tokio::net::UnixListener::bind(path)?))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("unix sockets unavailable: {}", path.display()),
            )),
            Endpoint::Tcp(addr) => Ok(IpcListener::Tcp(
                tokio::net::TcpListener::bind(addr).await?,
            )),
        }
    }

    pub async fn accept(&self) -> std::io::Result<BoxedStream> {
        match self {
            #[cfg(unix)]
            IpcListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::pin(stream))
            }
            IpcListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::pin(stream))
            }
        }
    }
}

/// Process roles recorded in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Server,
    Daemon,
    Proxy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceEntry {
    pub id: String,
    pub pid: u32,
    pub socket_path: String,
    /// Milliseconds since the unix epoch.
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<InstanceRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
}

impl InstanceEntry {
    pub fn new(role: InstanceRole, socket_path: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            socket_path,
            started_at: now_ms(),
            role: Some(role),
            cwd: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
            config_path: None,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            command_line: Some(std::env::args().collect::<Vec<_>>().join(" ")),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::parse(&self.socket_path)
    }

    /// Liveness: the process exists and (except for proxies) its socket
    /// accepts a connection.
    pub async fn is_alive(&self) -> bool {
        if !pid_alive(self.pid) {
            return false;
        }
        if self.role == Some(InstanceRole::Proxy) {
            return true;
        }
        matches!(
            tokio::time::timeout(
                Duration::from_millis(500),
                connect_endpoint(&self.endpoint())
            )
            .await,
            Ok(Ok(_))
        )
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 performs the permission and existence checks without
    // delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

pub struct InstanceRegistry {
    dir: PathBuf,
}

/// Guard for a registered entry; the file is removed on drop.
pub struct RegisteredInstance {
    path: PathBuf,
    pub entry: InstanceEntry,
}

impl Drop for RegisteredInstance {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl InstanceRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Per-user default: the runtime dir (or temp as a last resort).
    pub fn default_registry() -> Self {
        let dir = dirs::runtime_dir()
            .filter(|p| std::fs::create_dir_all(p).is_ok())
            .unwrap_or_else(std::env::temp_dir)
            .join("mcp-squared")
            .join("instances");
        Self::new(dir)
    }

    /// Directory sockets can live next to.
    pub fn socket_dir(&self) -> PathBuf {
        self.dir
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.dir.clone())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Atomically write `entry`; the returned guard unregisters on drop.
    pub fn register(&self, entry: InstanceEntry) -> Result<RegisteredInstance, BrokerError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| BrokerError::TokenStoreIo {
            reason: format!("create {}: {e}", self.dir.display()),
        })?;
        let path = self.path_for(&entry.id);
        let text =
            serde_json::to_string_pretty(&entry).map_err(|e| BrokerError::TokenStoreIo {
                reason: format!("serialize instance entry: {e}"),
            })?;
        let tmp = self.dir.join(format!(".{}.json.tmp", entry.id));
        let io = |e: std::io::Error| BrokerError::TokenStoreIo {
            reason: format!("write {}: {e}", path.display()),
        };
        std::fs::write(&tmp, text).map_err(io)?;
        std::fs::rename(&tmp, &path).map_err(io)?;
        Ok(RegisteredInstance { path, entry })
    }

    /// All parseable entries, sorted oldest first.
    pub fn list(&self) -> Result<Vec<InstanceEntry>, BrokerError> {
        let mut entries = Vec::new();
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => {
                return Err(BrokerError::TokenStoreIo {
                    reason: format!("read {}: {e}", self.dir.display()),
                });
            }
        };
        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<InstanceEntry>(&text).ok())
            {
                Some(entry) => entries.push(entry),
                None => {
                    // Not fatal: surfaced as a warning, cleaned by prune.
                    warn!(
                        path = %path.display(),
                        "{}",
                        BrokerError::InstanceRegistryStale {
                            path: path.display().to_string()
                        }
                    );
                }
            }
        }
        entries.sort_by_key(|e| e.started_at);
        Ok(entries)
    }

    /// Live entries only; with `prune`, dead or unreadable files are removed.
    pub async fn list_live(&self, prune: bool) -> Result<Vec<InstanceEntry>, BrokerError> {
        let mut live = Vec::new();
        for entry in self.list()? {
            if entry.is_alive().await {
                live.push(entry);
            } else if prune {
                debug!(id = %entry.id, pid = entry.pid, "pruning dead instance entry");
                let _ = std::fs::remove_file(self.path_for(&entry.id));
            }
        }
        Ok(live)
    }

    /// The most recent live entry with `role`.
    pub async fn find_live(&self, role: InstanceRole) -> Result<Option<InstanceEntry>, BrokerError> {
        let live = self.list_live(true).await?;
        Ok(live
            .into_iter()
            .filter(|e| e.role == Some(role))
            .next_back())
    }

    pub fn remove(&self, id: &str) {
        let _ = std::fs::remove_file(self.path_for(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn endpoint_round_trips() {
        let unix = Endpoint::parse("/run/mcp-squared/daemon.sock");
        assert_eq!(unix.to_string(), "/run/mcp-squared/daemon.sock");
        let tcp = Endpoint::parse("tcp://127.0.0.1:9000");
        assert_eq!(tcp, Endpoint::Tcp("127.0.0.1:9000".into()));
        assert_eq!(tcp.to_string(), "tcp://127.0.0.1:9000");
    }

    #[test]
    fn entry_write_read_matches_every_field() {
        let tmp = TempDir::new().unwrap();
        let registry = InstanceRegistry::new(tmp.path().join("instances"));
        let entry = InstanceEntry::new(InstanceRole::Daemon, "/tmp/test.sock".into());
        let expected = entry.clone();

        let guard = registry.register(entry).unwrap();
        let listed = registry.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], expected);
        drop(guard);
        assert!(registry.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_pid_is_pruned() {
        let tmp = TempDir::new().unwrap();
        let registry = InstanceRegistry::new(tmp.path().join("instances"));
        let mut entry = InstanceEntry::new(InstanceRole::Daemon, "/tmp/nope.sock".into());
        // Far above any real pid_max, but still positive as a pid_t.
        entry.pid = i32::MAX as u32 - 1;
        let guard = registry.register(entry).unwrap();
        // Simulate a crash: the process never got to unregister.
        std::mem::forget(guard);
        assert_eq!(registry.list().unwrap().len(), 1);

        let live = registry.list_live(true).await.unwrap();
        assert!(live.is_empty());
        assert!(registry.list().unwrap().is_empty(), "pruned from disk");
    }

    #[tokio::test]
    async fn proxies_skip_the_connect_test() {
        let tmp = TempDir::new().unwrap();
        let registry = InstanceRegistry::new(tmp.path().join("instances"));
        let entry = InstanceEntry::new(InstanceRole::Proxy, "/tmp/never-bound.sock".into());
        let _guard = registry.register(entry).unwrap();

        let live = registry.list_live(false).await.unwrap();
        assert_eq!(live.len(), 1, "own pid is alive, no socket probe for proxies");
    }
}
