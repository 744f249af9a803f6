//! Wiring: build the shared subsystems from a config and supervise their
//! background tasks.
//!
//! Both entry modes (standalone stdio server and daemon) assemble the same
//! runtime; they differ only in how sessions are created on top of it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mcp_squared::Config;
use mcp_squared::policy::{DEFAULT_TOKEN_TTL, PolicyEngine, SecurityPolicy};

use crate::cataloger::{CatalogEvent, Cataloger, CatalogerOptions};
use crate::error::BrokerError;
use crate::index::{IndexStore, NoopEmbedder};
use crate::monitor::{MonitorDeps, SessionLister};
use crate::oauth::TokenStore;
use crate::retriever::Retriever;
use crate::session::SessionDeps;
use crate::stats::BrokerStats;

/// Default cap on concurrent in-flight `execute`s across all sessions.
const DEFAULT_EXECUTE_CONCURRENCY: usize = 16;

/// How often expired confirmation tokens are swept.
const CONFIRMATION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Whether dial failures may open a browser for OAuth.
    pub interactive: bool,
    /// Index location; `None` uses the per-user data dir.
    pub index_path: Option<PathBuf>,
    /// Keep the index in memory (tests, dry runs).
    pub in_memory_index: bool,
    /// Track per-tool call counters for the monitor.
    pub track_tools: bool,
    pub execute_concurrency: usize,
    /// Override for `operations.index.refreshIntervalMs`.
    pub refresh_interval: Option<Duration>,
    /// Disable the periodic refresher entirely.
    pub auto_refresh: bool,
    /// Data directory for tokens; `None` uses the per-user default.
    pub data_dir: Option<PathBuf>,
    /// Replaces the config's security policy when set (`--security`).
    pub security_override: Option<SecurityPolicy>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            interactive: false,
            index_path: None,
            in_memory_index: false,
            track_tools: true,
            execute_concurrency: DEFAULT_EXECUTE_CONCURRENCY,
            refresh_interval: None,
            auto_refresh: true,
            data_dir: None,
            security_override: None,
        }
    }
}

pub struct BrokerRuntime {
    pub config: Config,
    pub cataloger: Arc<Cataloger>,
    pub retriever: Arc<Retriever>,
    pub policy: Arc<PolicyEngine>,
    pub stats: Arc<BrokerStats>,
    pub token_store: Arc<TokenStore>,
    options: RuntimeOptions,
    execute_permits: Arc<Semaphore>,
    tasks: Vec<JoinHandle<()>>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mcp-squared")
}

impl BrokerRuntime {
    pub async fn build(config: Config, options: RuntimeOptions) -> Result<Self, BrokerError> {
        let data_dir = options.data_dir.clone().unwrap_or_else(default_data_dir);
        let token_store = Arc::new(TokenStore::new(data_dir.join("oauth")));

        let effective_policy = options
            .security_override
            .clone()
            .unwrap_or_else(|| config.security.effective_policy());
        let policy = Arc::new(PolicyEngine::compile(&effective_policy, DEFAULT_TOKEN_TTL)?);

        let refresh_interval = options
            .refresh_interval
            .unwrap_or(Duration::from_millis(config.operations.index.refresh_interval_ms));
        let cataloger = Arc::new(Cataloger::new(
            &config.upstreams,
            token_store.clone(),
            CatalogerOptions {
                interactive: options.interactive,
                refresh_interval,
                ..Default::default()
            },
        ));

        let store = if options.in_memory_index {
            IndexStore::open_in_memory().await?
        } else {
            let path = options
                .index_path
                .clone()
                .unwrap_or_else(|| data_dir.join("index.db"));
            IndexStore::open(path).await?
        };
        let retriever = Arc::new(Retriever::new(
            store,
            cataloger.clone(),
            Arc::new(NoopEmbedder),
            config.operations.find_tools.clone(),
        ));

        let stats = Arc::new(BrokerStats::new(options.track_tools));
        let execute_permits = Arc::new(Semaphore::new(options.execute_concurrency));

        Ok(Self {
            config,
            cataloger,
            retriever,
            policy,
            stats,
            token_store,
            options,
            execute_permits,
            tasks: Vec::new(),
        })
    }

    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            cataloger: self.cataloger.clone(),
            retriever: self.retriever.clone(),
            policy: self.policy.clone(),
            stats: self.stats.clone(),
            operations: self.config.operations.clone(),
            execute_permits: self.execute_permits.clone(),
        }
    }

    pub fn monitor_deps(&self, sessions: SessionLister) -> MonitorDeps {
        MonitorDeps {
            stats: self.stats.clone(),
            cataloger: self.cataloger.clone(),
            sessions,
        }
    }

    /// Dial the fleet, run the initial index sync, and start the background
    /// tasks (index sync follower, periodic refresher, token sweeper).
    pub async fn start(&mut self) {
        self.cataloger.connect_all().await;
        match self.retriever.sync_from_cataloger().await {
            Ok(changes) => {
                self.stats.mark_index_refreshed();
                if !changes.is_empty() {
                    info!(
                        added = changes.added.len(),
                        removed = changes.removed.len(),
                        modified = changes.modified.len(),
                        "initial index sync complete"
                    );
                }
            }
            Err(e) => warn!(error = %e, "initial index sync failed"),
        }

        self.tasks.push(self.retriever.spawn_sync_task());

        // Refresh bookkeeping for the monitor's `lastIndexRefresh`.
        {
            let stats = self.stats.clone();
            let mut events = self.cataloger.subscribe();
            self.tasks.push(tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if matches!(event, CatalogEvent::ToolsSynced { .. }) {
                        stats.mark_index_refreshed();
                    }
                }
            }));
        }

        if self.options.auto_refresh {
            self.tasks.push(self.cataloger.spawn_refresher());
        }

        // Expired confirmation tokens are erased, not just ignored.
        {
            let confirmations = self.policy.confirmations();
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CONFIRMATION_SWEEP_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    confirmations.purge_expired();
                }
            }));
        }
    }

    /// Stop background tasks in reverse start order, then close transports.
    pub async fn shutdown(mut self) {
        while let Some(task) = self.tasks.pop() {
            task.abort();
        }
        self.cataloger.shutdown().await;
        info!("broker runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn builds_and_stops_with_empty_config() {
        let tmp = TempDir::new().unwrap();
        let mut runtime = BrokerRuntime::build(
            Config::default(),
            RuntimeOptions {
                in_memory_index: true,
                data_dir: Some(tmp.path().to_path_buf()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        runtime.start().await;
        let deps = runtime.session_deps();
        assert_eq!(deps.cataloger.upstream_keys().len(), 0);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn default_policy_is_hardened() {
        let tmp = TempDir::new().unwrap();
        let runtime = BrokerRuntime::build(
            Config::default(),
            RuntimeOptions {
                in_memory_index: true,
                data_dir: Some(tmp.path().to_path_buf()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        match runtime.policy.evaluate("anything", "at_all", None) {
            mcp_squared::policy::Decision::Confirm { .. } => {}
            other => panic!("expected confirm, got {other:?}"),
        }
    }
}
