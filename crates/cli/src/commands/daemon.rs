//! `daemon` — the shared long-lived broker process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{error, info};

use mcp_squared::Config;
use mcp_squared::policy::SecurityPolicy;
use mcp_squared_broker::daemon::{DEFAULT_HEARTBEAT_INTERVAL, Daemon, DaemonOptions};
use mcp_squared_broker::instances::{Endpoint, InstanceEntry, InstanceRegistry, InstanceRole};
use mcp_squared_broker::monitor::{MonitorServer, monitor_endpoint_for};
use mcp_squared_broker::oauth::run_preflight;
use mcp_squared_broker::{BrokerRuntime, RuntimeOptions};

pub struct DaemonArgs {
    pub socket: Option<String>,
    pub secret: Option<String>,
    pub refresh_interval: Option<u64>,
    pub no_auto_refresh: bool,
    pub monitor_socket: Option<String>,
    pub security_override: Option<SecurityPolicy>,
    pub interactive: bool,
}

pub fn default_daemon_endpoint(registry: &InstanceRegistry) -> Endpoint {
    Endpoint::Unix(registry.socket_dir().join("daemon.sock"))
}

pub async fn execute(config: Config, args: DaemonArgs) -> Result<()> {
    let registry = InstanceRegistry::default_registry();
    let endpoint = args
        .socket
        .as_deref()
        .map(Endpoint::parse)
        .unwrap_or_else(|| default_daemon_endpoint(&registry));

    let mut runtime = BrokerRuntime::build(
        config,
        RuntimeOptions {
            interactive: args.interactive,
            refresh_interval: args.refresh_interval.map(Duration::from_millis),
            auto_refresh: !args.no_auto_refresh,
            security_override: args.security_override.clone(),
            ..Default::default()
        },
    )
    .await?;

    let report = run_preflight(
        &runtime.config.upstreams,
        runtime.token_store.clone(),
        args.interactive,
    )
    .await;
    for (name, reason) in &report.failed {
        error!(upstream = %name, reason = %reason, "pre-flight authentication failed");
    }
    if !report.all_ok() && !args.interactive {
        bail!(
            "OAuth authorization required for: {}; run `mcp-squared auth <upstream>`",
            report
                .failed
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    runtime.start().await;

    let daemon = Daemon::new(
        runtime.session_deps(),
        DaemonOptions {
            endpoint: endpoint.clone(),
            secret: args.secret.clone(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        },
    );

    // Clean out corpses, then announce ourselves.
    let _ = registry.list_live(true).await;
    let _instance = registry.register(InstanceEntry::new(
        InstanceRole::Daemon,
        endpoint.to_string(),
    ))?;

    let monitor_endpoint = args
        .monitor_socket
        .as_deref()
        .map(Endpoint::parse)
        .unwrap_or_else(|| monitor_endpoint_for(&endpoint));
    let monitor = {
        let daemon = daemon.clone();
        MonitorServer::new(
            runtime.monitor_deps(Arc::new(move || daemon.session_views())),
            monitor_endpoint,
        )
    };
    let monitor_shutdown = monitor.shutdown_token();
    let monitor_task = tokio::spawn(async move {
        if let Err(e) = monitor.run().await {
            error!(error = %e, "monitor service failed");
        }
    });

    let shutdown = daemon.shutdown_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupted; shutting the daemon down");
        shutdown.cancel();
    });

    let result = daemon.run().await;
    monitor_shutdown.cancel();
    let _ = monitor_task.await;
    runtime.shutdown().await;
    result.map_err(Into::into)
}
