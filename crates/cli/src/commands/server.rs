//! `server` — standalone stdio mode.
//!
//! One client, one in-process broker: dial the fleet, run the pre-flight
//! auth checks, then serve the meta-tools over stdin/stdout until EOF.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use rmcp::ServiceExt;
use tracing::{error, info};
use uuid::Uuid;

use mcp_squared::Config;
use mcp_squared::policy::SecurityPolicy;
use mcp_squared_broker::instances::{Endpoint, InstanceEntry, InstanceRegistry, InstanceRole};
use mcp_squared_broker::monitor::MonitorServer;
use mcp_squared_broker::oauth::run_preflight;
use mcp_squared_broker::session::SessionServer;
use mcp_squared_broker::{BrokerRuntime, RuntimeOptions};

pub struct ServerArgs {
    pub refresh_interval: Option<u64>,
    pub no_auto_refresh: bool,
    pub monitor_socket: Option<String>,
    pub security_override: Option<SecurityPolicy>,
    pub interactive: bool,
}

pub async fn execute(config: Config, args: ServerArgs) -> Result<()> {
    let mut runtime = BrokerRuntime::build(
        config,
        RuntimeOptions {
            interactive: args.interactive,
            refresh_interval: args.refresh_interval.map(Duration::from_millis),
            auto_refresh: !args.no_auto_refresh,
            security_override: args.security_override,
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

    let registry = InstanceRegistry::default_registry();
    let _instance = registry
        .register(InstanceEntry::new(InstanceRole::Server, "stdio".to_string()))
        .ok();
    let _ = registry.list_live(true).await;

    let session = SessionServer::with_ownership(
        runtime.session_deps(),
        Uuid::new_v4().to_string(),
        None,
        true,
    );

    let monitor_task = args.monitor_socket.as_deref().map(|socket| {
        let endpoint = Endpoint::parse(socket);
        let session = session.clone();
        let monitor = MonitorServer::new(
            runtime.monitor_deps(Arc::new(move || vec![session.view()])),
            endpoint,
        );
        tokio::spawn(async move {
            if let Err(e) = monitor.run().await {
                error!(error = %e, "monitor service failed");
            }
        })
    });

    info!("serving meta-tools over stdio");
    let running = session
        .clone()
        .serve((tokio::io::stdin(), tokio::io::stdout()))
        .await?;

    tokio::select! {
        quit = running.waiting() => {
            info!(reason = ?quit, "stdio session ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
        }
    }

    if let Some(task) = monitor_task {
        task.abort();
    }
    runtime.shutdown().await;
    Ok(())
}
