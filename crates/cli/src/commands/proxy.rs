//! `proxy` — stdio bridge to the shared daemon.

use std::path::PathBuf;

use anyhow::Result;

use mcp_squared_broker::instances::{Endpoint, InstanceRegistry};
use mcp_squared_broker::proxy::{ProxyOptions, run_proxy};

pub struct ProxyArgs {
    pub daemon_socket: Option<String>,
    pub daemon_secret: Option<String>,
    pub no_daemon_spawn: bool,
    pub instance: Option<String>,
    pub config_path: Option<PathBuf>,
}

pub async fn execute(args: ProxyArgs) -> Result<()> {
    let registry = InstanceRegistry::default_registry();

    // A spawned daemon must see the same config this proxy was pointed at.
    let mut spawn_args = Vec::new();
    if let Some(path) = &args.config_path {
        spawn_args.push("--config".to_string());
        spawn_args.push(path.display().to_string());
    }
    if let Some(secret) = &args.daemon_secret {
        spawn_args.push("--daemon-secret".to_string());
        spawn_args.push(secret.clone());
    }

    run_proxy(
        &registry,
        ProxyOptions {
            daemon_endpoint: args.daemon_socket.as_deref().map(Endpoint::parse),
            daemon_secret: args.daemon_secret,
            auto_spawn: !args.no_daemon_spawn,
            spawn_args,
            client_id: args.instance,
        },
    )
    .await
    .map_err(Into::into)
}
