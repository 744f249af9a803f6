//! `monitor` — one-shot query against a running broker's monitor socket.

use anyhow::{Result, bail};

use mcp_squared_broker::instances::{Endpoint, InstanceRegistry, InstanceRole};
use mcp_squared_broker::monitor::{monitor_endpoint_for, query};

pub struct MonitorArgs {
    pub command: Vec<String>,
    pub socket: Option<String>,
    pub instance: Option<String>,
}

pub async fn execute(args: MonitorArgs) -> Result<()> {
    let registry = InstanceRegistry::default_registry();

    let endpoint = match (&args.socket, &args.instance) {
        (Some(socket), _) => Endpoint::parse(socket),
        (None, Some(id)) => {
            let entries = registry.list_live(false).await?;
            let Some(entry) = entries.iter().find(|e| e.id.starts_with(id.as_str())) else {
                bail!("no live instance matching '{id}'");
            };
            monitor_endpoint_for(&entry.endpoint())
        }
        (None, None) => {
            // Prefer a daemon, fall back to a standalone server.
            let daemon = registry.find_live(InstanceRole::Daemon).await?;
            match daemon {
                Some(entry) => monitor_endpoint_for(&entry.endpoint()),
                None => bail!(
                    "no live daemon found; pass --socket or start one with `mcp-squared daemon`"
                ),
            }
        }
    };

    let command = if args.command.is_empty() {
        "stats".to_string()
    } else {
        args.command.join(" ")
    };

    let reply = query(&endpoint, &command).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);

    if reply.get("status").and_then(|s| s.as_str()) == Some("error") {
        bail!(
            "monitor command failed: {}",
            reply
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown error")
        );
    }
    Ok(())
}
