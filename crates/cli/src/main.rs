use anyhow::Result;
use clap::Parser;

mod cli_args;
mod commands;
mod import;
mod tracing;

use cli_args::{CliArgs, Commands, SecurityPreset};
use commands::load_config;
use tracing::setup_logging;

use mcp_squared::policy::SecurityPolicy;

fn preset_policy(preset: SecurityPreset) -> SecurityPolicy {
    match preset {
        SecurityPreset::Hardened => SecurityPolicy::hardened(),
        SecurityPreset::Permissive => SecurityPolicy::permissive(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.verbose);

    let interactive = !args.no_interactive;
    let (config, config_path) = load_config(args.config.as_deref())?;

    match args.command {
        // `mcp-squared` and `mcp-squared --stdio` both serve over stdio.
        None => {
            commands::server::execute(
                config,
                commands::server::ServerArgs {
                    refresh_interval: None,
                    no_auto_refresh: false,
                    monitor_socket: None,
                    security_override: None,
                    interactive,
                },
            )
            .await
        }
        Some(Commands::Server {
            refresh_interval,
            no_auto_refresh,
            monitor_socket,
            security,
        }) => {
            commands::server::execute(
                config,
                commands::server::ServerArgs {
                    refresh_interval,
                    no_auto_refresh,
                    monitor_socket,
                    security_override: security.map(preset_policy),
                    interactive,
                },
            )
            .await
        }
        Some(Commands::Config) => commands::config::execute(&config, config_path.as_ref()),
        Some(Commands::Test { upstream }) => {
            commands::test::execute(config, upstream.as_deref(), interactive).await
        }
        Some(Commands::Auth { upstream }) => {
            commands::auth::execute(config, &upstream, interactive).await
        }
        Some(Commands::Import { from_file, force }) => commands::import::execute(
            config,
            config_path.as_deref(),
            commands::import::ImportArgs {
                from_file,
                force,
                dry_run: args.dry_run,
            },
        ),
        Some(Commands::Init {
            project,
            force,
            security,
        }) => commands::init::execute(commands::init::InitArgs {
            project,
            force,
            security,
            dry_run: args.dry_run,
        }),
        Some(Commands::Install { output }) => {
            commands::install::execute(output.as_ref(), args.dry_run)
        }
        Some(Commands::Monitor {
            command,
            socket,
            instance,
        }) => {
            commands::monitor::execute(commands::monitor::MonitorArgs {
                command,
                socket,
                instance,
            })
            .await
        }
        Some(Commands::Daemon {
            socket,
            daemon_secret,
            refresh_interval,
            no_auto_refresh,
            monitor_socket,
            security,
        }) => {
            commands::daemon::execute(
                config,
                commands::daemon::DaemonArgs {
                    socket,
                    secret: daemon_secret,
                    refresh_interval,
                    no_auto_refresh,
                    monitor_socket,
                    security_override: security.map(preset_policy),
                    interactive,
                },
            )
            .await
        }
        Some(Commands::Proxy {
            daemon_socket,
            daemon_secret,
            no_daemon_spawn,
            instance,
        }) => {
            commands::proxy::execute(commands::proxy::ProxyArgs {
                daemon_socket,
                daemon_secret,
                no_daemon_spawn,
                instance,
                config_path: args.config.clone(),
            })
            .await
        }
    }
}
