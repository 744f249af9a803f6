//! Command line surface of the `mcp-squared` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SecurityPreset {
    /// Everything requires confirmation (the default posture).
    Hardened,
    /// Everything is allowed outright.
    Permissive,
}

/// Meta-broker for Model Context Protocol tool servers.
#[derive(Parser, Debug)]
#[clap(name = "mcp-squared", version, disable_version_flag = true)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Serve MCP over stdio (the default when no subcommand is given).
    #[arg(long)]
    pub stdio: bool,

    /// Verbose logging.
    #[arg(short = 'V', long, global = true)]
    pub verbose: bool,

    /// Explicit config file path (otherwise discovered).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Never open a browser or prompt; fail instead.
    #[arg(long, global = true)]
    pub no_interactive: bool,

    /// Show what would happen without writing anything.
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve MCP over stdio with an in-process broker (default).
    Server {
        /// Override the upstream refresh interval in milliseconds.
        #[arg(long)]
        refresh_interval: Option<u64>,
        /// Disable the periodic upstream refresher.
        #[arg(long)]
        no_auto_refresh: bool,
        /// Also expose the read-only monitor socket at this endpoint.
        #[arg(long)]
        monitor_socket: Option<String>,
        /// Override the configured security posture.
        #[arg(long, value_enum)]
        security: Option<SecurityPreset>,
    },
    /// Print the resolved, validated configuration.
    Config,
    /// Dial one (or every) upstream once and report the outcome.
    Test {
        /// Upstream key; all upstreams when omitted.
        upstream: Option<String>,
    },
    /// Run the interactive OAuth flow for an upstream.
    Auth {
        /// Upstream key from the config.
        upstream: String,
    },
    /// Merge upstreams from another agent tool's config file.
    Import {
        /// File to import (e.g. a Claude Desktop / Cursor mcpServers file).
        #[arg(long)]
        from_file: PathBuf,
        /// Overwrite conflicting upstream definitions.
        #[arg(long)]
        force: bool,
    },
    /// Write a starter configuration.
    Init {
        /// Write `./mcp-squared.toml` instead of the user-level config.
        #[arg(long)]
        project: bool,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
        /// Security posture for the generated config.
        #[arg(long, value_enum)]
        security: Option<SecurityPreset>,
    },
    /// Print the client config snippet that launches this broker.
    Install {
        /// Write the snippet to a file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Query a running broker's monitor socket.
    Monitor {
        /// Command to send (`ping`, `stats`, `tools [limit]`, `upstreams`,
        /// `clients`).
        #[arg(default_value = "stats")]
        command: Vec<String>,
        /// Monitor endpoint (path or `tcp://host:port`).
        #[arg(long)]
        socket: Option<String>,
        /// Target a specific registered instance id.
        #[arg(long)]
        instance: Option<String>,
    },
    /// Run the shared daemon that owns the upstream fleet.
    Daemon {
        /// Daemon endpoint (path or `tcp://host:port`).
        #[arg(long)]
        socket: Option<String>,
        /// Shared secret clients must present in their hello frame.
        #[arg(long)]
        daemon_secret: Option<String>,
        /// Override the upstream refresh interval in milliseconds.
        #[arg(long)]
        refresh_interval: Option<u64>,
        /// Disable the periodic upstream refresher.
        #[arg(long)]
        no_auto_refresh: bool,
        /// Also expose the read-only monitor socket at this endpoint.
        #[arg(long)]
        monitor_socket: Option<String>,
        /// Override the configured security posture.
        #[arg(long, value_enum)]
        security: Option<SecurityPreset>,
    },
    /// Bridge stdio to a shared daemon, spawning one when needed.
    Proxy {
        /// Daemon endpoint (otherwise discovered via the instance registry).
        #[arg(long)]
        daemon_socket: Option<String>,
        /// Shared secret for the daemon handshake.
        #[arg(long)]
        daemon_secret: Option<String>,
        /// Fail instead of spawning a daemon when none is running.
        #[arg(long)]
        no_daemon_spawn: bool,
        /// Client identifier reported to the daemon.
        #[arg(long)]
        instance: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn default_invocation_has_no_subcommand() {
        let args = CliArgs::parse_from(["mcp-squared"]);
        assert!(args.command.is_none());
        assert!(!args.stdio);
    }

    #[test]
    fn proxy_flags_parse() {
        let args = CliArgs::parse_from([
            "mcp-squared",
            "proxy",
            "--daemon-socket",
            "tcp://127.0.0.1:7800",
            "--no-daemon-spawn",
        ]);
        match args.command {
            Some(Commands::Proxy {
                daemon_socket,
                no_daemon_spawn,
                ..
            }) => {
                assert_eq!(daemon_socket.as_deref(), Some("tcp://127.0.0.1:7800"));
                assert!(no_daemon_spawn);
            }
            other => panic!("expected proxy, got {other:?}"),
        }
    }

    #[test]
    fn monitor_command_words_collect() {
        let args = CliArgs::parse_from(["mcp-squared", "monitor", "tools", "5"]);
        match args.command {
            Some(Commands::Monitor { command, .. }) => {
                assert_eq!(command, vec!["tools", "5"]);
            }
            other => panic!("expected monitor, got {other:?}"),
        }
    }
}
