//! One module per subcommand.

pub mod auth;
pub mod config;
pub mod daemon;
pub mod import;
pub mod init;
pub mod install;
pub mod monitor;
pub mod proxy;
pub mod server;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use mcp_squared::config::SCHEMA_VERSION;
use mcp_squared::{Config, CoreError};

/// Load the active config: explicit path, discovery, or defaults.
///
/// A missing file is not fatal for the serve paths: the broker still exposes
/// its meta-tools over an empty fleet.
pub fn load_config(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let cwd = std::env::current_dir().context("cannot determine working directory")?;
            match mcp_squared::config::discover(&cwd) {
                Ok(path) => Some(path),
                Err(CoreError::ConfigNotFound) => None,
                Err(e) => return Err(e.into()),
            }
        }
    };

    match path {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            Ok((config, Some(path)))
        }
        None => {
            warn!("no config file found; starting with an empty upstream set");
            Ok((
                Config {
                    schema_version: SCHEMA_VERSION,
                    ..Default::default()
                },
                None,
            ))
        }
    }
}
