//! `import` — merge upstreams from another tool's config file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use mcp_squared::Config;

use crate::import::{merge, parse_external};

pub struct ImportArgs {
    pub from_file: PathBuf,
    pub force: bool,
    pub dry_run: bool,
}

pub fn execute(mut config: Config, config_path: Option<&Path>, args: ImportArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.from_file)
        .with_context(|| format!("reading {}", args.from_file.display()))?;
    let incoming = parse_external(&text)?;
    if incoming.is_empty() {
        bail!("{} declares no mcpServers", args.from_file.display());
    }

    let report = merge(&mut config, incoming, args.force);
    for key in &report.added {
        println!("added    {key}");
    }
    for key in &report.in_sync {
        println!("in sync  {key}");
    }
    for key in &report.conflicts {
        println!("conflict {key} (pass --force to overwrite)");
    }

    if args.dry_run {
        println!("dry run: config not written");
        return Ok(());
    }
    if !report.changed() {
        println!("nothing to do");
        return Ok(());
    }

    let target = match config_path {
        Some(path) => path.to_path_buf(),
        None => mcp_squared::config::user_config_path(),
    };
    config.save(&target)?;
    println!("updated {}", target.display());
    Ok(())
}
