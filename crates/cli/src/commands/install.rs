//! `install` — emit the client config snippet that launches this broker.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;

pub fn execute(output: Option<&PathBuf>, dry_run: bool) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let snippet = json!({
        "mcpServers": {
            "mcp-squared": {
                "command": exe.display().to_string(),
                "args": ["proxy"],
            }
        }
    });
    let text = serde_json::to_string_pretty(&snippet)?;

    match output {
        Some(path) if !dry_run => {
            std::fs::write(path, format!("{text}\n"))
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
        }
        _ => println!("{text}"),
    }
    Ok(())
}
