//! `init` — write a starter configuration.

use std::path::PathBuf;

use anyhow::{Result, bail};

use crate::cli_args::SecurityPreset;

pub struct InitArgs {
    pub project: bool,
    pub force: bool,
    pub security: Option<SecurityPreset>,
    pub dry_run: bool,
}

fn starter_config(preset: SecurityPreset) -> String {
    let security = match preset {
        SecurityPreset::Hardened => {
            "[security.tools]\nallow = []\nblock = []\nconfirm = [\"*:*\"]\n"
        }
        SecurityPreset::Permissive => {
            "[security.tools]\nallow = [\"*:*\"]\nblock = []\nconfirm = []\n"
        }
    };
    format!(
        "schemaVersion = 1\n\n\
         # Upstream MCP servers, keyed by a short name.\n\
         #\n\
         # [upstreams.fs]\n\
         # transport = \"subprocess\"\n\
         # command = \"npx\"\n\
         # args = [\"-y\", \"@modelcontextprotocol/server-filesystem\", \"/tmp\"]\n\
         #\n\
         # [upstreams.linear]\n\
         # transport = \"streamableHttp\"\n\
         # url = \"https://mcp.linear.app/mcp\"\n\
         # auth = true\n\n\
         {security}\n\
         [operations.findTools]\n\
         defaultLimit = 10\n\
         maxLimit = 50\n\
         defaultMode = \"fast\"\n\n\
         [operations.index]\n\
         refreshIntervalMs = 30000\n"
    )
}

pub fn execute(args: InitArgs) -> Result<()> {
    let target: PathBuf = if args.project {
        PathBuf::from("mcp-squared.toml")
    } else {
        mcp_squared::config::user_config_path()
    };

    let preset = args.security.unwrap_or(SecurityPreset::Hardened);
    let content = starter_config(preset);

    if args.dry_run {
        println!("# would write {}", target.display());
        print!("{content}");
        return Ok(());
    }

    if target.exists() && !args.force {
        bail!(
            "{} already exists; pass --force to overwrite",
            target.display()
        );
    }
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, content)?;
    println!("wrote {}", target.display());
    Ok(())
}
