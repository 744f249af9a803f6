//! `config` — print the resolved, validated configuration.

use std::path::PathBuf;

use anyhow::Result;

use mcp_squared::Config;

pub fn execute(config: &Config, path: Option<&PathBuf>) -> Result<()> {
    match path {
        Some(path) => println!("# resolved from {}", path.display()),
        None => println!("# no config file found; showing defaults"),
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
