//! `auth <upstream>` — drive the OAuth flow for one upstream.

use std::sync::Arc;

use anyhow::{Result, bail};

use mcp_squared::Config;
use mcp_squared::config::UpstreamTransport;
use mcp_squared_broker::oauth::{TokenStore, authorize_upstream};

pub async fn execute(config: Config, upstream: &str, interactive: bool) -> Result<()> {
    let Some(entry) = config.upstreams.get(upstream) else {
        bail!("unknown upstream '{upstream}'");
    };
    let UpstreamTransport::StreamableHttp { url, auth, .. } = &entry.transport else {
        bail!("upstream '{upstream}' is a subprocess; only HTTP upstreams use OAuth");
    };
    let Some(auth) = auth.as_ref().filter(|a| a.is_enabled()) else {
        bail!("upstream '{upstream}' has no auth block configured");
    };
    if !interactive {
        bail!("`auth` needs a browser; remove --no-interactive");
    }

    let token_store = Arc::new(TokenStore::default_store());
    authorize_upstream(
        upstream,
        url,
        auth.callback_port(),
        auth.client_name(),
        true,
        token_store,
    )
    .await?;

    println!("Authenticated '{upstream}'. A running daemon will pick the tokens up on its next refresh.");
    Ok(())
}
