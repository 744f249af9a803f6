//! Interactive pre-flight authentication.
//!
//! Before the daemon enters serve mode, every enabled streaming-HTTP
//! upstream with an auth block gets its stored tokens checked; missing or
//! expired credentials drive the browser flow to completion so serve mode
//! never starts half-authenticated.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use mcp_squared::config::{UpstreamConfig, UpstreamTransport};

use crate::error::BrokerError;
use crate::oauth::callback::{DEFAULT_CALLBACK_TIMEOUT, wait_for_callback};
use crate::oauth::provider::OauthProvider;
use crate::oauth::token_store::TokenStore;

/// Outcome of one pre-flight sweep.
#[derive(Debug, Default)]
pub struct PreflightReport {
    /// Flows driven to completion this run.
    pub authenticated: Vec<String>,
    /// Upstreams whose stored tokens were still valid.
    pub already_valid: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl PreflightReport {
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drive the interactive flow for one upstream.
pub async fn authorize_upstream(
    key: &str,
    url: &str,
    callback_port: Option<u16>,
    client_name: Option<&str>,
    interactive: bool,
    token_store: Arc<TokenStore>,
) -> Result<(), BrokerError> {
    let provider = OauthProvider::new(
        key,
        url,
        callback_port,
        client_name,
        interactive,
        token_store,
    )?;

    // Prefer a silent refresh before bothering the user.
    if provider.refresh_tokens().await.is_ok() {
        info!(upstream = key, "refreshed stored OAuth tokens");
        return Ok(());
    }

    if !interactive {
        return Err(BrokerError::NeedsManualAuth {
            upstream: key.to_string(),
        });
    }

    let auth_url = provider.begin_flow().await?;
    provider.redirect_to_authorization(&auth_url)?;
    info!(upstream = key, "waiting for OAuth callback; if no browser opened, visit: {auth_url}");

    let callback = wait_for_callback(provider.callback_port(), DEFAULT_CALLBACK_TIMEOUT).await?;
    if let Some(error) = callback.error {
        return Err(BrokerError::TokenStoreIo {
            reason: format!("authorization server returned error '{error}'"),
        });
    }
    provider.verify_state(callback.state.as_deref().unwrap_or(""))?;
    let code = callback.code.ok_or(BrokerError::OAuthStateMismatch)?;
    provider.exchange_code(&code).await?;
    info!(upstream = key, "OAuth flow complete");
    Ok(())
}

/// Check (and where needed, authenticate) every auth-enabled upstream.
pub async fn run_preflight(
    upstreams: &BTreeMap<String, UpstreamConfig>,
    token_store: Arc<TokenStore>,
    interactive: bool,
) -> PreflightReport {
    let mut report = PreflightReport::default();

    for (key, upstream) in upstreams {
        if !upstream.enabled {
            continue;
        }
        let UpstreamTransport::StreamableHttp { url, auth: Some(auth), .. } = &upstream.transport
        else {
            continue;
        };
        if !auth.is_enabled() {
            continue;
        }

        if token_store.valid_access_token(key).is_some() {
            report.already_valid.push(key.clone());
            continue;
        }

        match authorize_upstream(
            key,
            url,
            auth.callback_port(),
            auth.client_name(),
            interactive,
            token_store.clone(),
        )
        .await
        {
            Ok(()) => report.authenticated.push(key.clone()),
            Err(e) => {
                warn!(upstream = %key, error = %e, "pre-flight authentication failed");
                report.failed.push((key.clone(), e.to_string()));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_squared::config::AuthConfig;
    use tempfile::TempDir;

    use crate::oauth::token_store::{StoredCredentials, TokenSet};
    use crate::util::now_ms;

    fn http_upstream(url: &str, auth: AuthConfig) -> UpstreamConfig {
        UpstreamConfig {
            enabled: true,
            label: None,
            transport: UpstreamTransport::StreamableHttp {
                url: url.into(),
                headers: BTreeMap::new(),
                auth: Some(auth),
            },
        }
    }

    #[tokio::test]
    async fn valid_tokens_short_circuit() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TokenStore::new(tmp.path().to_path_buf()));
        store
            .save(
                "linear",
                &StoredCredentials {
                    tokens: Some(TokenSet {
                        access_token: "tok".into(),
                        refresh_token: None,
                        expires_at: Some(now_ms() + 600_000),
                    }),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut upstreams = BTreeMap::new();
        upstreams.insert(
            "linear".to_string(),
            http_upstream("https://mcp.example.com/mcp", AuthConfig::Enabled(true)),
        );

        let report = run_preflight(&upstreams, store, false).await;
        assert_eq!(report.already_valid, vec!["linear"]);
        assert!(report.all_ok());
    }

    #[tokio::test]
    async fn upstreams_without_auth_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TokenStore::new(tmp.path().to_path_buf()));

        let mut upstreams = BTreeMap::new();
        upstreams.insert(
            "open".to_string(),
            http_upstream("https://mcp.example.com/mcp", AuthConfig::Enabled(false)),
        );

        let report = run_preflight(&upstreams, store, false).await;
        assert!(report.already_valid.is_empty());
        assert!(report.authenticated.is_empty());
        assert!(report.all_ok());
    }
}
