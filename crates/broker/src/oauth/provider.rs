//! OAuth client for streaming-HTTP upstreams.
//!
//! Implements the MCP client-auth contract: authorization-server metadata
//! discovery, dynamic client registration (public client + PKCE S256),
//! CSRF-safe state, and the code-exchange / refresh token calls. Persistence
//! goes through the [`TokenStore`] so the cataloger observes every
//! credential change via the auth-state version.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::BrokerError;
use crate::oauth::token_store::{ClientRegistration, StoredCredentials, TokenSet, TokenStore};
use crate::util::now_ms;

/// Fallback client id used when the server offers no registration endpoint.
const FALLBACK_CLIENT_ID: &str = "mcp-squared";

/// Default loopback port for the authorization redirect.
pub const DEFAULT_CALLBACK_PORT: u16 = 7777;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

pub struct OauthProvider {
    upstream_key: String,
    server_url: Url,
    callback_port: u16,
    client_name: String,
    interactive: bool,
    token_store: Arc<TokenStore>,
    http: reqwest::Client,
    flow_state: Mutex<Option<String>>,
}

impl OauthProvider {
    pub fn new(
        upstream_key: &str,
        server_url: &str,
        callback_port: Option<u16>,
        client_name: Option<&str>,
        interactive: bool,
        token_store: Arc<TokenStore>,
    ) -> Result<Self, BrokerError> {
        let server_url = Url::parse(server_url).map_err(|e| BrokerError::TokenStoreIo {
            reason: format!("invalid upstream url '{server_url}': {e}"),
        })?;
        Ok(Self {
            upstream_key: upstream_key.to_string(),
            server_url,
            callback_port: callback_port.unwrap_or(DEFAULT_CALLBACK_PORT),
            client_name: client_name.unwrap_or("mcp-squared").to_string(),
            interactive,
            token_store,
            http: reqwest::Client::new(),
            flow_state: Mutex::new(None),
        })
    }

    pub fn callback_port(&self) -> u16 {
        self.callback_port
    }

    pub fn redirect_url(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.callback_port)
    }

    /// Dynamic-client-registration payload: a public client using PKCE.
    pub fn client_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "client_name": self.client_name,
            "redirect_uris": [self.redirect_url()],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
        })
    }

    /// CSRF state for the current flow: 256-bit random, memoized until the
    /// flow completes.
    pub fn state(&self) -> String {
        let mut guard = self.flow_state.lock();
        if let Some(state) = guard.as_ref() {
            return state.clone();
        }
        let state = random_token();
        *guard = Some(state.clone());
        state
    }

    pub fn verify_state(&self, got: &str) -> Result<(), BrokerError> {
        match self.flow_state.lock().as_deref() {
            Some(expected) if expected == got => Ok(()),
            _ => Err(BrokerError::OAuthStateMismatch),
        }
    }

    /// Fetch authorization-server metadata, falling back to the standard
    /// `/authorize` and `/token` paths when the well-known document is
    /// missing.
    pub async fn discover_metadata(&self) -> Result<AuthServerMetadata, BrokerError> {
        let mut well_known = self.server_url.clone();
        well_known.set_path("/.well-known/oauth-authorization-server");
        well_known.set_query(None);

        if let Ok(response) = self.http.get(well_known).send().await
            && response.status().is_success()
            && let Ok(metadata) = response.json::<AuthServerMetadata>().await
        {
            return Ok(metadata);
        }

        let mut origin = self.server_url.clone();
        origin.set_query(None);
        origin.set_path("");
        let origin = origin.as_str().trim_end_matches('/').to_string();
        Ok(AuthServerMetadata {
            authorization_endpoint: format!("{origin}/authorize"),
            token_endpoint: format!("{origin}/token"),
            registration_endpoint: None,
        })
    }

    /// Return the registered client, registering dynamically when the server
    /// supports it and nothing is stored yet.
    pub async fn ensure_client(
        &self,
        metadata: &AuthServerMetadata,
    ) -> Result<ClientRegistration, BrokerError> {
        let mut creds = self
            .token_store
            .load(&self.upstream_key)?
            .unwrap_or_default();
        if let Some(client) = creds.client_info.clone() {
            return Ok(client);
        }

        let client = match &metadata.registration_endpoint {
            Some(endpoint) => {
                let response = self
                    .http
                    .post(endpoint)
                    .json(&self.client_metadata())
                    .send()
                    .await
                    .map_err(|e| BrokerError::TokenStoreIo {
                        reason: format!("client registration failed: {e}"),
                    })?;
                let registered: RegistrationResponse =
                    response.json().await.map_err(|e| BrokerError::TokenStoreIo {
                        reason: format!("client registration response: {e}"),
                    })?;
                ClientRegistration {
                    client_id: registered.client_id,
                    client_secret: registered.client_secret,
                }
            }
            None => ClientRegistration {
                client_id: FALLBACK_CLIENT_ID.to_string(),
                client_secret: None,
            },
        };

        creds.client_info = Some(client.clone());
        self.token_store.save(&self.upstream_key, &creds)?;
        Ok(client)
    }

    /// Start a flow: mint PKCE material, persist the verifier, and build the
    /// authorization URL.
    pub async fn begin_flow(&self) -> Result<String, BrokerError> {
        let metadata = self.discover_metadata().await?;
        let client = self.ensure_client(&metadata).await?;

        let verifier = random_token();
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

        let mut creds = self
            .token_store
            .load(&self.upstream_key)?
            .unwrap_or_default();
        creds.code_verifier = Some(verifier);
        self.token_store.save(&self.upstream_key, &creds)?;

        let mut url =
            Url::parse(&metadata.authorization_endpoint).map_err(|e| BrokerError::TokenStoreIo {
                reason: format!("invalid authorization endpoint: {e}"),
            })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client.client_id)
            .append_pair("redirect_uri", &self.redirect_url())
            .append_pair("state", &self.state())
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(url.to_string())
    }

    /// Open the OS browser on `url`, or refuse when non-interactive.
    pub fn redirect_to_authorization(&self, url: &str) -> Result<(), BrokerError> {
        if !self.interactive {
            return Err(BrokerError::NeedsManualAuth {
                upstream: self.upstream_key.clone(),
            });
        }
        open_browser(url);
        Ok(())
    }

    /// Exchange an authorization code, persist the resulting tokens, and
    /// clear the one-shot flow material.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet, BrokerError> {
        let metadata = self.discover_metadata().await?;
        let mut creds = self
            .token_store
            .load(&self.upstream_key)?
            .unwrap_or_default();
        let verifier = creds
            .code_verifier
            .clone()
            .ok_or_else(|| BrokerError::TokenStoreIo {
                reason: format!("no PKCE verifier stored for '{}'", self.upstream_key),
            })?;
        let client = self.ensure_client(&metadata).await?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.redirect_url()),
            ("client_id", client.client_id.clone()),
            ("code_verifier", verifier),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let tokens = self.post_token(&metadata.token_endpoint, &form).await?;

        creds.tokens = Some(tokens.clone());
        creds.code_verifier = None;
        self.token_store.save(&self.upstream_key, &creds)?;
        *self.flow_state.lock() = None;
        Ok(tokens)
    }

    /// Refresh with the stored refresh token; persists the new set.
    pub async fn refresh_tokens(&self) -> Result<TokenSet, BrokerError> {
        let metadata = self.discover_metadata().await?;
        let mut creds = self
            .token_store
            .load(&self.upstream_key)?
            .unwrap_or_default();
        let refresh_token = creds
            .tokens
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or_else(|| BrokerError::NeedsManualAuth {
                upstream: self.upstream_key.clone(),
            })?;
        let client = self.ensure_client(&metadata).await?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", client.client_id.clone()),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let mut tokens = self.post_token(&metadata.token_endpoint, &form).await?;
        // Servers may omit the refresh token on renewal; keep the old one.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token);
        }

        creds.tokens = Some(tokens.clone());
        self.token_store.save(&self.upstream_key, &creds)?;
        Ok(tokens)
    }

    async fn post_token(
        &self,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<TokenSet, BrokerError> {
        let response = self
            .http
            .post(endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| BrokerError::TokenStoreIo {
                reason: format!("token endpoint request failed: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(BrokerError::TokenStoreIo {
                reason: format!("token endpoint returned {}", response.status()),
            });
        }
        let parsed: TokenResponse =
            response.json().await.map_err(|e| BrokerError::TokenStoreIo {
                reason: format!("token endpoint response: {e}"),
            })?;
        Ok(TokenSet {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: parsed
                .expires_in
                .map(|secs| now_ms() + (secs as i64) * 1000),
        })
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(target_os = "macos")]
fn open_browser(url: &str) {
    let _ = std::process::Command::new("open").arg(url).spawn();
}

#[cfg(all(unix, not(target_os = "macos")))]
fn open_browser(url: &str) {
    let _ = std::process::Command::new("xdg-open").arg(url).spawn();
}

#[cfg(windows)]
fn open_browser(url: &str) {
    let _ = std::process::Command::new("cmd")
        .args(["/C", "start", "", url])
        .spawn();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider(interactive: bool) -> (TempDir, OauthProvider) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TokenStore::new(tmp.path().join("oauth")));
        let provider = OauthProvider::new(
            "linear",
            "https://mcp.example.com/mcp",
            Some(9321),
            Some("test client"),
            interactive,
            store,
        )
        .unwrap();
        (tmp, provider)
    }

    #[test]
    fn redirect_url_uses_configured_port() {
        let (_tmp, p) = provider(true);
        assert_eq!(p.redirect_url(), "http://127.0.0.1:9321/callback");
    }

    #[test]
    fn client_metadata_is_a_public_pkce_client() {
        let (_tmp, p) = provider(true);
        let metadata = p.client_metadata();
        assert_eq!(metadata["token_endpoint_auth_method"], "none");
        assert_eq!(metadata["redirect_uris"][0], "http://127.0.0.1:9321/callback");
        assert_eq!(metadata["client_name"], "test client");
    }

    #[test]
    fn state_is_memoized_and_verified() {
        let (_tmp, p) = provider(true);
        let state = p.state();
        assert_eq!(p.state(), state);
        assert!(p.verify_state(&state).is_ok());
        assert!(matches!(
            p.verify_state("forged"),
            Err(BrokerError::OAuthStateMismatch)
        ));
    }

    #[test]
    fn non_interactive_redirect_raises_manual_auth() {
        let (_tmp, p) = provider(false);
        let err = p
            .redirect_to_authorization("https://auth.example.com/authorize")
            .unwrap_err();
        assert!(matches!(err, BrokerError::NeedsManualAuth { .. }));
    }
}
