//! Per-upstream credential cache.
//!
//! One JSON file per upstream under the broker data directory, written with
//! a tmp-then-rename so readers never observe a partial file. Every write
//! bumps an in-process monotone `auth_state_version` for the key, which the
//! cataloger uses to decide whether a re-dial of an auth-pending upstream is
//! worth attempting.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::util::now_ms;

/// Dynamic-registration result for one authorization server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// An OAuth token set with its absolute expiry (derived from `expires_in`
/// when the set is saved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Milliseconds since the unix epoch; `None` means no known expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl TokenSet {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => now_ms() >= at,
            None => false,
        }
    }
}

/// Everything persisted for one upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientRegistration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenSet>,
    /// PKCE verifier for the flow currently in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

pub struct TokenStore {
    dir: PathBuf,
    versions: Mutex<HashMap<String, u64>>,
}

impl TokenStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Default location under the per-user data dir.
    pub fn default_store() -> Self {
        let dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("mcp-squared")
            .join("oauth");
        Self::new(dir)
    }

    fn path_for(&self, upstream: &str) -> PathBuf {
        self.dir.join(format!("{upstream}.json"))
    }

    pub fn load(&self, upstream: &str) -> Result<Option<StoredCredentials>, BrokerError> {
        let path = self.path_for(upstream);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BrokerError::TokenStoreIo {
                    reason: format!("read {}: {e}", path.display()),
                });
            }
        };
        let creds =
            serde_json::from_str(&text).map_err(|e| BrokerError::TokenStoreIo {
                reason: format!("parse {}: {e}", path.display()),
            })?;
        // Seed the version so a pre-existing file counts as state.
        self.versions
            .lock()
            .entry(upstream.to_string())
            .or_insert(1);
        Ok(Some(creds))
    }

    /// Persist atomically and bump the key's auth-state version.
    pub fn save(&self, upstream: &str, creds: &StoredCredentials) -> Result<u64, BrokerError> {
        let path = self.path_for(upstream);
        let io = |e: std::io::Error| BrokerError::TokenStoreIo {
            reason: format!("write {}: {e}", path.display()),
        };
        std::fs::create_dir_all(&self.dir).map_err(io)?;
        let text = serde_json::to_string_pretty(creds).map_err(|e| BrokerError::TokenStoreIo {
            reason: format!("serialize credentials for '{upstream}': {e}"),
        })?;
        let tmp = self.dir.join(format!(".{upstream}.json.tmp"));
        std::fs::write(&tmp, text).map_err(io)?;
        std::fs::rename(&tmp, &path).map_err(io)?;

        let mut versions = self.versions.lock();
        let version = versions.entry(upstream.to_string()).or_insert(0);
        *version += 1;
        Ok(*version)
    }

    /// Current monotone version for `upstream` (0 when never touched).
    pub fn auth_state_version(&self, upstream: &str) -> u64 {
        if let Some(v) = self.versions.lock().get(upstream) {
            return *v;
        }
        // A file written by a previous process counts as version 1.
        if self.path_for(upstream).is_file() {
            *self
                .versions
                .lock()
                .entry(upstream.to_string())
                .or_insert(1)
        } else {
            0
        }
    }

    /// A non-expired access token, with `$NAME` references resolved against
    /// the process environment at read time.
    pub fn valid_access_token(&self, upstream: &str) -> Option<String> {
        let creds = self.load(upstream).ok()??;
        let tokens = creds.tokens?;
        if tokens.is_expired() {
            return None;
        }
        mcp_squared_utils::env::expand(&tokens.access_token).ok()
    }

    pub fn delete(&self, upstream: &str) -> Result<(), BrokerError> {
        let path = self.path_for(upstream);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                let mut versions = self.versions.lock();
                let version = versions.entry(upstream.to_string()).or_insert(0);
                *version += 1;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BrokerError::TokenStoreIo {
                reason: format!("remove {}: {e}", path.display()),
            }),
        }
    }
}
