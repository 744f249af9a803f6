//! Per-upstream OAuth: credential cache, client flows, callback server,
//! pre-flight driver.

pub mod callback;
pub mod preflight;
pub mod provider;
pub mod token_store;

pub use callback::{CallbackResult, DEFAULT_CALLBACK_TIMEOUT, wait_for_callback};
pub use preflight::{PreflightReport, authorize_upstream, run_preflight};
pub use provider::{DEFAULT_CALLBACK_PORT, OauthProvider};
pub use token_store::{ClientRegistration, StoredCredentials, TokenSet, TokenStore};
