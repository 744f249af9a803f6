//! Loopback OAuth callback server.
//!
//! Binds `127.0.0.1:<port>`, serves exactly one `/callback` hit, hands the
//! extracted parameters to the waiting flow, and tears itself down. A flow
//! that never completes is cut off by the timeout.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::error::BrokerError;

/// Default time to wait for the user to finish in the browser.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Parameters delivered by the authorization server.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackResult {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

type ResultSender = Arc<Mutex<Option<oneshot::Sender<CallbackResult>>>>;

async fn handle_callback(
    State(sender): State<ResultSender>,
    Query(result): Query<CallbackResult>,
) -> Html<&'static str> {
    let page = if result.error.is_some() {
        Html(ERROR_PAGE)
    } else {
        Html(SUCCESS_PAGE)
    };
    if let Some(tx) = sender.lock().take() {
        let _ = tx.send(result);
    }
    page
}

/// Serve one callback on `port` and return its parameters.
pub async fn wait_for_callback(
    port: u16,
    timeout: Duration,
) -> Result<CallbackResult, BrokerError> {
    let (tx, rx) = oneshot::channel();
    let sender: ResultSender = Arc::new(Mutex::new(Some(tx)));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let app = Router::new()
        .route("/callback", get(handle_callback))
        .with_state(sender);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| BrokerError::TokenStoreIo {
            reason: format!("bind callback port {port}: {e}"),
        })?;

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    let outcome = tokio::time::timeout(timeout, rx).await;
    let _ = shutdown_tx.send(());
    let _ = server.await;

    match outcome {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(_)) => Err(BrokerError::OAuthCallbackTimeout {
            seconds: timeout.as_secs(),
        }),
        Err(_) => Err(BrokerError::OAuthCallbackTimeout {
            seconds: timeout.as_secs(),
        }),
    }
}

const SUCCESS_PAGE: &str = "<!doctype html><html><body style=\"font-family: sans-serif; \
    text-align: center; margin-top: 4em;\"><h2>Authorization complete</h2>\
    <p>You can close this tab and return to mcp-squared.</p></body></html>";

const ERROR_PAGE: &str = "<!doctype html><html><body style=\"font-family: sans-serif; \
    text-align: center; margin-top: 4em;\"><h2>Authorization failed</h2>\
    <p>The authorization server reported an error. Check the mcp-squared logs.</p>\
    </body></html>";

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_code_and_state_once() {
        // Port 0 would lose the actual port; pick an ephemeral one manually.
        let probe = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let server = tokio::spawn(wait_for_callback(port, Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let body = reqwest::get(format!(
            "http://127.0.0.1:{port}/callback?code=abc&state=xyz"
        ))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
        assert!(body.contains("Authorization complete"));

        let result = server.await.unwrap().unwrap();
        assert_eq!(result.code.as_deref(), Some("abc"));
        assert_eq!(result.state.as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn times_out_when_nobody_calls_back() {
        let probe = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let err = wait_for_callback(port, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::OAuthCallbackTimeout { .. }));
    }
}
