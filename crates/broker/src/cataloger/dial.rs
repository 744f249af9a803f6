//! Transport dialing for upstream connections.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::service::serve_client;
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use which::which;

use mcp_squared::CoreError;
use mcp_squared::config::UpstreamTransport;

use crate::cataloger::connection::ClientService;
use crate::cataloger::handler::BrokerClientHandler;
use crate::error::{BrokerError, DialFailure};
use crate::oauth::TokenStore;

/// Dial one upstream with a bounded handshake.
pub(crate) async fn dial_upstream(
    key: &str,
    transport: &UpstreamTransport,
    handler: BrokerClientHandler,
    token_store: &TokenStore,
    dial_timeout: Duration,
) -> Result<ClientService, BrokerError> {
    match transport {
        UpstreamTransport::Subprocess {
            command,
            args,
            cwd,
            env,
        } => {
            if which(command).is_err() && !std::path::Path::new(command).exists() {
                return Err(dial_err(
                    key,
                    DialFailure::ExecutableNotFound {
                        command: command.clone(),
                    },
                ));
            }

            let env = expand_env(key, env)?;
            let mut cmd = tokio::process::Command::new(command);
            cmd.args(args)
                .envs(env)
                .stderr(std::process::Stdio::inherit())
                .stdout(std::process::Stdio::piped())
                .stdin(std::process::Stdio::piped());
            if let Some(cwd) = cwd {
                cmd.current_dir(cwd);
            }

            let transport = TokioChildProcess::new(cmd).map_err(|e| {
                dial_err(
                    key,
                    DialFailure::ChildExited {
                        detail: e.to_string(),
                    },
                )
            })?;

            match tokio::time::timeout(dial_timeout, serve_client(handler, transport)).await {
                Ok(Ok(service)) => Ok(service),
                Ok(Err(e)) => Err(dial_err(key, classify_subprocess(&e.to_string()))),
                Err(_) => Err(dial_err(
                    key,
                    DialFailure::HandshakeTimeout {
                        seconds: dial_timeout.as_secs(),
                    },
                )),
            }
        }
        UpstreamTransport::StreamableHttp { url, headers, auth } => {
            let mut header_map = HeaderMap::new();
            for (name, value) in headers {
                let value = mcp_squared_utils::env::expand(value).map_err(|e| {
                    BrokerError::Core(CoreError::ConfigValidation {
                        reason: format!("upstream '{key}' header '{name}': {e}"),
                    })
                })?;
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    BrokerError::Core(CoreError::ConfigValidation {
                        reason: format!("upstream '{key}': invalid header name '{name}': {e}"),
                    })
                })?;
                let value = HeaderValue::from_str(&value).map_err(|e| {
                    BrokerError::Core(CoreError::ConfigValidation {
                        reason: format!("upstream '{key}': invalid header value: {e}"),
                    })
                })?;
                header_map.insert(name, value);
            }

            if auth.as_ref().is_some_and(|a| a.is_enabled())
                && !header_map.contains_key(reqwest::header::AUTHORIZATION)
                && let Some(token) = token_store.valid_access_token(key)
            {
                let bearer = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                    BrokerError::TokenStoreIo {
                        reason: format!("stored token for '{key}' is not header-safe: {e}"),
                    }
                })?;
                header_map.insert(reqwest::header::AUTHORIZATION, bearer);
            }

            let client = reqwest::ClientBuilder::new()
                .default_headers(header_map)
                .build()
                .map_err(|e| dial_err(key, classify_http(&e.to_string())))?;
            let transport = StreamableHttpClientTransport::with_client(
                client,
                StreamableHttpClientTransportConfig::with_uri(url.clone()),
            );

            match tokio::time::timeout(dial_timeout, serve_client(handler, transport)).await {
                Ok(Ok(service)) => Ok(service),
                Ok(Err(e)) => Err(dial_err(key, classify_http(&e.to_string()))),
                Err(_) => Err(dial_err(
                    key,
                    DialFailure::HandshakeTimeout {
                        seconds: dial_timeout.as_secs(),
                    },
                )),
            }
        }
    }
}

fn expand_env(
    key: &str,
    env: &BTreeMap<String, String>,
) -> Result<Vec<(String, String)>, BrokerError> {
    env.iter()
        .map(|(name, value)| {
            mcp_squared_utils::env::expand(value)
                .map(|expanded| (name.clone(), expanded))
                .map_err(|e| {
                    BrokerError::Core(CoreError::ConfigValidation {
                        reason: format!("upstream '{key}' env '{name}': {e}"),
                    })
                })
        })
        .collect()
}

fn dial_err(key: &str, failure: DialFailure) -> BrokerError {
    BrokerError::UpstreamDialFailed {
        upstream: key.to_string(),
        failure,
    }
}

fn classify_subprocess(text: &str) -> DialFailure {
    let lower = text.to_lowercase();
    if lower.contains("unauthorized") || lower.contains("401") {
        DialFailure::Unauthorized {
            reason: text.to_string(),
        }
    } else {
        DialFailure::ChildExited {
            detail: text.to_string(),
        }
    }
}

pub(crate) fn classify_http(text: &str) -> DialFailure {
    let lower = text.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("invalid_token") {
        DialFailure::Unauthorized {
            reason: text.to_string(),
        }
    } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
        DialFailure::Tls {
            reason: text.to_string(),
        }
    } else {
        DialFailure::NetworkUnreachable {
            reason: text.to_string(),
        }
    }
}

/// True when a runtime MCP error reads as an expired/missing credential.
pub(crate) fn is_unauthorized_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("401") || lower.contains("unauthorized") || lower.contains("invalid_token")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_errors_classify_by_shape() {
        assert!(matches!(
            classify_http("server returned 401 Unauthorized"),
            DialFailure::Unauthorized { .. }
        ));
        assert!(matches!(
            classify_http("invalid peer certificate"),
            DialFailure::Tls { .. }
        ));
        assert!(matches!(
            classify_http("connection refused"),
            DialFailure::NetworkUnreachable { .. }
        ));
    }

    #[test]
    fn unauthorized_text_detection() {
        assert!(is_unauthorized_text("HTTP 401"));
        assert!(is_unauthorized_text("token invalid_token"));
        assert!(!is_unauthorized_text("connection reset"));
    }
}
