//! Daemon wire frames: newline-terminated UTF-8 JSON, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Protocol revision spoken on the daemon socket.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on one frame line.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMeta {
    pub name: String,
    pub version: String,
}

impl Default for ServerMeta {
    fn default() -> Self {
        Self {
            name: "mcp-squared".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    #[serde(rename_all = "camelCase")]
    Hello {
        protocol: u32,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Welcome {
        session_id: String,
        server_info: ServerMeta,
    },
    Error {
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Mcp {
        session_id: String,
        payload: serde_json::Value,
    },
    Ping,
    Pong,
    Shutdown {
        reason: String,
    },
}

impl Frame {
    /// One line, newline-terminated. `serde_json` never emits raw newlines
    /// inside a compact document, so the framing invariant holds.
    pub fn encode(&self) -> Result<String, BrokerError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| BrokerError::IpcPeerGone {
                reason: format!("unencodable frame: {e}"),
            })?;
        line.push('\n');
        Ok(line)
    }

    pub fn parse(line: &str) -> Result<Self, BrokerError> {
        if line.len() > MAX_FRAME_BYTES {
            return Err(BrokerError::IpcFrameTooLarge {
                size: line.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        serde_json::from_str(line.trim_end()).map_err(|e| BrokerError::IpcPeerGone {
            reason: format!("malformed frame: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hello_welcome_round_trip() {
        let hello = Frame::Hello {
            protocol: PROTOCOL_VERSION,
            session_id: "sess-1".into(),
            client_id: Some("ide".into()),
            token: None,
        };
        let line = hello.encode().unwrap();
        assert!(line.ends_with('\n'));
        assert!(!line.trim_end().contains('\n'));

        match Frame::parse(&line).unwrap() {
            Frame::Hello {
                protocol,
                session_id,
                client_id,
                token,
            } => {
                assert_eq!(protocol, 1);
                assert_eq!(session_id, "sess-1");
                assert_eq!(client_id.as_deref(), Some("ide"));
                assert!(token.is_none());
            }
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn mcp_frame_carries_payload_verbatim() {
        let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let frame = Frame::Mcp {
            session_id: "sess-1".into(),
            payload: payload.clone(),
        };
        let line = frame.encode().unwrap();
        match Frame::parse(&line).unwrap() {
            Frame::Mcp { payload: parsed, .. } => assert_eq!(parsed, payload),
            other => panic!("expected mcp, got {other:?}"),
        }
    }

    #[test]
    fn type_tags_are_snake_case() {
        assert!(Frame::Ping.encode().unwrap().contains("\"ping\""));
        let line = Frame::Shutdown {
            reason: "bye".into(),
        }
        .encode()
        .unwrap();
        assert!(line.contains("\"shutdown\""));
    }

    #[test]
    fn oversized_line_is_rejected() {
        let line = "x".repeat(MAX_FRAME_BYTES + 1);
        assert!(matches!(
            Frame::parse(&line),
            Err(BrokerError::IpcFrameTooLarge { .. })
        ));
    }
}
