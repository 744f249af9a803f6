//! End-to-end daemon IPC: a real unix socket, the hello/welcome handshake,
//! and MCP traffic routed through a per-session server.

use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use mcp_squared::Config;
use mcp_squared_broker::daemon::{Daemon, DaemonOptions, Frame, PROTOCOL_VERSION};
use mcp_squared_broker::instances::Endpoint;
use mcp_squared_broker::{BrokerRuntime, RuntimeOptions};

async fn start_daemon(tmp: &TempDir, secret: Option<&str>) -> std::sync::Arc<Daemon> {
    let runtime = BrokerRuntime::build(
        Config::default(),
        RuntimeOptions {
            in_memory_index: true,
            auto_refresh: false,
            data_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        },
    )
    .await
    .expect("runtime builds");

    let daemon = Daemon::new(
        runtime.session_deps(),
        DaemonOptions {
            endpoint: Endpoint::Unix(tmp.path().join("daemon.sock")),
            secret: secret.map(str::to_string),
            heartbeat_interval: Duration::from_secs(15),
        },
    );
    let run = daemon.clone();
    tokio::spawn(async move { run.run().await });

    // Wait for the socket to appear.
    let sock = tmp.path().join("daemon.sock");
    for _ in 0..50 {
        if sock.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    daemon
}

async fn recv(lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>) -> Frame {
    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("frame within 5s")
        .expect("socket read")
        .expect("socket open");
    Frame::parse(&line).expect("valid frame")
}

#[tokio::test]
async fn proxy_style_session_round_trips_mcp() {
    let tmp = TempDir::new().unwrap();
    let daemon = start_daemon(&tmp, Some("shared-secret")).await;

    let stream = UnixStream::connect(tmp.path().join("daemon.sock"))
        .await
        .expect("connect");
    let (read, write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut write_stream = write;

    let hello = Frame::Hello {
        protocol: PROTOCOL_VERSION,
        session_id: "it-session".into(),
        client_id: Some("integration-test".into()),
        token: Some("shared-secret".into()),
    };
    write_stream
        .write_all(hello.encode().unwrap().as_bytes())
        .await
        .unwrap();

    match recv(&mut lines).await {
        Frame::Welcome { session_id, .. } => assert_eq!(session_id, "it-session"),
        other => panic!("expected welcome, got {other:?}"),
    }

    // MCP handshake through the wrapped channel.
    let initialize = Frame::Mcp {
        session_id: "it-session".into(),
        payload: serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "it", "version": "0.0.0"}
            }
        }),
    };
    write_stream
        .write_all(initialize.encode().unwrap().as_bytes())
        .await
        .unwrap();
    match recv(&mut lines).await {
        Frame::Mcp { payload, .. } => {
            assert_eq!(payload["id"], serde_json::json!(1));
            assert!(payload["result"]["serverInfo"].is_object());
        }
        other => panic!("expected initialize response, got {other:?}"),
    }

    let initialized = Frame::Mcp {
        session_id: "it-session".into(),
        payload: serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }),
    };
    write_stream
        .write_all(initialized.encode().unwrap().as_bytes())
        .await
        .unwrap();

    // The session advertises exactly the five meta-tools.
    let list = Frame::Mcp {
        session_id: "it-session".into(),
        payload: serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/list"
        }),
    };
    write_stream
        .write_all(list.encode().unwrap().as_bytes())
        .await
        .unwrap();
    match recv(&mut lines).await {
        Frame::Mcp { payload, .. } => {
            let tools = payload["result"]["tools"].as_array().expect("tool list");
            let mut names: Vec<&str> = tools
                .iter()
                .map(|t| t["name"].as_str().unwrap())
                .collect();
            names.sort();
            assert_eq!(
                names,
                vec![
                    "clear_selection_cache",
                    "describe_tools",
                    "execute",
                    "find_tools",
                    "list_namespaces"
                ]
            );
        }
        other => panic!("expected tools/list response, got {other:?}"),
    }

    // A find_tools call over the empty fleet returns an empty result set.
    let find = Frame::Mcp {
        session_id: "it-session".into(),
        payload: serde_json::json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {
                "name": "find_tools",
                "arguments": {"query": "read a file"}
            }
        }),
    };
    write_stream
        .write_all(find.encode().unwrap().as_bytes())
        .await
        .unwrap();
    match recv(&mut lines).await {
        Frame::Mcp { payload, .. } => {
            let text = payload["result"]["content"][0]["text"]
                .as_str()
                .expect("text content");
            let body: serde_json::Value = serde_json::from_str(text).unwrap();
            assert_eq!(body["totalMatches"], serde_json::json!(0));
            assert!(body["tools"].as_array().unwrap().is_empty());
        }
        other => panic!("expected find_tools response, got {other:?}"),
    }

    // The monitor-facing session list sees this client.
    let views = daemon.session_views();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].id, "it-session");
    assert_eq!(views[0].client_id.as_deref(), Some("integration-test"));

    // Daemon shutdown notifies the client before the socket goes away.
    daemon.shutdown_token().cancel();
    loop {
        match recv(&mut lines).await {
            Frame::Shutdown { .. } => break,
            Frame::Ping | Frame::Pong => continue,
            other => panic!("expected shutdown, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn missing_secret_is_unauthorized() {
    let tmp = TempDir::new().unwrap();
    let _daemon = start_daemon(&tmp, Some("s3cret")).await;

    let stream = UnixStream::connect(tmp.path().join("daemon.sock"))
        .await
        .expect("connect");
    let (read, write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut write_stream = write;

    let hello = Frame::Hello {
        protocol: PROTOCOL_VERSION,
        session_id: "nope".into(),
        client_id: None,
        token: None,
    };
    write_stream
        .write_all(hello.encode().unwrap().as_bytes())
        .await
        .unwrap();

    match recv(&mut lines).await {
        Frame::Error { reason } => assert_eq!(reason, "unauthorized"),
        other => panic!("expected error, got {other:?}"),
    }
}
