//! End-to-end: a real daemon on ephemeral ports and a real WebSocket viewer.
use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use officesync_daemon::config::{Config, StatePaths};
use officesync_daemon::orchestrator::Orchestrator;

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn seed(root: &Path) {
    let paths = StatePaths::new(root);
    for (agent, status) in [("forge", "idle"), ("scout", "active")] {
        std::fs::create_dir_all(paths.agent_dir(agent)).unwrap();
        std::fs::write(
            paths.agent_state(agent),
            format!(r#"{{"status":"{status}","tasksCompleted":1}}"#),
        )
        .unwrap();
    }
    std::fs::write(&paths.office_state, r#"{"positions":{"scout":[1,2]}}"#).unwrap();
}

fn config(root: &Path) -> Config {
    Config {
        workspace_root: root.to_path_buf(),
        ws_port: 0,
        http_port: 0,
        ..Config::default()
    }
}

/// Next message whose `type` is one of `kinds`, skipping periodic traffic.
async fn next_of(ws: &mut Viewer, kinds: &[&str]) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(t))) => {
                    let v: Value = serde_json::from_str(&t).unwrap();
                    if kinds.contains(&v["type"].as_str().unwrap_or_default()) {
                        return v;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

#[tokio::test]
async fn snapshot_then_control_then_live_updates() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let orch = Orchestrator::start(&config(dir.path())).await.unwrap();
    let url = format!("ws://127.0.0.1:{}/ws", orch.ws_addr().port());
    let (mut ws, _) = connect_async(url).await.unwrap();

    // snapshot: office state first, then agents in id order
    let office = next_of(&mut ws, &["agent_position", "agent_status"]).await;
    assert_eq!(office["type"], "agent_position");
    assert_eq!(office["source"], "mission-control");
    let first = next_of(&mut ws, &["agent_status"]).await;
    let second = next_of(&mut ws, &["agent_status"]).await;
    assert_eq!(first["data"]["agent"], "forge");
    assert_eq!(second["data"]["agent"], "scout");

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    let pong = next_of(&mut ws, &["pong"]).await;
    assert!(pong["timestamp"].is_string());

    ws.send(Message::Text(
        r#"{"type":"request_agent_status","agentId":"scout"}"#.into(),
    ))
    .await
    .unwrap();
    let status = loop {
        let v = next_of(&mut ws, &["agent_status"]).await;
        if v["data"]["agent"] == "scout" {
            break v;
        }
    };
    assert_eq!(status["data"]["state"]["status"], "active");

    let paths = StatePaths::new(dir.path());
    std::fs::write(paths.agent_state("scout"), r#"{"status":"busy","tasksCompleted":2}"#).unwrap();
    let update = loop {
        let v = next_of(&mut ws, &["agent_status"]).await;
        if v["data"]["state"]["status"] == "busy" {
            break v;
        }
    };
    assert_eq!(update["data"]["agent"], "scout");
    assert_eq!(orch.status().websocket_clients, 1);

    orch.stop().await;
    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "viewer was not disconnected on stop");
}

#[tokio::test]
async fn query_server_answers_status() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let orch = Orchestrator::start(&config(dir.path())).await.unwrap();
    let status = orch.status();
    assert!(status.running);
    assert_eq!(status.agents_tracked, 2);
    assert!(status.tasks.iter().all(|t| t.running));

    // Plain HTTP/1.1 over a raw socket keeps the test free of an HTTP client.
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut sock = TcpStream::connect(("127.0.0.1", orch.http_addr().port()))
        .await
        .unwrap();
    sock.write_all(b"GET /api/websocket/status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut resp = String::new();
    sock.read_to_string(&mut resp).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"));
    assert!(resp.contains("\"connectedClients\":0"));

    orch.stop().await;
}
