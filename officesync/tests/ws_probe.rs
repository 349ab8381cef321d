use std::time::Duration;

use officesync::types::Incoming;
use officesync::ws::{connect, next_message, ping, request_agent_status};

// Integration probe: only runs when OFFICESYNC_WS points at a running daemon.
// Example: OFFICESYNC_WS=ws://127.0.0.1:8765/ws cargo test -p officesync --test ws_probe -- --nocapture
#[tokio::test]
async fn probe_ws_endpoints() {
    let url = match std::env::var("OFFICESYNC_WS") {
        Ok(v) if !v.is_empty() => v,
        _ => {
            eprintln!(
                "skipping ws_probe: set OFFICESYNC_WS=ws://host:port/ws to run this integration test"
            );
            return;
        }
    };

    let mut ws = connect(&url).await.expect("connect ws");

    // The daemon sends its current snapshot first; it may be empty.
    let _ = tokio::time::timeout(Duration::from_millis(500), next_message(&mut ws)).await;

    let rtt = ping(&mut ws, Duration::from_secs(5)).await.expect("ping");
    println!("pong in {} ms", rtt.as_millis());

    if let Ok(agent) = std::env::var("OFFICESYNC_AGENT") {
        request_agent_status(&mut ws, &agent).await.expect("request status");
        let got = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok((_, msg))) = next_message(&mut ws).await {
                if let Incoming::Envelope(env) = msg {
                    if env.kind == "agent_status" && env.agent() == Some(agent.as_str()) {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(got, "no agent_status for {agent}");
    }
}
