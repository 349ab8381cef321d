//! WebSocket upgrade and per-connection handler.
//!
//! Each connection drains its broadcaster queue onto the socket and answers
//! control messages from the viewer. A closed queue means the broadcaster
//! dropped us (stalled, or shutting down) and the socket is closed.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tracing::{debug, info, warn};

use crate::broadcaster::{Broadcaster, ClientId};
use crate::state::AppState;
use crate::types::{now_iso, ClientMessage, ControlReply};

/// A single send slower than this marks the viewer as dead.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.broadcaster))
}

async fn send(socket: &mut WebSocket, text: String) -> bool {
    match tokio::time::timeout(SEND_TIMEOUT, socket.send(Message::Text(text))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("send failed: {e}");
            false
        }
        Err(_) => {
            warn!("send timed out after {SEND_TIMEOUT:?}");
            false
        }
    }
}

pub async fn handle_socket(mut socket: WebSocket, broadcaster: Broadcaster) {
    let (id, mut rx) = broadcaster.register_client();

    // Unregister on every exit path.
    struct ClientGuard(Broadcaster, ClientId);
    impl Drop for ClientGuard {
        fn drop(&mut self) {
            self.0.unregister_client(self.1);
        }
    }
    let _guard = ClientGuard(broadcaster.clone(), id);

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(text) => {
                    if !send(&mut socket, text).await {
                        break;
                    }
                }
                None => {
                    let _ = tokio::time::timeout(SEND_TIMEOUT, socket.send(Message::Close(None))).await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_control(&broadcaster, &text) {
                        if !send(&mut socket, reply).await {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("client {id} socket error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    info!("client {id} session ended");
}

/// Answer one viewer control message. Malformed input is logged and ignored.
pub fn handle_control(broadcaster: &Broadcaster, text: &str) -> Option<String> {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("ignoring malformed control message: {e}");
            return None;
        }
    };
    match msg {
        ClientMessage::Ping => serde_json::to_string(&ControlReply::Pong {
            timestamp: now_iso(),
        })
        .ok(),
        ClientMessage::Subscribe { channel } => {
            serde_json::to_string(&ControlReply::Subscribed { channel }).ok()
        }
        ClientMessage::RequestAgentStatus { agent_id } => {
            let env = broadcaster.agent_status_envelope(&agent_id);
            if env.is_none() {
                debug!("status requested for unknown agent {agent_id}");
            }
            env.map(|e| e.to_json())
        }
    }
}
