//! Minimal WebSocket client helpers for talking to the daemon.

use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::types::{ControlMessage, Incoming};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// Connect to the daemon and return the WS stream
pub async fn connect(url: &str) -> anyhow::Result<WsStream> {
    let (ws, _) = connect_async(url)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    Ok(ws)
}

pub async fn send_control(ws: &mut WsStream, msg: &ControlMessage) -> anyhow::Result<()> {
    ws.send(Message::Text(serde_json::to_string(msg)?)).await?;
    Ok(())
}

pub async fn subscribe(ws: &mut WsStream, channel: &str) -> anyhow::Result<()> {
    send_control(
        ws,
        &ControlMessage::Subscribe {
            channel: channel.to_string(),
        },
    )
    .await
}

pub async fn request_agent_status(ws: &mut WsStream, agent_id: &str) -> anyhow::Result<()> {
    send_control(
        ws,
        &ControlMessage::RequestAgentStatus {
            agent_id: agent_id.to_string(),
        },
    )
    .await
}

/// Next text frame as raw JSON plus its parsed form. `None` once the daemon
/// closes the connection.
pub async fn next_message(ws: &mut WsStream) -> Option<anyhow::Result<(String, Incoming)>> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => {
                let parsed = Incoming::parse(&text).map_err(anyhow::Error::from);
                return Some(parsed.map(|m| (text, m)));
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => return Some(Err(e.into())),
        }
    }
}

async fn wait_for_pong(ws: &mut WsStream, started: Instant) -> anyhow::Result<Duration> {
    while let Some(msg) = next_message(ws).await {
        if let (_, Incoming::Pong { .. }) = msg? {
            return Ok(started.elapsed());
        }
    }
    bail!("connection closed before pong")
}

/// Send a ping and wait for the pong, skipping any broadcast traffic queued
/// ahead of it. Returns the round-trip time.
pub async fn ping(ws: &mut WsStream, timeout: Duration) -> anyhow::Result<Duration> {
    let started = Instant::now();
    send_control(ws, &ControlMessage::Ping).await?;
    tokio::time::timeout(timeout, wait_for_pong(ws, started))
        .await
        .context("timed out waiting for pong")?
}
