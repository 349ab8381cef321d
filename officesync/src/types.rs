//! Types that mirror the daemon's wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broadcast message from the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub source: String,
}

impl Envelope {
    /// Agent id for agent-scoped envelopes.
    pub fn agent(&self) -> Option<&str> {
        self.data.get("agent").and_then(Value::as_str)
    }
}

/// Viewer-to-daemon control messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping,
    Subscribe {
        channel: String,
    },
    RequestAgentStatus {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
}

#[derive(Debug, Clone)]
pub enum Incoming {
    Envelope(Envelope),
    Pong { timestamp: Option<String> },
    Subscribed { channel: Option<String> },
}

impl Incoming {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let v: Value = serde_json::from_str(text)?;
        let field = |k: &str| v.get(k).and_then(Value::as_str).map(str::to_string);
        Ok(match v.get("type").and_then(Value::as_str) {
            Some("pong") => Incoming::Pong {
                timestamp: field("timestamp"),
            },
            Some("subscribed") => Incoming::Subscribed {
                channel: field("channel"),
            },
            _ => Incoming::Envelope(serde_json::from_value(v)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelopes_and_replies() {
        let env = Incoming::parse(
            r#"{"type":"agent_status","timestamp":"2024-05-01T10:00:00.000Z","data":{"agent":"scout","state":{}},"source":"mission-control"}"#,
        )
        .unwrap();
        match env {
            Incoming::Envelope(e) => {
                assert_eq!(e.kind, "agent_status");
                assert_eq!(e.agent(), Some("scout"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            Incoming::parse(r#"{"type":"pong","timestamp":"x"}"#).unwrap(),
            Incoming::Pong { .. }
        ));
        assert!(matches!(
            Incoming::parse(r#"{"type":"subscribed","channel":null}"#).unwrap(),
            Incoming::Subscribed { channel: None }
        ));
        assert!(Incoming::parse(r#"{"type":"heartbeat"}"#).is_err());
    }

    #[test]
    fn control_wire_shape() {
        let v = serde_json::to_value(ControlMessage::RequestAgentStatus {
            agent_id: "forge".into(),
        })
        .unwrap();
        assert_eq!(v, serde_json::json!({"type":"request_agent_status","agentId":"forge"}));
    }
}
