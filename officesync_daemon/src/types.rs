//! Data types exchanged with viewers over WebSocket, plus the agent state
//! document we read from disk. Keep this module minimal and stable: it defines
//! the wire format.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_SOURCE: &str = "mission-control";

/// Envelope `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStatus,
    AgentActivity,
    TaskUpdate,
    SystemMetric,
    Notification,
    Heartbeat,
    AgentPosition,
    FileChange,
}

/// Every broadcaster-to-viewer message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub timestamp: String,
    pub data: Value,
    pub source: String,
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Envelope {
    pub fn new(kind: EventType, data: Value) -> Self {
        Self {
            kind,
            timestamp: now_iso(),
            data,
            source: DEFAULT_SOURCE.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Value-only payloads cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum AgentStatus {
    Idle,
    Active,
    Busy,
    #[default]
    Unknown,
}

impl From<String> for AgentStatus {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "idle" => AgentStatus::Idle,
            "active" => AgentStatus::Active,
            "busy" => AgentStatus::Busy,
            _ => AgentStatus::Unknown,
        }
    }
}

/// Typed view of a per-agent `state.json`, used for metrics. Viewers get the
/// document itself, not this view. A `null` counter or list reads as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuntimeState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: AgentStatus,
    #[serde(default, alias = "current_tasks", deserialize_with = "null_as_default")]
    pub current_tasks: Vec<Value>,
    #[serde(default, alias = "tasks_completed", deserialize_with = "null_as_default")]
    pub tasks_completed: u64,
    #[serde(default, alias = "tasks_failed", deserialize_with = "null_as_default")]
    pub tasks_failed: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

impl AgentRuntimeState {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Optional numeric field, accepting camelCase or snake_case spelling.
    pub fn extra_f64(&self, camel: &str, snake: &str) -> Option<f64> {
        self.extra
            .get(camel)
            .or_else(|| self.extra.get(snake))
            .and_then(Value::as_f64)
    }

    pub fn extra_u64(&self, camel: &str, snake: &str) -> Option<u64> {
        self.extra
            .get(camel)
            .or_else(|| self.extra.get(snake))
            .and_then(Value::as_u64)
    }
}

/// Viewer-to-server control messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Subscribe {
        #[serde(default)]
        channel: Option<String>,
    },
    RequestAgentStatus {
        #[serde(rename = "agentId", alias = "agent_id")]
        agent_id: String,
    },
}

/// Direct replies to control messages (not envelopes).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    Pong { timestamp: String },
    Subscribed { channel: Option<String> },
}
