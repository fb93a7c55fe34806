//! Wire types for the gateway's JSON-over-WebSocket protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame sent to or received from the gateway. The `type` field
/// discriminates request/response/event, matching the gateway's framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    #[serde(rename = "req")]
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    #[serde(rename = "res")]
    Response {
        id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ResponseError>,
    },
    #[serde(rename = "event")]
    Event {
        event: String,
        seq: u64,
        payload: Value,
    },
}

/// Error payload carried on a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Gateway event names the core subscribes to.
pub const EVENT_AGENT: &str = "agent";
pub const EVENT_CHAT: &str = "chat";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_TICK: &str = "tick";

/// Status values carried on an `agent` event, mapped to lifecycle transitions
/// by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEventStatus {
    Spawned,
    Running,
    Completed,
    Failed,
    Killed,
    Paused,
    Resumed,
}

impl AgentEventStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spawned" => Some(Self::Spawned),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "killed" => Some(Self::Killed),
            "paused" => Some(Self::Paused),
            "resumed" => Some(Self::Resumed),
            _ => None,
        }
    }
}

/// Parsed `agent` event payload.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub session_key: String,
    pub status: AgentEventStatus,
}

/// Parse an event frame's payload into a typed [`AgentEvent`], if it is one.
pub fn parse_agent_event(payload: &Value) -> Option<AgentEvent> {
    let session_key = payload.get("sessionKey")?.as_str()?.to_owned();
    let status = AgentEventStatus::parse(payload.get("status")?.as_str()?)?;
    Some(AgentEvent {
        session_key,
        status,
    })
}
