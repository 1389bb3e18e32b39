use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const KIND_WELCOME: &str = "welcome";
pub const KIND_CLOSE: &str = "close";
pub const KIND_SERVER_SHUTDOWN: &str = "server_shutdown";
pub const KIND_ERROR: &str = "error";

/// WebSocket close code "going away".
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// A routed hub message.
///
/// On the wire this is `{"type": ..., "data": {...}, "target": ..., "client_id": ...}`.
/// A message without a target goes to every connected client; with a target it
/// goes only to clients whose connection id or user id equals it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "data", default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(rename = "client_id", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

impl Message {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
            target: None,
            sender_id: None,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    /// The routing target, treating an empty string as "everyone".
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref().filter(|t| !t.is_empty())
    }

    pub fn welcome(connection_id: &str, user_id: &str) -> Self {
        Self::new(KIND_WELCOME)
            .with_data("client_id", connection_id)
            .with_data("user_id", user_id)
            .with_data("message", "Connected to BuddyBot hub")
    }

    pub fn close(code: u16, reason: &str) -> Self {
        Self::new(KIND_CLOSE)
            .with_data("code", code)
            .with_data("reason", reason)
    }

    pub fn server_shutdown(reason: &str) -> Self {
        Self::new(KIND_SERVER_SHUTDOWN).with_data("reason", reason)
    }

    pub fn error(message: &str) -> Self {
        Self::new(KIND_ERROR).with_data("message", message)
    }

    /// Code and reason carried by a `close` message, if this is one.
    pub fn close_details(&self) -> Option<(u16, String)> {
        if self.kind != KIND_CLOSE {
            return None;
        }
        let code = self
            .payload
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(CLOSE_GOING_AWAY);
        let reason = self
            .payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((code, reason))
    }
}
