//! JSON wire protocol for chat frames.
//!
//! Every frame, in both directions, is one JSON object:
//! ```text
//! {
//!   "type":      "text" | "system",
//!   "content":   string,
//!   "room_id":   string,
//!   "sender_id": string,
//!   "nickname":  string,
//!   "timestamp": RFC 3339 string,
//!   "metadata":  { "connectionID": string, ... }   // optional, server-side
//! }
//! ```
//!
//! Client-to-server frames only need `type` and `content`; the server fills
//! the remaining fields authoritatively before fan-out. The metadata bag is
//! an opaque string→value map so that keys this server does not know about
//! survive a decode/re-encode round trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The literal metadata key carrying the producing connection's ID.
pub const CONNECTION_ID_KEY: &str = "connectionID";

/// Frame kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A participant's chat message.
    Text,
    /// Server-generated moderation/operational notice.
    System,
}

/// A single chat frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub nickname: String,
    /// Server-assigned send time. Absent on client frames; defaulted on
    /// decode and overwritten by the session before broadcast.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ChatMessage {
    /// A text frame as stamped by the server on the inbound path.
    pub fn text(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        nickname: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::Text,
            content: content.into(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            nickname: nickname.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// A system notice. System frames carry no sender identity.
    pub fn system(room_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::System,
            content: content.into(),
            room_id: room_id.into(),
            sender_id: String::new(),
            nickname: String::new(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Refusal for a frame longer than the room's message-size limit.
    pub fn oversize_notice(room_id: &str, max_len: usize) -> Self {
        Self::system(
            room_id,
            format!("Message exceeds maximum length of {max_len} characters"),
        )
    }

    /// Refusal while the sender is inside the rate-limit window.
    pub fn rate_limited_notice(room_id: &str, wait_secs: f64) -> Self {
        Self::system(
            room_id,
            format!("Please wait {wait_secs:.1} seconds before sending another message"),
        )
    }

    /// Private reply to a non-holder sending into a locked room.
    pub fn room_locked_notice(room_id: &str) -> Self {
        Self::system(room_id, "Room is locked. Messages cannot be sent.")
    }

    /// Room-wide notice after a lock transition.
    pub fn lock_changed_notice(room_id: &str, nickname: &str, locked: bool) -> Self {
        let verb = if locked { "locked" } else { "unlocked" };
        Self::system(room_id, format!("Room has been {verb} by {nickname}"))
    }

    /// Room-wide notice emitted by the reaper for a timed-out participant.
    pub fn disconnect_notice(room_id: &str, nickname: &str) -> Self {
        Self::system(room_id, format!("{nickname} has disconnected (timeout)"))
    }

    /// Reply for a frame that did not parse as a chat frame.
    pub fn malformed_notice(room_id: &str) -> Self {
        Self::system(room_id, "Invalid message frame")
    }

    /// Set `metadata.connectionID`, preserving any other metadata keys.
    pub fn with_connection_id(mut self, connection_id: &str) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(CONNECTION_ID_KEY.into(), Value::String(connection_id.into()));
        self
    }

    /// The producing connection's ID, if stamped.
    pub fn connection_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(CONNECTION_ID_KEY))
            .and_then(Value::as_str)
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
