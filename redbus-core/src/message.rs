//! Message model: the envelope every payload travels in, and the four
//! typed message bodies.
//!
//! Wire format is camelCase JSON. Parsers tolerate unknown optional
//! fields so the envelope can evolve without a flag day.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Heartbeat status emitted when a process shuts down cleanly.
pub const STOPPED_STATUS: &str = "stopped";

/// Envelope wrapping every published message.
///
/// `serialized_at` and `version` are stamped by the serializer;
/// `source` optionally names the producing process so consumers can
/// filter echoes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    #[serde(flatten)]
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub serialized_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<String>,
}

/// The typed payload of a message, discriminated by the wire `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    Admin(AdminMessage),
    Chat(ChatMessage),
    Heartbeat(HeartbeatMessage),
    Event(EventMessage),
}

/// Operational command fanned out to listeners.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdminMessage {
    pub action: String,
    pub from_admin: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Map<String, Value>>,
}

/// A chat line within a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub room_id: String,
    pub user_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Liveness report from a peer process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub process_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Domain event identified by a dotted namespace, e.g. `user.created`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

impl Envelope {
    /// Wrap a body with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(body: MessageBody) -> Self {
        Self {
            id: nanoid::nanoid!(16),
            body,
            timestamp: Utc::now(),
            serialized_at: None,
            version: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The wire discriminator for this message.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self.body {
            MessageBody::Admin(_) => "admin",
            MessageBody::Chat(_) => "chat",
            MessageBody::Heartbeat(_) => "heartbeat",
            MessageBody::Event(_) => "event",
        }
    }
}

/// Unprocessable payload forwarded to a dead-letter channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub original_channel: String,
    /// The raw payload exactly as received.
    pub original_message: String,
    pub failure_reason: String,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    #[must_use]
    pub fn new(original_channel: &str, original_message: &str, failure_reason: String) -> Self {
        Self {
            original_channel: original_channel.to_string(),
            original_message: original_message.to_string(),
            failure_reason,
            timestamp: Utc::now(),
        }
    }
}
