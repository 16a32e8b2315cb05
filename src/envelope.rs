//! Message envelope exchanged with the remote analysis service.
//!
//! The envelope is transport-format-agnostic: `type` selects the handling,
//! `payload` is carried opaquely. Types outside [`MessageType`] pass through
//! untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Control message types understood by the transport core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    SessionStart,
    SessionStop,
    SessionStatus,
    Notification,
    Error,
    Ping,
    Pong,
    Heartbeat,
    ContentBundle,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::SessionStart => "session-start",
            MessageType::SessionStop => "session-stop",
            MessageType::SessionStatus => "session-status",
            MessageType::Notification => "notification",
            MessageType::Error => "error",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Heartbeat => "heartbeat",
            MessageType::ContentBundle => "content-bundle",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "session-start" => Some(MessageType::SessionStart),
            "session-stop" => Some(MessageType::SessionStop),
            "session-status" => Some(MessageType::SessionStatus),
            "notification" => Some(MessageType::Notification),
            "error" => Some(MessageType::Error),
            "ping" => Some(MessageType::Ping),
            "pong" => Some(MessageType::Pong),
            "heartbeat" => Some(MessageType::Heartbeat),
            "content-bundle" => Some(MessageType::ContentBundle),
            _ => None,
        }
    }

    pub fn is_session_control(&self) -> bool {
        matches!(
            self,
            MessageType::SessionStart | MessageType::SessionStop | MessageType::SessionStatus
        )
    }
}

/// Logical message shape: `{ type, payload, timestamp }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Envelope of a known control type with an empty payload
    pub fn control(message_type: MessageType) -> Self {
        Self::new(message_type.as_str(), Map::new())
    }

    /// Build from a JSON object value; non-object payloads are wrapped under `"value"`
    pub fn with_json(message_type: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(message_type, payload)
    }

    pub fn ping() -> Self {
        Self::control(MessageType::Ping)
    }

    pub fn pong() -> Self {
        Self::control(MessageType::Pong)
    }

    pub fn heartbeat() -> Self {
        Self::control(MessageType::Heartbeat)
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::parse(&self.message_type)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// A message parked in the outbound queue while the session is offline
#[derive(Debug, Clone)]
pub enum QueuedMessage {
    /// session-start / session-stop / session-status
    SessionControl {
        envelope: Envelope,
        enqueued_at: DateTime<Utc>,
    },
    /// Captured content (text, image cues, audio cues) bundled for analysis
    ContentBundle {
        envelope: Envelope,
        enqueued_at: DateTime<Utc>,
    },
    /// Anything else, passed through opaquely
    Payload {
        envelope: Envelope,
        enqueued_at: DateTime<Utc>,
    },
}

impl QueuedMessage {
    /// Tag an envelope by its type and stamp it with the enqueue time
    pub fn new(envelope: Envelope) -> Self {
        let enqueued_at = Utc::now();
        match envelope.kind() {
            Some(kind) if kind.is_session_control() => QueuedMessage::SessionControl {
                envelope,
                enqueued_at,
            },
            Some(MessageType::ContentBundle) => QueuedMessage::ContentBundle {
                envelope,
                enqueued_at,
            },
            _ => QueuedMessage::Payload {
                envelope,
                enqueued_at,
            },
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            QueuedMessage::SessionControl { envelope, .. }
            | QueuedMessage::ContentBundle { envelope, .. }
            | QueuedMessage::Payload { envelope, .. } => envelope,
        }
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        match self {
            QueuedMessage::SessionControl { enqueued_at, .. }
            | QueuedMessage::ContentBundle { enqueued_at, .. }
            | QueuedMessage::Payload { enqueued_at, .. } => *enqueued_at,
        }
    }

    /// Check if the message has outlived `ttl_secs`
    pub fn is_expired(&self, ttl_secs: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.enqueued_at());
        age.num_seconds() >= ttl_secs as i64
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            QueuedMessage::SessionControl { .. } => "session_control",
            QueuedMessage::ContentBundle { .. } => "content_bundle",
            QueuedMessage::Payload { .. } => "payload",
        }
    }
}
