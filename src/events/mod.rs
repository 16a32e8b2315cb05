//! Inbound event fan-out.
//!
//! One publisher (the active session) feeds any number of subscribers. Each
//! subscriber has its own bounded buffer; on overflow its oldest event is
//! dropped, so a slow subscriber never blocks the publisher or other
//! subscribers.

mod broadcaster;

pub use broadcaster::{EventBroadcaster, EventStream};

use serde_json::{Map, Value};

use crate::envelope::{Envelope, MessageType};
use crate::session::ConnectionState;

/// Everything a subscriber can observe
#[derive(Debug, Clone)]
pub enum Event {
    StateChanged {
        key: Option<String>,
        previous: ConnectionState,
        current: ConnectionState,
    },
    /// Raw inbound frame from the active transport
    Inbound { key: String, envelope: Envelope },
    Session(SessionEvent),
}

impl Event {
    pub fn kind_label(&self) -> &'static str {
        match self {
            Event::StateChanged { .. } => "state_changed",
            Event::Inbound { .. } => "inbound",
            Event::Session(_) => "session",
        }
    }
}

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionStarted { session_key: String },
    SessionEnded { session_key: String },
    StatusUpdate {
        session_key: String,
        payload: Map<String, Value>,
    },
    Error { session_key: String, message: String },
}

impl SessionEvent {
    /// Interpret an inbound control frame, if it is one
    pub fn from_envelope(session_key: &str, envelope: &Envelope) -> Option<Self> {
        let session_key = session_key.to_string();
        match envelope.kind()? {
            MessageType::SessionStart => Some(SessionEvent::SessionStarted { session_key }),
            MessageType::SessionStop => Some(SessionEvent::SessionEnded { session_key }),
            MessageType::SessionStatus => Some(SessionEvent::StatusUpdate {
                session_key,
                payload: envelope.payload.clone(),
            }),
            MessageType::Error => {
                let message = envelope
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("remote error")
                    .to_string();
                Some(SessionEvent::Error {
                    session_key,
                    message,
                })
            }
            _ => None,
        }
    }

    pub fn session_key(&self) -> &str {
        match self {
            SessionEvent::SessionStarted { session_key }
            | SessionEvent::SessionEnded { session_key }
            | SessionEvent::StatusUpdate { session_key, .. }
            | SessionEvent::Error { session_key, .. } => session_key,
        }
    }
}
