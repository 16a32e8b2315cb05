//! Transport client contract.
//!
//! A [`Transport`] owns one physical duplex connection to one remote endpoint.
//! Transports are created by a [`TransportFactory`] and report inbound frames
//! and lifecycle changes through a [`SignalHandler`] callback.
//!
//! # Implementations
//!
//! - [`WebSocketTransportFactory`]: JSON envelopes over a WebSocket connection
//! - [`MemoryTransportFactory`]: in-process transport with scripted failures

mod memory;
mod websocket;

pub use memory::{MemoryTransport, MemoryTransportFactory};
pub use websocket::{WebSocketTransport, WebSocketTransportFactory};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::recovery::{Classify, ErrorKind};

/// Error type for transport operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Endpoint unreachable or handshake failed
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    Send(String),

    /// Malformed frame or rejected message
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl Classify for TransportError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Connect(_) | TransportError::NotConnected | TransportError::Send(_) => {
                ErrorKind::Network
            }
            TransportError::Timeout(_) => ErrorKind::Timeout,
            TransportError::Protocol(_) => ErrorKind::Protocol,
            TransportError::Auth(_) => ErrorKind::Authentication,
            TransportError::Unavailable(_) => ErrorKind::ServiceUnavailable,
        }
    }
}

/// Lifecycle and data signals emitted by a live transport
#[derive(Debug, Clone)]
pub enum TransportSignal {
    /// Inbound payload frame
    Frame(Envelope),
    /// Connection closed; `graceful` is false for unexpected drops
    Closed { graceful: bool },
    /// Unrecoverable failure reported by the transport
    Failed(String),
}

/// Callback receiving signals from one transport
pub type SignalHandler = Arc<dyn Fn(TransportSignal) + Send + Sync>;

/// One physical duplex connection.
///
/// Implementations must serialize concurrent `send` calls internally.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Creates connected transports for a session key
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        key: &str,
        on_signal: SignalHandler,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        assert_eq!(TransportError::Connect("refused".into()).kind(), ErrorKind::Network);
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(10)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(TransportError::Auth("401".into()).kind(), ErrorKind::Authentication);
        assert!(!TransportError::Protocol("bad frame".into()).kind().is_retryable());
        assert!(TransportError::Unavailable("503".into()).kind().is_retryable());
    }
}
