//! WebSocket transport.
//!
//! Each transport runs two tasks: a writer draining an mpsc channel into the
//! socket (which serializes concurrent sends) and a reader decoding JSON
//! envelopes and forwarding them to the signal handler. Inbound `ping`
//! envelopes are answered with `pong` without surfacing them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};

use crate::envelope::{Envelope, MessageType};

use super::{SignalHandler, Transport, TransportError, TransportFactory, TransportSignal};

/// Outbound frames buffered per connection before `send` waits
const OUTBOUND_BUFFER: usize = 64;

/// Connects to `{endpoint}?session={key}`
pub struct WebSocketTransportFactory {
    endpoint: String,
}

impl WebSocketTransportFactory {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn session_url(&self, key: &str) -> Result<String, TransportError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(TransportError::Protocol(format!("invalid session key '{}'", key)));
        }
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}session={}", self.endpoint, separator, key))
    }
}

fn map_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            match status {
                401 | 403 => TransportError::Auth(format!("handshake rejected with {}", status)),
                429 | 503 => TransportError::Unavailable(format!("handshake rejected with {}", status)),
                _ => TransportError::Protocol(format!("handshake rejected with {}", status)),
            }
        }
        tungstenite::Error::Url(e) => TransportError::Protocol(e.to_string()),
        other => TransportError::Connect(other.to_string()),
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn connect(
        &self,
        key: &str,
        on_signal: SignalHandler,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let url = self.session_url(key)?;
        tracing::info!(url = %url, "Connecting to WebSocket");

        let (ws_stream, response) = connect_async(url.as_str())
            .await
            .map_err(map_connect_error)?;

        tracing::info!(key = %key, status = %response.status(), "WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let writer_connected = connected.clone();
        let writer_key = key.to_string();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    tracing::debug!(key = %writer_key, error = %e, "WebSocket write failed");
                    writer_connected.store(false, Ordering::Release);
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_tx = tx.clone();
        let reader_connected = connected.clone();
        let reader_closing = closing.clone();
        let reader_key = key.to_string();
        let reader = tokio::spawn(async move {
            let graceful = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match Envelope::from_json(&text) {
                        Ok(envelope) if envelope.kind() == Some(MessageType::Ping) => {
                            if let Ok(pong) = Envelope::pong().to_json() {
                                let _ = reader_tx.send(Message::Text(pong)).await;
                            }
                        }
                        Ok(envelope) => on_signal(TransportSignal::Frame(envelope)),
                        Err(e) => {
                            tracing::warn!(key = %reader_key, error = %e, "Failed to parse inbound frame");
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = reader_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(key = %reader_key, frame = ?frame, "WebSocket closed by server");
                        break true;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(key = %reader_key, error = %e, "WebSocket error");
                        break false;
                    }
                    None => break false,
                }
            };

            reader_connected.store(false, Ordering::Release);
            let graceful = graceful || reader_closing.load(Ordering::Acquire);
            on_signal(TransportSignal::Closed { graceful });
        });

        Ok(Arc::new(WebSocketTransport {
            key: key.to_string(),
            sender: tx,
            connected,
            closing,
            reader: Mutex::new(Some(reader)),
        }))
    }
}

/// A live WebSocket connection
pub struct WebSocketTransport {
    key: String,
    sender: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let json = envelope
            .to_json()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.sender
            .send(Message::Text(json))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        let _ = self.sender.send(Message::Close(None)).await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        tracing::debug!(key = %self.key, "WebSocket transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_url() {
        let factory = WebSocketTransportFactory::new("ws://localhost:8000/ws");
        assert_eq!(
            factory.session_url("s1").unwrap(),
            "ws://localhost:8000/ws?session=s1"
        );

        let factory = WebSocketTransportFactory::new("wss://api.example.com/ws?v=2");
        assert_eq!(
            factory.session_url("abc-123").unwrap(),
            "wss://api.example.com/ws?v=2&session=abc-123"
        );
    }

    #[test]
    fn test_session_url_rejects_unsafe_keys() {
        let factory = WebSocketTransportFactory::new("ws://localhost:8000/ws");
        assert!(matches!(
            factory.session_url("a b"),
            Err(TransportError::Protocol(_))
        ));
        assert!(factory.session_url("").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        use crate::recovery::{Classify, ErrorKind};

        // Port 9 (discard) is essentially never listening on test hosts
        let factory = WebSocketTransportFactory::new("ws://127.0.0.1:9/ws");
        let handler: SignalHandler = Arc::new(|_| {});
        let err = factory.connect("s1", handler).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Network);
    }
}
