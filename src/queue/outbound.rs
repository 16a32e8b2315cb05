//! Bounded drop-oldest outbound queue with ordered flush

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::QueueConfig;
use crate::envelope::QueuedMessage;
use crate::metrics::QueueMetrics;
use crate::transport::{Transport, TransportError};

struct Entry {
    seq: u64,
    message: QueuedMessage,
}

/// Result of a flush
#[derive(Debug)]
pub enum FlushOutcome {
    /// Another flush was running; nothing was done
    AlreadyFlushing,
    /// Queue drained
    Completed { sent: usize },
    /// A send failed; unsent messages stay queued for the next flush
    Interrupted {
        sent: usize,
        remaining: usize,
        error: TransportError,
    },
    /// Sends kept failing across flushes; the queue was cleared
    Discarded {
        sent: usize,
        dropped: usize,
        error: TransportError,
    },
}

impl FlushOutcome {
    pub fn sent(&self) -> usize {
        match self {
            FlushOutcome::AlreadyFlushing => 0,
            FlushOutcome::Completed { sent }
            | FlushOutcome::Interrupted { sent, .. }
            | FlushOutcome::Discarded { sent, .. } => *sent,
        }
    }
}

/// Clears the flushing flag even if the flush future is dropped
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Messages waiting for a connection, oldest first
pub struct OutboundQueue {
    key: String,
    config: QueueConfig,
    messages: Mutex<VecDeque<Entry>>,
    next_seq: AtomicU64,
    flushing: AtomicBool,
    /// Consecutive flushes that ended in a send failure
    failed_flushes: AtomicU32,
}

impl OutboundQueue {
    pub fn new(key: impl Into<String>, config: QueueConfig) -> Self {
        assert!(config.max_queue_size > 0, "max_queue_size must be at least 1");
        Self {
            key: key.into(),
            config,
            messages: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            flushing: AtomicBool::new(false),
            failed_flushes: AtomicU32::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append a message. When full, the oldest message is dropped and returned.
    pub fn enqueue(&self, message: QueuedMessage) -> Option<QueuedMessage> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut messages = self.messages.lock();

        // If queue is full, remove oldest message
        let dropped = if messages.len() >= self.config.max_queue_size {
            messages.pop_front().map(|entry| {
                QueueMetrics::record_dropped();
                tracing::debug!(
                    key = %self.key,
                    dropped_type = %entry.message.envelope().message_type,
                    queue_size = messages.len(),
                    "Dropped oldest message from full queue"
                );
                entry.message
            })
        } else {
            None
        };

        tracing::debug!(
            key = %self.key,
            kind = message.kind_label(),
            queue_size = messages.len() + 1,
            "Message queued while offline"
        );
        messages.push_back(Entry { seq, message });
        QueueMetrics::record_enqueued();

        dropped
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Copy of the queued messages, oldest first
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.messages
            .lock()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Drop everything. Returns the number of dropped messages.
    pub fn clear(&self) -> usize {
        let count = {
            let mut messages = self.messages.lock();
            let count = messages.len();
            messages.clear();
            count
        };
        if count > 0 {
            QueueMetrics::record_cleared(count);
            tracing::debug!(key = %self.key, count, "Cleared outbound queue");
        }
        count
    }

    /// Remove and return every message, oldest first
    pub fn drain_all(&self) -> Vec<QueuedMessage> {
        let drained: Vec<QueuedMessage> = self
            .messages
            .lock()
            .drain(..)
            .map(|e| e.message)
            .collect();
        QueueMetrics::record_cleared(drained.len());
        drained
    }

    /// Drop messages older than the configured TTL
    pub fn cleanup_expired(&self) -> usize {
        let ttl = self.config.message_ttl_secs;
        let expired = {
            let mut messages = self.messages.lock();
            let before = messages.len();
            messages.retain(|e| !e.message.is_expired(ttl));
            before - messages.len()
        };

        if expired > 0 {
            QueueMetrics::record_expired(expired as u64);
            tracing::debug!(key = %self.key, expired, "Removed expired queued messages");
        }
        expired
    }

    /// Send queued messages in order over `transport`.
    ///
    /// Stops at the first failed send, leaving the rest queued. After
    /// `max_flush_failures` consecutive failed flushes the queue is cleared.
    /// A flush requested while another is running returns immediately.
    pub async fn flush(&self, transport: &dyn Transport) -> FlushOutcome {
        if self.flushing.swap(true, Ordering::AcqRel) {
            tracing::debug!(key = %self.key, "Flush already in progress");
            return FlushOutcome::AlreadyFlushing;
        }
        let _guard = FlushGuard(&self.flushing);

        let send_timeout = self.config.send_timeout();
        let delay = self.config.flush_delay();
        let mut sent = 0usize;

        loop {
            let next = self
                .messages
                .lock()
                .front()
                .map(|e| (e.seq, e.message.envelope().clone()));
            let Some((seq, envelope)) = next else {
                break;
            };

            let result = match tokio::time::timeout(send_timeout, transport.send(&envelope)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(send_timeout)),
            };

            if let Err(error) = result {
                let failures = self.failed_flushes.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.max_flush_failures {
                    let dropped = self.clear();
                    self.failed_flushes.store(0, Ordering::Release);
                    tracing::warn!(
                        key = %self.key,
                        failures,
                        dropped,
                        error = %error,
                        "Flush keeps failing, discarding queued messages"
                    );
                    return FlushOutcome::Discarded {
                        sent,
                        dropped,
                        error,
                    };
                }

                let remaining = self.len();
                tracing::warn!(
                    key = %self.key,
                    sent,
                    remaining,
                    error = %error,
                    "Flush interrupted, keeping remaining messages queued"
                );
                return FlushOutcome::Interrupted {
                    sent,
                    remaining,
                    error,
                };
            }

            sent += 1;
            let more = {
                let mut messages = self.messages.lock();
                // The front may have been dropped by a concurrent enqueue
                if messages.front().map(|e| e.seq) == Some(seq) {
                    messages.pop_front();
                    QueueMetrics::record_flushed();
                }
                !messages.is_empty()
            };

            if more && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        self.failed_flushes.store(0, Ordering::Release);
        if sent > 0 {
            tracing::info!(key = %self.key, sent, "Flushed outbound queue");
        }
        FlushOutcome::Completed { sent }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::transport::{MemoryTransportFactory, SignalHandler, TransportFactory};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(max: usize) -> QueueConfig {
        QueueConfig {
            max_queue_size: max,
            flush_delay_ms: 0,
            ..QueueConfig::default()
        }
    }

    fn message(n: u64) -> QueuedMessage {
        QueuedMessage::new(Envelope::with_json("content-bundle", json!({ "n": n })))
    }

    fn numbers(envelopes: &[Envelope]) -> Vec<u64> {
        envelopes
            .iter()
            .map(|e| e.payload["n"].as_u64().unwrap())
            .collect()
    }

    async fn memory_transport(factory: &MemoryTransportFactory) -> Arc<dyn Transport> {
        let handler: SignalHandler = Arc::new(|_| {});
        factory.connect("s1", handler).await.unwrap()
    }

    #[test]
    fn test_enqueue_drops_oldest_when_full() {
        let queue = OutboundQueue::new("s1", config(3));
        for n in 0..3 {
            assert!(queue.enqueue(message(n)).is_none());
        }

        let dropped = queue.enqueue(message(3)).unwrap();
        assert_eq!(dropped.envelope().payload["n"], 0);

        let kept: Vec<_> = queue
            .snapshot()
            .iter()
            .map(|m| m.envelope().payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(kept, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_flush_preserves_order() {
        let factory = MemoryTransportFactory::new();
        let transport = memory_transport(&factory).await;
        let queue = OutboundQueue::new("s1", config(10));
        for n in 0..5 {
            queue.enqueue(message(n));
        }

        let outcome = queue.flush(transport.as_ref()).await;
        assert!(matches!(outcome, FlushOutcome::Completed { sent: 5 }));
        assert!(queue.is_empty());
        assert_eq!(numbers(&factory.latest("s1").unwrap().sent()), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_interrupted_flush_keeps_remaining() {
        let factory = MemoryTransportFactory::new();
        let transport = memory_transport(&factory).await;
        factory.latest("s1").unwrap().drop_after(2);

        let queue = OutboundQueue::new("s1", config(10));
        for n in 0..5 {
            queue.enqueue(message(n));
        }

        match queue.flush(transport.as_ref()).await {
            FlushOutcome::Interrupted { sent, remaining, .. } => {
                assert_eq!(sent, 2);
                assert_eq!(remaining, 3);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let next = factory.connect("s1", Arc::new(|_| {})).await.unwrap();
        assert!(matches!(
            queue.flush(next.as_ref()).await,
            FlushOutcome::Completed { sent: 3 }
        ));
        assert_eq!(numbers(&factory.latest("s1").unwrap().sent()), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_repeated_flush_failures_discard_queue() {
        let factory = MemoryTransportFactory::new();
        let transport = memory_transport(&factory).await;
        transport.close().await;

        let queue = OutboundQueue::new(
            "s1",
            QueueConfig {
                max_flush_failures: 2,
                ..config(10)
            },
        );
        queue.enqueue(message(1));
        queue.enqueue(message(2));

        assert!(matches!(
            queue.flush(transport.as_ref()).await,
            FlushOutcome::Interrupted { remaining: 2, .. }
        ));
        assert!(matches!(
            queue.flush(transport.as_ref()).await,
            FlushOutcome::Discarded { dropped: 2, .. }
        ));
        assert!(queue.is_empty());
    }

    struct SlowTransport;

    #[async_trait]
    impl Transport for SlowTransport {
        fn is_connected(&self) -> bool {
            true
        }

        async fn send(&self, _envelope: &Envelope) -> Result<(), TransportError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flush_is_noop() {
        let queue = OutboundQueue::new("s1", config(10));
        queue.enqueue(message(1));
        queue.enqueue(message(2));

        let transport = SlowTransport;
        let (first, second) = tokio::join!(queue.flush(&transport), queue.flush(&transport));

        assert!(matches!(first, FlushOutcome::Completed { sent: 2 }));
        assert!(matches!(second, FlushOutcome::AlreadyFlushing));
        assert!(!queue.is_flushing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_interrupts_flush() {
        struct Hanging;

        #[async_trait]
        impl Transport for Hanging {
            fn is_connected(&self) -> bool {
                true
            }

            async fn send(&self, _envelope: &Envelope) -> Result<(), TransportError> {
                std::future::pending::<()>().await;
                Ok(())
            }

            async fn close(&self) {}
        }

        let queue = OutboundQueue::new("s1", config(10));
        queue.enqueue(message(1));

        match queue.flush(&Hanging).await {
            FlushOutcome::Interrupted { error, remaining, .. } => {
                assert!(matches!(error, TransportError::Timeout(_)));
                assert_eq!(remaining, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_cleanup_expired() {
        let queue = OutboundQueue::new(
            "s1",
            QueueConfig {
                message_ttl_secs: 0,
                ..config(10)
            },
        );
        queue.enqueue(message(1));
        queue.enqueue(message(2));

        assert_eq!(queue.cleanup_expired(), 2);
        assert!(queue.is_empty());
    }
}
