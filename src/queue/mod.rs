//! Outbound message queues for offline delivery.
//!
//! Each session key has its own bounded [`OutboundQueue`]. Messages sent
//! before any session exists go to the queue under [`UNBOUND_KEY`] and are
//! adopted by the next session that is initialized.

mod outbound;

pub use outbound::{FlushOutcome, OutboundQueue};

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::QueueConfig;

/// Queue holding messages sent while no session was active
pub const UNBOUND_KEY: &str = "_unbound";

/// Registry of per-session outbound queues
pub struct OutboundQueues {
    queues: DashMap<String, Arc<OutboundQueue>>,
    config: QueueConfig,
}

impl OutboundQueues {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            queues: DashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&self, key: &str) -> Arc<OutboundQueue> {
        self.queues
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OutboundQueue::new(key, self.config.clone())))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<OutboundQueue>> {
        self.queues.get(key).map(|q| q.clone())
    }

    /// Remove the queue for `key`, dropping its messages. Returns how many were dropped.
    pub fn remove(&self, key: &str) -> usize {
        self.queues
            .remove(key)
            .map(|(_, queue)| queue.clear())
            .unwrap_or(0)
    }

    /// Move every message from `from` to the end of `to`, keeping order
    pub fn adopt(&self, from: &str, to: &str) -> usize {
        if from == to {
            return 0;
        }
        let Some((_, source)) = self.queues.remove(from) else {
            return 0;
        };

        let messages = source.drain_all();
        let count = messages.len();
        if count > 0 {
            let target = self.get_or_create(to);
            for message in messages {
                target.enqueue(message);
            }
            tracing::info!(from = %from, to = %to, count, "Adopted queued messages");
        }
        count
    }

    /// Messages queued across all sessions
    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Expire old messages in every queue and drop queues left empty.
    pub fn cleanup_expired(&self) -> usize {
        let expired: usize = self.queues.iter().map(|q| q.cleanup_expired()).sum();
        self.queues
            .retain(|_, queue| !queue.is_empty() || queue.is_flushing() || Arc::strong_count(queue) > 1);
        expired
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, QueuedMessage};
    use serde_json::json;

    fn message(n: u64) -> QueuedMessage {
        QueuedMessage::new(Envelope::with_json("notification", json!({ "n": n })))
    }

    #[test]
    fn test_adopt_appends_in_order() {
        let queues = OutboundQueues::new(QueueConfig::default());
        queues.get_or_create("s1").enqueue(message(0));
        queues.get_or_create(UNBOUND_KEY).enqueue(message(1));
        queues.get_or_create(UNBOUND_KEY).enqueue(message(2));

        assert_eq!(queues.adopt(UNBOUND_KEY, "s1"), 2);
        assert!(queues.get(UNBOUND_KEY).is_none());

        let order: Vec<_> = queues
            .get("s1")
            .unwrap()
            .snapshot()
            .iter()
            .map(|m| m.envelope().payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(queues.total_depth(), 3);
    }

    #[test]
    fn test_remove_drops_messages() {
        let queues = OutboundQueues::new(QueueConfig::default());
        queues.get_or_create("s1").enqueue(message(0));
        assert_eq!(queues.remove("s1"), 1);
        assert_eq!(queues.remove("s1"), 0);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_cleanup_drops_empty_queues() {
        let queues = OutboundQueues::new(QueueConfig {
            message_ttl_secs: 0,
            ..QueueConfig::default()
        });
        queues.get_or_create("s1").enqueue(message(0));

        assert_eq!(queues.cleanup_expired(), 1);
        assert!(queues.is_empty());
    }
}
