use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::config::MIN_SUBSCRIBER_BUFFER;
use crate::metrics::{BroadcastMetrics, SessionMetrics};
use crate::session::ConnectionState;

use super::Event;

struct Subscriber {
    id: u64,
    buffer: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Subscriber {
    /// Never blocks: a full buffer loses its oldest event
    fn push(&self, event: Event) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                BroadcastMetrics::record_dropped();
            }
            buffer.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct Registry {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Registry {
    fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.id != id);
        BroadcastMetrics::set_subscribers(subscribers.len());
    }
}

/// Fans events out to subscribers and holds the authoritative connection state
pub struct EventBroadcaster {
    registry: Arc<Registry>,
    state: RwLock<ConnectionState>,
    buffer: usize,
}

impl EventBroadcaster {
    /// `buffer` is the per-subscriber capacity, raised to at least 50
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            state: RwLock::new(ConnectionState::Disconnected),
            buffer: buffer.max(MIN_SUBSCRIBER_BUFFER),
        }
    }

    pub fn subscribe(&self) -> EventStream {
        let subscriber = Arc::new(Subscriber {
            id: self.registry.next_id.fetch_add(1, Ordering::Relaxed),
            buffer: Mutex::new(VecDeque::with_capacity(self.buffer)),
            capacity: self.buffer,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        {
            let mut subscribers = self.registry.subscribers.lock();
            if self.registry.closed.load(Ordering::Acquire) {
                subscriber.closed.store(true, Ordering::Release);
            } else {
                subscribers.push(subscriber.clone());
                BroadcastMetrics::set_subscribers(subscribers.len());
            }
        }

        tracing::debug!(subscriber_id = subscriber.id, "Event subscriber registered");

        EventStream {
            subscriber,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to every subscriber without waiting on any of them
    pub fn publish(&self, event: Event) {
        let subscribers = self.registry.subscribers.lock().clone();
        BroadcastMetrics::record_published(event.kind_label());

        if let Some((last, rest)) = subscribers.split_last() {
            for subscriber in rest {
                subscriber.push(event.clone());
            }
            last.push(event);
        }
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns the previous state on success. The state change and its event
    /// are applied under one lock, so subscribers see transitions in order.
    pub fn try_transition(&self, key: Option<&str>, next: ConnectionState) -> Option<ConnectionState> {
        let mut state = self.state.write();
        let previous = *state;
        if !previous.can_transition_to(next) {
            tracing::debug!(from = %previous, to = %next, "Ignoring invalid state transition");
            return None;
        }
        *state = next;

        SessionMetrics::record_transition(next.as_str(), next.code());
        tracing::info!(key = ?key, from = %previous, to = %next, "Connection state changed");

        self.publish(Event::StateChanged {
            key: key.map(str::to_string),
            previous,
            current: next,
        });
        Some(previous)
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.lock().len()
    }

    /// End every stream. Subscribers still receive what is already buffered.
    pub fn close(&self) {
        self.registry.closed.store(true, Ordering::Release);
        let subscribers = std::mem::take(&mut *self.registry.subscribers.lock());
        for subscriber in &subscribers {
            subscriber.close();
        }
        BroadcastMetrics::set_subscribers(0);
    }
}

/// One subscriber's view of the event feed
pub struct EventStream {
    subscriber: Arc<Subscriber>,
    registry: Weak<Registry>,
}

impl EventStream {
    /// Next event, or `None` once the broadcaster is closed and the buffer is empty
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.subscriber.buffer.lock().pop_front() {
                return Some(event);
            }
            if self.subscriber.closed.load(Ordering::Acquire) {
                return None;
            }
            self.subscriber.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.subscriber.buffer.lock().pop_front()
    }

    /// Events this subscriber lost to overflow
    pub fn dropped(&self) -> u64 {
        self.subscriber.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> {
        futures::stream::unfold(self, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.subscriber.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use futures::StreamExt;
    use std::time::Duration;

    fn inbound(n: u64) -> Event {
        Event::Inbound {
            key: "s1".into(),
            envelope: Envelope::with_json("verdict", serde_json::json!({ "n": n })),
        }
    }

    fn number(event: &Event) -> u64 {
        match event {
            Event::Inbound { envelope, .. } => envelope.payload["n"].as_u64().unwrap(),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event() {
        let broadcaster = EventBroadcaster::new(64);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.publish(inbound(1));
        broadcaster.publish(inbound(2));

        for stream in [&mut a, &mut b] {
            assert_eq!(number(&stream.recv().await.unwrap()), 1);
            assert_eq!(number(&stream.recv().await.unwrap()), 2);
            assert!(stream.try_recv().is_none());
        }
    }

    #[test]
    fn test_buffer_floor() {
        let broadcaster = EventBroadcaster::new(1);
        let mut stream = broadcaster.subscribe();
        for n in 0..MIN_SUBSCRIBER_BUFFER as u64 {
            broadcaster.publish(inbound(n));
        }
        assert_eq!(stream.dropped(), 0);
        assert_eq!(number(&stream.try_recv().unwrap()), 0);
    }

    #[test]
    fn test_slow_subscriber_loses_oldest() {
        let broadcaster = EventBroadcaster::new(50);
        let mut slow = broadcaster.subscribe();

        for n in 0..60 {
            broadcaster.publish(inbound(n));
        }

        assert_eq!(slow.dropped(), 10);
        assert_eq!(number(&slow.try_recv().unwrap()), 10);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let broadcaster = Arc::new(EventBroadcaster::new(64));
        let mut stream = broadcaster.subscribe();

        let publisher = broadcaster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(inbound(7));
        });

        let event = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(number(&event), 7);
    }

    #[tokio::test]
    async fn test_transitions_update_state_and_publish() {
        let broadcaster = EventBroadcaster::new(64);
        let mut stream = broadcaster.subscribe();

        assert_eq!(
            broadcaster.try_transition(Some("s1"), ConnectionState::Connecting),
            Some(ConnectionState::Disconnected)
        );
        assert_eq!(broadcaster.try_transition(Some("s1"), ConnectionState::Reconnecting), None);
        assert_eq!(broadcaster.current_state(), ConnectionState::Connecting);

        match stream.recv().await.unwrap() {
            Event::StateChanged { previous, current, .. } => {
                assert_eq!(previous, ConnectionState::Disconnected);
                assert_eq!(current, ConnectionState::Connecting);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes_and_close_ends_streams() {
        let broadcaster = EventBroadcaster::new(64);
        let first = broadcaster.subscribe();
        let second = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(first);
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.publish(inbound(1));
        broadcaster.close();

        let collected: Vec<Event> = second.into_stream().collect().await;
        assert_eq!(collected.len(), 1);
        assert!(broadcaster.subscribe().recv().await.is_none());
    }
}
