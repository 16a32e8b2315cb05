//! Session facade over the pool, queues and broadcaster

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{SessionConfig, Settings};
use crate::envelope::{Envelope, QueuedMessage};
use crate::events::{Event, EventBroadcaster, EventStream, SessionEvent};
use crate::metrics::MessageMetrics;
use crate::pool::{
    connect_operation, ConnectionHandle, ConnectionPool, PoolError, PoolSignal, Priority,
};
use crate::queue::{FlushOutcome, OutboundQueues, UNBOUND_KEY};
use crate::recovery::{
    Backoff, CircuitBreakerRegistry, CircuitBreakerStats, NoopRecoveryHandler,
    RecoveryController, RecoveryHandler, RetryConfig,
};
use crate::transport::{TransportError, TransportFactory, TransportSignal};

use super::health::{ConnectionHealth, SessionHealth};
use super::ConnectionState;

struct SessionInner {
    config: SessionConfig,
    retry: RetryConfig,
    send_timeout: Duration,
    pool: Arc<ConnectionPool>,
    controller: Arc<RecoveryController>,
    broadcaster: EventBroadcaster,
    queues: OutboundQueues,
    /// Session key the facade is bound to
    active_key: RwLock<Option<String>>,
    /// Serializes initialize / disconnect / reconnect
    lifecycle: tokio::sync::Mutex<()>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped whenever a reconnect loop is started or cancelled
    reconnect_epoch: AtomicU64,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    health: SessionHealth,
}

/// The transport core as seen by its collaborators.
///
/// One session is active at a time. Cloning is cheap; clones share state.
/// Must be created inside a tokio runtime (it spawns the pool health check
/// and the signal pump).
#[derive(Clone)]
pub struct SessionTransport {
    inner: Arc<SessionInner>,
}

impl SessionTransport {
    pub fn new(settings: &Settings, factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_handler(settings, factory, Arc::new(NoopRecoveryHandler))
    }

    pub fn with_handler(
        settings: &Settings,
        factory: Arc<dyn TransportFactory>,
        handler: Arc<dyn RecoveryHandler>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(settings.circuit_breaker.clone()));
        let controller = Arc::new(RecoveryController::with_handler(breakers, handler));
        let retry = settings.retry.to_retry_config();

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(
            ConnectionPool::new(
                settings.pool.clone(),
                retry.clone(),
                factory,
                controller.clone(),
            )
            .with_signal_sender(signal_tx),
        );
        pool.start_health_checks();

        let inner = Arc::new(SessionInner {
            config: settings.session.clone(),
            retry,
            send_timeout: settings.queue.send_timeout(),
            pool,
            controller,
            broadcaster: EventBroadcaster::new(settings.events.effective_buffer()),
            queues: OutboundQueues::new(settings.queue.clone()),
            active_key: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            reconnect_task: Mutex::new(None),
            reconnect_epoch: AtomicU64::new(0),
            pump_task: Mutex::new(None),
            health: SessionHealth::new(),
        });

        let pump = tokio::spawn(signal_pump(Arc::downgrade(&inner), signal_rx));
        *inner.pump_task.lock() = Some(pump);

        Self { inner }
    }

    /// Acquire a connection for `key` and make it the active session.
    ///
    /// Messages sent while no session was active are adopted by this one.
    /// Returns false if the connection could not be established; the state is
    /// then `Error` and queued messages are kept.
    pub async fn initialize_connection(&self, key: &str) -> bool {
        self.connect(key).await.is_ok()
    }

    /// [`initialize_connection`](Self::initialize_connection) reporting why it failed
    pub async fn connect(&self, key: &str) -> Result<(), PoolError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let previous = self.active_key();
        if previous.as_deref() == Some(key)
            && self.state() == ConnectionState::Connected
            && self.inner.pool.get(key).is_some()
        {
            tracing::debug!(key = %key, "Session already connected");
            return Ok(());
        }

        if let Some(previous) = previous.filter(|p| p != key) {
            tracing::info!(from = %previous, to = %key, "Switching active session");
            self.teardown(&previous).await;
        }

        *self.inner.active_key.write() = Some(key.to_string());
        self.inner.queues.adopt(UNBOUND_KEY, key);

        self.connect_locked(key, Priority::Normal).await?;
        self.publish_session(SessionEvent::SessionStarted {
            session_key: key.to_string(),
        });
        Ok(())
    }

    /// Send now if connected and nothing is waiting, otherwise queue.
    ///
    /// Returns true if the message went out immediately.
    pub async fn send(&self, envelope: Envelope) -> bool {
        let Some(key) = self.active_key() else {
            self.inner
                .queues
                .get_or_create(UNBOUND_KEY)
                .enqueue(QueuedMessage::new(envelope));
            MessageMetrics::record_sent_queued();
            return false;
        };

        let queue = self.inner.queues.get_or_create(&key);
        let backlog = !queue.is_empty();

        if self.state() == ConnectionState::Connected && !backlog && !queue.is_flushing() {
            if let Some(handle) = self.inner.pool.get(&key) {
                match self.send_on(&handle, &envelope).await {
                    Ok(()) => {
                        MessageMetrics::record_sent_direct();
                        return true;
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Direct send failed, queueing message");
                        self.inner.health.record_error(&e.to_string());
                        if !handle.is_connected() {
                            self.connection_lost(&key, Some(handle.id()), &e.to_string())
                                .await;
                        }
                    }
                }
            }
        }

        queue.enqueue(QueuedMessage::new(envelope));
        MessageMetrics::record_sent_queued();

        // Leftovers of an interrupted flush on a live connection
        if backlog && self.state() == ConnectionState::Connected && !queue.is_flushing() {
            self.flush_pending().await;
        }
        false
    }

    /// End the session for `key`: close its connection and drop its queue
    pub async fn disconnect(&self, key: &str) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.teardown(key).await;
    }

    /// Explicit disconnect + acquire cycle. Queued messages are kept and
    /// flushed once connected.
    pub async fn reconnect(&self, key: &str) -> bool {
        self.restart(key).await.is_ok()
    }

    /// [`reconnect`](Self::reconnect) reporting why it failed
    pub async fn restart(&self, key: &str) -> Result<(), PoolError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        self.cancel_reconnect();
        self.inner.pool.release(key, true).await;

        if let Some(previous) = self.active_key().filter(|p| p != key) {
            self.teardown(&previous).await;
        }
        *self.inner.active_key.write() = Some(key.to_string());

        if !self.state().is_terminal() {
            self.transition(key, ConnectionState::Disconnected);
        }

        tracing::info!(key = %key, "Reconnecting on request");
        self.connect_locked(key, Priority::High).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.inner.broadcaster.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.broadcaster.current_state()
    }

    pub fn active_key(&self) -> Option<String> {
        self.inner.active_key.read().clone()
    }

    pub fn stats(&self) -> ConnectionHealth {
        let state = self.state();
        let recovery = self.inner.controller.stats();
        let health = &self.inner.health;

        ConnectionHealth {
            connected: state == ConnectionState::Connected,
            state,
            session_key: self.active_key(),
            queue_depth: self.inner.queues.total_depth(),
            total_errors: recovery.total_errors + health.errors(),
            last_error: health.last_error().or(recovery.last_error),
            retry_count: recovery.total_retries + health.total_reconnect_attempts(),
            total_reconnections: health.total_reconnections(),
            uptime_secs: if state == ConnectionState::Connected {
                health.uptime().as_secs()
            } else {
                0
            },
            pool: self.inner.pool.stats(),
            subscribers: self.inner.broadcaster.subscriber_count(),
        }
    }

    pub fn circuit_breakers(&self) -> Vec<CircuitBreakerStats> {
        self.inner.controller.breakers().snapshot()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    /// Messages waiting for `key`
    pub fn queued(&self, key: &str) -> usize {
        self.inner.queues.get(key).map(|q| q.len()).unwrap_or(0)
    }

    /// Application-level keepalive on the active connection. Never queued.
    pub async fn send_heartbeat(&self) -> bool {
        let Some(key) = self.active_key() else {
            return false;
        };
        if self.state() != ConnectionState::Connected {
            return false;
        }

        let Some(handle) = self.inner.pool.get(&key) else {
            self.connection_lost(&key, None, "connection missing from pool").await;
            return false;
        };

        match self.send_on(&handle, &Envelope::heartbeat()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Heartbeat failed");
                self.inner.health.record_error(&e.to_string());
                if !handle.is_connected() {
                    self.connection_lost(&key, Some(handle.id()), &e.to_string())
                        .await;
                }
                false
            }
        }
    }

    /// Retry a flush that was interrupted while the connection stayed up
    pub async fn flush_pending(&self) -> usize {
        let Some(key) = self.active_key() else {
            return 0;
        };
        if self.state() != ConnectionState::Connected {
            return 0;
        }
        let Some(queue) = self.inner.queues.get(&key).filter(|q| !q.is_empty()) else {
            return 0;
        };
        let Some(handle) = self.inner.pool.get(&key) else {
            return 0;
        };

        let outcome = queue.flush(handle.transport().as_ref()).await;
        self.after_flush(&key, &handle, &outcome).await;
        outcome.sent()
    }

    /// Drop queued messages older than the configured TTL
    pub fn cleanup_expired_messages(&self) -> usize {
        self.inner.queues.cleanup_expired()
    }

    /// Close everything: reconnect loop, pooled connections, subscriber streams
    pub async fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.cancel_reconnect();

        if let Some(key) = self.active_key() {
            if !self.state().is_terminal() {
                self.transition(&key, ConnectionState::Disconnected);
            }
        }

        self.inner.pool.shutdown().await;
        self.inner.broadcaster.close();
        if let Some(pump) = self.inner.pump_task.lock().take() {
            pump.abort();
        }
        tracing::info!("Session transport shut down");
    }

    // Internals

    /// Move to `Connecting`, acquire, and enter `Connected` or `Error`.
    /// Caller holds the lifecycle lock.
    async fn connect_locked(&self, key: &str, priority: Priority) -> Result<(), PoolError> {
        self.cancel_reconnect();

        if self.state() == ConnectionState::Reconnecting {
            self.transition(key, ConnectionState::Disconnected);
        }
        if self.state() == ConnectionState::Connected {
            self.transition(key, ConnectionState::Disconnected);
        }
        self.inner.health.set_disconnected();
        self.transition(key, ConnectionState::Connecting);

        match self.inner.pool.acquire(key, priority).await {
            Ok(handle) => {
                self.enter_connected(key, handle).await;
                Ok(())
            }
            Err(e) => {
                self.connect_failed(key, &e);
                Err(e)
            }
        }
    }

    fn connect_failed(&self, key: &str, error: &PoolError) {
        tracing::error!(key = %key, error = %error, code = error.code(), "Failed to connect session");
        self.inner.health.record_error(&error.to_string());
        self.transition(key, ConnectionState::Error);
        self.publish_session(SessionEvent::Error {
            session_key: key.to_string(),
            message: error.to_string(),
        });
    }

    /// Transition to `Connected` and flush the queue exactly once for it
    async fn enter_connected(&self, key: &str, handle: ConnectionHandle) {
        if !self.transition(key, ConnectionState::Connected) {
            return;
        }
        self.inner.health.set_connected();

        let queue = self.inner.queues.get_or_create(key);
        let outcome = queue.flush(handle.transport().as_ref()).await;
        self.after_flush(key, &handle, &outcome).await;
    }

    async fn after_flush(&self, key: &str, handle: &ConnectionHandle, outcome: &FlushOutcome) {
        if let FlushOutcome::Interrupted { error, .. } | FlushOutcome::Discarded { error, .. } = outcome {
            self.record_send_failure(key, error);
        }

        match outcome {
            FlushOutcome::Interrupted { error, .. } if !handle.is_connected() => {
                self.connection_lost(key, Some(handle.id()), &error.to_string())
                    .await;
            }
            FlushOutcome::Discarded { dropped, .. } => {
                self.inner
                    .health
                    .record_error(&format!("discarded {} queued messages", dropped));
                if !handle.is_connected() {
                    self.connection_lost(key, Some(handle.id()), "connection lost during flush")
                        .await;
                }
            }
            _ => {}
        }
    }

    /// Close the connection, drop the queue and, if `key` is active, end the session.
    /// Caller holds the lifecycle lock.
    async fn teardown(&self, key: &str) {
        let is_active = self.active_key().as_deref() == Some(key);
        if is_active {
            self.cancel_reconnect();
        }

        self.inner.pool.release(key, true).await;
        let dropped = self.inner.queues.remove(key);

        if is_active {
            *self.inner.active_key.write() = None;
            self.inner.health.set_disconnected();
            self.transition(key, ConnectionState::Disconnected);
            self.publish_session(SessionEvent::SessionEnded {
                session_key: key.to_string(),
            });
        }

        tracing::info!(key = %key, dropped, "Session disconnected");
    }

    /// The active connection went away unexpectedly: evict it and start
    /// reconnecting if we were connected
    async fn connection_lost(&self, key: &str, connection_id: Option<Uuid>, reason: &str) {
        if self.active_key().as_deref() != Some(key) {
            return;
        }
        if let Some(id) = connection_id {
            self.inner.pool.evict_connection(key, id, "dropped").await;
        }
        if self.transition(key, ConnectionState::Reconnecting) {
            tracing::warn!(key = %key, reason = %reason, "Connection lost, reconnecting");
            self.inner.health.record_error(reason);
            self.inner.health.set_disconnected();
            self.spawn_reconnect(key);
        }
    }

    fn spawn_reconnect(&self, key: &str) {
        let epoch = self.inner.reconnect_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let session = self.clone();
        let key = key.to_string();
        let handle = tokio::spawn(async move { session.reconnect_loop(key, epoch).await });
        // A previous loop sees the epoch change and stops on its own
        *self.inner.reconnect_task.lock() = Some(handle);
    }

    fn cancel_reconnect(&self) {
        self.inner.reconnect_epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
    }

    fn reconnect_wanted(&self, key: &str, epoch: u64) -> bool {
        self.inner.reconnect_epoch.load(Ordering::Acquire) == epoch
            && self.state() == ConnectionState::Reconnecting
            && self.active_key().as_deref() == Some(key)
    }

    async fn reconnect_loop(self, key: String, epoch: u64) {
        let max_attempts = self.inner.config.max_reconnect_attempts;
        let mut backoff = Backoff::new(self.inner.retry.clone());

        for attempt in 1..=max_attempts {
            if !self.reconnect_wanted(&key, epoch) {
                return;
            }
            self.inner.health.record_reconnect_attempt();
            tracing::info!(key = %key, attempt, max_attempts, "Attempting reconnection");

            match self.inner.pool.acquire(&key, Priority::High).await {
                Ok(handle) => {
                    let _lifecycle = self.inner.lifecycle.lock().await;
                    if !self.reconnect_wanted(&key, epoch) {
                        return;
                    }
                    tracing::info!(key = %key, attempt, "Reconnected");
                    self.enter_connected(&key, handle).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(key = %key, attempt, error = %e, "Reconnection attempt failed");
                    self.inner.health.record_error(&e.to_string());

                    if attempt < max_attempts {
                        // An open circuit tells us exactly how long to wait
                        let delay = match &e {
                            PoolError::CircuitOpen { retry_after, .. } => *retry_after,
                            _ => backoff.next_delay(),
                        };
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        if self.reconnect_wanted(&key, epoch) && self.transition(&key, ConnectionState::Error) {
            tracing::error!(key = %key, max_attempts, "Reconnection attempts exhausted");
            self.publish_session(SessionEvent::Error {
                session_key: key.clone(),
                message: format!("reconnection failed after {} attempts", max_attempts),
            });
        }
    }

    async fn send_on(&self, handle: &ConnectionHandle, envelope: &Envelope) -> Result<(), TransportError> {
        let result = match tokio::time::timeout(self.inner.send_timeout, handle.send(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.inner.send_timeout)),
        };
        if let Err(error) = &result {
            self.record_send_failure(handle.key(), error);
        }
        result
    }

    /// A send that hit its timeout counts against the key's connect breaker
    fn record_send_failure(&self, key: &str, error: &TransportError) {
        if matches!(error, TransportError::Timeout(_)) {
            let operation = connect_operation(key);
            tracing::debug!(key = %key, operation = %operation, "Send timed out, recording breaker failure");
            self.inner.controller.breakers().record_failure(&operation);
        }
    }

    fn transition(&self, key: &str, next: ConnectionState) -> bool {
        self.inner
            .broadcaster
            .try_transition(Some(key), next)
            .is_some()
    }

    fn publish_session(&self, event: SessionEvent) {
        self.inner.broadcaster.publish(Event::Session(event));
    }

    async fn handle_signal(&self, signal: PoolSignal) {
        let PoolSignal {
            key,
            connection_id,
            signal,
        } = signal;

        if self.active_key().as_deref() != Some(key.as_str()) {
            tracing::debug!(key = %key, "Ignoring signal for inactive session");
            return;
        }

        if let TransportSignal::Frame(envelope) = signal {
            MessageMetrics::record_received();
            let session_event = SessionEvent::from_envelope(&key, &envelope);
            self.inner.broadcaster.publish(Event::Inbound {
                key: key.clone(),
                envelope,
            });
            if let Some(event) = session_event {
                self.publish_session(event);
            }
            return;
        }

        // Lifecycle signals only count for the connection currently pooled
        if self.inner.pool.current_id(&key) != Some(connection_id) {
            tracing::debug!(key = %key, connection_id = %connection_id, "Ignoring signal from replaced connection");
            return;
        }

        match signal {
            TransportSignal::Closed { graceful: true } => {
                self.inner
                    .pool
                    .evict_connection(&key, connection_id, "remote_closed")
                    .await;
                if self.transition(&key, ConnectionState::Disconnected) {
                    self.inner.health.set_disconnected();
                    self.publish_session(SessionEvent::SessionEnded { session_key: key });
                }
            }
            TransportSignal::Closed { graceful: false } => {
                self.connection_lost(&key, Some(connection_id), "connection dropped")
                    .await;
            }
            TransportSignal::Failed(reason) => {
                self.inner
                    .pool
                    .evict_connection(&key, connection_id, "failed")
                    .await;
                self.inner.health.record_error(&reason);
                if self.transition(&key, ConnectionState::Error) {
                    self.inner.health.set_disconnected();
                    self.publish_session(SessionEvent::Error {
                        session_key: key,
                        message: reason,
                    });
                }
            }
            TransportSignal::Frame(_) => {}
        }
    }
}

/// Route pool signals to the session, in arrival order
async fn signal_pump(session: Weak<SessionInner>, mut signals: mpsc::UnboundedReceiver<PoolSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        SessionTransport { inner }.handle_signal(signal).await;
    }
    tracing::debug!("Session signal pump stopped");
}
