//! Keyed connection pool.
//!
//! Holds at most one live transport per key and at most `max_pool_size`
//! transports overall. New transports are established through the
//! [`RecoveryController`] under the operation key `connect:{key}`, so each key
//! has its own circuit breaker.
//!
//! Connects run in a spawned task and report back over a oneshot channel.
//! Each connect in flight holds one capacity slot. A caller that gives up, or
//! a newer acquire/forced release for the same key, cancels the connect and
//! frees its slot; a transport that still arrives late is closed instead of
//! inserted.

mod health;
mod types;

pub use types::{ConnectionHandle, PoolError, PoolSignal, PoolStats, PooledConnection, Priority};

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::metrics::PoolMetrics;
use crate::recovery::{RecoveryController, RecoveryError, RetryConfig};
use crate::transport::{SignalHandler, Transport, TransportError, TransportFactory};

/// Circuit breaker operation key guarding connections for `key`
pub fn connect_operation(key: &str) -> String {
    format!("connect:{}", key)
}

/// A connect in flight. Dropping it cancels the connect.
struct Connecting {
    generation: u64,
    _cancel: oneshot::Sender<()>,
}

#[derive(Default)]
struct PoolInner {
    connections: HashMap<String, PooledConnection>,
    /// At most one connect per key; only its generation may insert
    connecting: HashMap<String, Connecting>,
    next_generation: u64,
    closed: bool,
}

impl PoolInner {
    fn occupied(&self) -> usize {
        self.connections.len() + self.connecting.len()
    }

    fn start_connect(&mut self, key: &str) -> (u64, oneshot::Receiver<()>) {
        self.next_generation += 1;
        let (cancel, cancelled) = oneshot::channel();
        self.connecting.insert(
            key.to_string(),
            Connecting {
                generation: self.next_generation,
                _cancel: cancel,
            },
        );
        (self.next_generation, cancelled)
    }

    /// Cancel the connect in flight for `key`, freeing its slot
    fn cancel_connect(&mut self, key: &str) -> bool {
        self.connecting.remove(key).is_some()
    }

    /// Retire `generation`'s slot. False when it was already cancelled.
    fn finish_connect(&mut self, key: &str, generation: u64) -> bool {
        match self.connecting.get(key) {
            Some(c) if c.generation == generation => {
                self.connecting.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Result of applying a finished connect
enum Completion {
    Inserted(ConnectionHandle, Option<PooledConnection>),
    Discard(Arc<dyn Transport>, PoolError),
    Failed(PoolError),
}

/// Outcome of the synchronous part of `acquire`
enum Decision {
    Reuse(ConnectionHandle),
    Reject(PoolError),
    Establish {
        generation: u64,
        cancelled: oneshot::Receiver<()>,
    },
}

pub struct ConnectionPool {
    config: PoolConfig,
    retry: RetryConfig,
    factory: Arc<dyn TransportFactory>,
    controller: Arc<RecoveryController>,
    inner: Mutex<PoolInner>,
    /// Serializes acquire per key
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    signals: Option<mpsc::UnboundedSender<PoolSignal>>,
    shutdown: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        retry: RetryConfig,
        factory: Arc<dyn TransportFactory>,
        controller: Arc<RecoveryController>,
    ) -> Self {
        assert!(config.max_pool_size > 0, "max_pool_size must be at least 1");
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            retry,
            factory,
            controller,
            inner: Mutex::new(PoolInner::default()),
            key_locks: DashMap::new(),
            signals: None,
            shutdown,
            health_task: Mutex::new(None),
        }
    }

    /// Forward every transport signal, tagged with key and connection id
    pub fn with_signal_sender(mut self, sender: mpsc::UnboundedSender<PoolSignal>) -> Self {
        self.signals = Some(sender);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<RecoveryController> {
        &self.controller
    }

    /// Get a healthy connection for `key`, reusing the pooled one when possible.
    ///
    /// An unhealthy entry is evicted and recreated. When the pool is full,
    /// stale entries are evicted first; a `Critical` request may then evict
    /// the oldest connection.
    pub async fn acquire(
        self: &Arc<Self>,
        key: &str,
        priority: Priority,
    ) -> Result<ConnectionHandle, PoolError> {
        let result = {
            let key_lock = self.key_lock(key);
            let _guard = key_lock.lock().await;
            self.acquire_locked(key, priority).await
        };
        if result.is_err() {
            self.prune_key_lock(key);
        }
        result
    }

    async fn acquire_locked(
        self: &Arc<Self>,
        key: &str,
        priority: Priority,
    ) -> Result<ConnectionHandle, PoolError> {
        let mut evicted: Vec<(PooledConnection, &'static str)> = Vec::new();

        let decision = {
            let mut inner = self.inner.lock();
            self.decide(&mut inner, key, priority, &mut evicted)
        };

        let (generation, cancelled) = match decision {
            Decision::Establish {
                generation,
                cancelled,
            } => (generation, cancelled),
            Decision::Reuse(handle) => return Ok(handle),
            Decision::Reject(err) => {
                self.close_evicted(evicted).await;
                return Err(err);
            }
        };

        // Spawned before any await so a dropped caller is always seen by the task
        let (mut tx, rx) = oneshot::channel();
        let pool = Arc::clone(self);
        let key_owned = key.to_string();

        tokio::spawn(async move {
            let connection_id = Uuid::new_v4();
            let result = tokio::select! {
                result = pool.establish(&key_owned, connection_id) => result,
                _ = cancelled => {
                    tracing::info!(key = %key_owned, connection_id = %connection_id, "Superseded connect cancelled");
                    return;
                }
                _ = tx.closed() => {
                    pool.abandon(&key_owned, connection_id, generation);
                    return;
                }
            };
            let outcome = pool
                .complete(&key_owned, connection_id, generation, result, tx.is_closed())
                .await;

            if let Err(Ok(handle)) = tx.send(outcome) {
                // Caller vanished between the check and the send
                pool.evict_connection(&key_owned, handle.id(), "cancelled").await;
            }
        });

        self.close_evicted(evicted).await;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Cancelled {
                key: key.to_string(),
            }),
        }
    }

    fn decide(
        &self,
        inner: &mut PoolInner,
        key: &str,
        priority: Priority,
        evicted: &mut Vec<(PooledConnection, &'static str)>,
    ) -> Decision {
        if inner.closed {
            return Decision::Reject(PoolError::ShuttingDown);
        }

        let now = Instant::now();
        let max_idle = self.config.max_idle_time();

        if let Some(conn) = inner.connections.get_mut(key) {
            if conn.is_healthy(max_idle, now) {
                conn.use_count += 1;
                conn.last_used_at = now;
                conn.idle = false;
                tracing::debug!(
                    key = %key,
                    connection_id = %conn.id,
                    use_count = conn.use_count,
                    "Reusing pooled connection"
                );
                return Decision::Reuse(conn.handle());
            }
        }

        if let Some(conn) = inner.connections.remove(key) {
            let reason = if conn.transport.is_connected() { "stale" } else { "disconnected" };
            tracing::warn!(key = %key, connection_id = %conn.id, reason, "Evicting unhealthy connection");
            evicted.push((conn, reason));
        }

        // Left behind by a caller that gave up
        if inner.cancel_connect(key) {
            tracing::info!(key = %key, "Cancelling stale connect in flight");
        }

        let max = self.config.max_pool_size;
        if inner.occupied() >= max {
            let unhealthy: Vec<String> = inner
                .connections
                .iter()
                .filter(|(_, c)| !c.is_healthy(max_idle, now))
                .map(|(k, _)| k.clone())
                .collect();
            for k in unhealthy {
                if let Some(conn) = inner.connections.remove(&k) {
                    tracing::info!(key = %k, connection_id = %conn.id, "Evicting stale connection to free capacity");
                    evicted.push((conn, "stale"));
                }
            }
        }

        if inner.occupied() >= max {
            let oldest = if priority == Priority::Critical {
                inner
                    .connections
                    .values()
                    .min_by_key(|c| c.created_at)
                    .map(|c| c.key.clone())
            } else {
                None
            };

            match oldest.and_then(|k| inner.connections.remove(&k)) {
                Some(conn) => {
                    tracing::warn!(
                        key = %conn.key,
                        connection_id = %conn.id,
                        requested_by = %key,
                        "Evicting oldest connection for critical request"
                    );
                    evicted.push((conn, "capacity"));
                }
                None => {
                    tracing::warn!(key = %key, priority = ?priority, max, "Connection pool at capacity");
                    PoolMetrics::set_size(inner.connections.len());
                    return Decision::Reject(PoolError::Capacity {
                        current: inner.occupied(),
                        max,
                    });
                }
            }
        }

        PoolMetrics::set_size(inner.connections.len());
        let (generation, cancelled) = inner.start_connect(key);
        Decision::Establish {
            generation,
            cancelled,
        }
    }

    /// Caller dropped its acquire before the connect finished
    fn abandon(&self, key: &str, connection_id: Uuid, generation: u64) {
        if self.inner.lock().finish_connect(key, generation) {
            tracing::info!(key = %key, connection_id = %connection_id, "Caller gave up, connect cancelled");
        }
    }

    /// Connect through the recovery controller, bounded per attempt by the
    /// connection timeout and aborted by pool shutdown
    async fn establish(
        &self,
        key: &str,
        connection_id: Uuid,
    ) -> Result<Arc<dyn Transport>, PoolError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(PoolError::ShuttingDown);
        }

        let operation_key = connect_operation(key);
        let timeout = self.config.connection_timeout();
        let handler = self.signal_handler(key, connection_id);
        let started = Instant::now();

        tracing::info!(key = %key, connection_id = %connection_id, "Establishing connection");

        let attempt = self
            .controller
            .execute_with_recovery(&operation_key, &self.retry, || {
                let factory = self.factory.clone();
                let handler = handler.clone();
                async move {
                    match tokio::time::timeout(timeout, factory.connect(key, handler)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Timeout(timeout)),
                    }
                }
            });

        let result = tokio::select! {
            result = attempt => result,
            _ = shutdown.wait_for(|closed| *closed) => return Err(PoolError::ShuttingDown),
        };

        match result {
            Ok(transport) => {
                PoolMetrics::record_connect_success(started.elapsed().as_secs_f64());
                Ok(transport)
            }
            Err(err) => {
                PoolMetrics::record_connect_failure();
                Err(match err {
                    RecoveryError::CircuitOpen { retry_after, .. } => PoolError::CircuitOpen {
                        key: key.to_string(),
                        retry_after,
                    },
                    RecoveryError::Failed {
                        source: TransportError::Timeout(_),
                        ..
                    } => PoolError::Timeout {
                        key: key.to_string(),
                        timeout,
                    },
                    RecoveryError::Failed { source, kind, .. } => PoolError::EstablishFailed {
                        key: key.to_string(),
                        reason: source.to_string(),
                        kind,
                    },
                })
            }
        }
    }

    /// Apply a finished connect if it is still wanted, otherwise close it
    async fn complete(
        &self,
        key: &str,
        connection_id: Uuid,
        generation: u64,
        result: Result<Arc<dyn Transport>, PoolError>,
        caller_gone: bool,
    ) -> Result<ConnectionHandle, PoolError> {
        let completion = {
            let mut inner = self.inner.lock();
            let current = inner.finish_connect(key, generation);

            match result {
                Err(err) => Completion::Failed(err),
                Ok(transport) if inner.closed => {
                    Completion::Discard(transport, PoolError::ShuttingDown)
                }
                Ok(transport) if !current || caller_gone => Completion::Discard(
                    transport,
                    PoolError::Cancelled {
                        key: key.to_string(),
                    },
                ),
                Ok(transport) => {
                    let conn = PooledConnection::new(connection_id, key, transport);
                    let handle = conn.handle();
                    let replaced = inner.connections.insert(key.to_string(), conn);
                    PoolMetrics::set_size(inner.connections.len());
                    Completion::Inserted(handle, replaced)
                }
            }
        };

        match completion {
            Completion::Inserted(handle, replaced) => {
                if let Some(old) = replaced {
                    self.close_evicted(vec![(old, "replaced")]).await;
                }
                tracing::info!(key = %key, connection_id = %connection_id, "Connection established");
                Ok(handle)
            }
            Completion::Discard(transport, err) => {
                tracing::info!(key = %key, connection_id = %connection_id, "Closing connection nobody is waiting for");
                transport.close().await;
                Err(err)
            }
            Completion::Failed(err) => {
                tracing::warn!(key = %key, error = %err, "Connection attempt failed");
                Err(err)
            }
        }
    }

    /// Release a connection. It stays pooled (idle) unless `force_close` is set
    /// or it is no longer connected. A forced release also cancels any connect
    /// in flight for `key`.
    pub async fn release(&self, key: &str, force_close: bool) {
        let evicted = {
            let mut inner = self.inner.lock();
            let connected = inner.connections.get(key).map(|c| c.transport.is_connected());

            if force_close && inner.cancel_connect(key) {
                tracing::info!(key = %key, "Forced release cancelled connect in flight");
            }

            match connected {
                Some(connected) if force_close || !connected => {
                    let conn = inner.connections.remove(key);
                    PoolMetrics::set_size(inner.connections.len());
                    conn
                }
                Some(_) => {
                    if let Some(conn) = inner.connections.get_mut(key) {
                        conn.idle = true;
                        conn.last_used_at = Instant::now();
                    }
                    None
                }
                None => None,
            }
        };

        if let Some(conn) = evicted {
            tracing::info!(key = %key, connection_id = %conn.id, force_close, "Closing released connection");
            self.close_evicted(vec![(conn, "released")]).await;
        } else {
            tracing::debug!(key = %key, "Connection released to pool");
        }

        self.prune_key_lock(key);
    }

    /// Non-creating lookup of a connected entry. Touches `last_used_at` but
    /// does not count as a use.
    pub fn get(&self, key: &str) -> Option<ConnectionHandle> {
        let mut inner = self.inner.lock();
        let conn = inner.connections.get_mut(key)?;
        if !conn.transport.is_connected() {
            return None;
        }
        conn.last_used_at = Instant::now();
        Some(conn.handle())
    }

    /// Id of the pooled connection for `key`, connected or not
    pub fn current_id(&self, key: &str) -> Option<Uuid> {
        self.inner.lock().connections.get(key).map(|c| c.id)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let total = inner.connections.len();
        let idle = inner.connections.values().filter(|c| c.idle).count();
        let uses: u64 = inner.connections.values().map(|c| c.use_count).sum();

        PoolStats {
            total,
            idle,
            active: total - idle,
            pending: inner.connecting.len(),
            average_use_count: if total == 0 {
                0.0
            } else {
                uses as f64 / total as f64
            },
            max_pool_size: self.config.max_pool_size,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().closed
    }

    /// Close every pooled transport, cancel connects in flight and stop the
    /// health check task
    pub async fn shutdown(&self) {
        let drained: Vec<PooledConnection> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.connecting.clear();
            inner.connections.drain().map(|(_, c)| c).collect()
        };

        self.shutdown.send_replace(true);
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }

        let count = drained.len();
        self.close_evicted(drained.into_iter().map(|c| (c, "shutdown")).collect())
            .await;
        PoolMetrics::set_size(0);
        self.key_locks.clear();

        tracing::info!(closed = count, "Connection pool shut down");
    }

    /// Remove and close the entry for `key` only if it is still `connection_id`
    pub(crate) async fn evict_connection(&self, key: &str, connection_id: Uuid, reason: &'static str) -> bool {
        let conn = {
            let mut inner = self.inner.lock();
            match inner.connections.get(key) {
                Some(c) if c.id == connection_id => {
                    let conn = inner.connections.remove(key);
                    PoolMetrics::set_size(inner.connections.len());
                    conn
                }
                _ => None,
            }
        };

        match conn {
            Some(conn) => {
                self.close_evicted(vec![(conn, reason)]).await;
                true
            }
            None => false,
        }
    }

    async fn close_evicted(&self, evicted: Vec<(PooledConnection, &'static str)>) {
        for (conn, reason) in evicted {
            conn.transport.close().await;
            PoolMetrics::record_eviction(reason);
        }
    }

    fn signal_handler(&self, key: &str, connection_id: Uuid) -> SignalHandler {
        let sender = self.signals.clone();
        let key = key.to_string();
        Arc::new(move |signal| {
            if let Some(sender) = &sender {
                let _ = sender.send(PoolSignal {
                    key: key.clone(),
                    connection_id,
                    signal,
                });
            }
        })
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn prune_key_lock(&self, key: &str) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::recovery::CircuitBreakerRegistry;
    use crate::transport::MemoryTransportFactory;
    use std::time::Duration;

    fn pool_with(factory: &MemoryTransportFactory, max_pool_size: usize) -> Arc<ConnectionPool> {
        let config = PoolConfig {
            max_pool_size,
            ..PoolConfig::default()
        };
        let controller = Arc::new(RecoveryController::new(Arc::new(
            CircuitBreakerRegistry::new(CircuitBreakerConfig::default()),
        )));
        let retry = RetryConfig::default()
            .with_max_attempts(1)
            .without_jitter();
        Arc::new(ConnectionPool::new(
            config,
            retry,
            Arc::new(factory.clone()),
            controller,
        ))
    }

    #[tokio::test]
    async fn test_acquire_reuses_healthy_connection() {
        let factory = MemoryTransportFactory::new();
        let pool = pool_with(&factory, 5);

        let first = pool.acquire("s1", Priority::Normal).await.unwrap();
        let second = pool.acquire("s1", Priority::Normal).await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(second.use_count(), first.use_count() + 1);
        assert_eq!(factory.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_entry_is_recreated() {
        let factory = MemoryTransportFactory::new();
        let pool = pool_with(&factory, 5);

        let first = pool.acquire("s1", Priority::Normal).await.unwrap();
        factory.latest("s1").unwrap().drop_connection();

        let second = pool.acquire("s1", Priority::Normal).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(second.is_connected());
        assert_eq!(pool.stats().total, 1);
        assert!(factory.transports()[0].is_closed());
    }

    #[tokio::test]
    async fn test_release_keeps_idle_connection() {
        let factory = MemoryTransportFactory::new();
        let pool = pool_with(&factory, 5);

        let handle = pool.acquire("s1", Priority::Normal).await.unwrap();
        pool.release("s1", false).await;

        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(pool.current_id("s1"), Some(handle.id()));

        pool.release("s1", true).await;
        assert_eq!(pool.stats().total, 0);
        assert!(factory.latest("s1").unwrap().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_idle_connection_frees_capacity() {
        let factory = MemoryTransportFactory::new();
        let pool = pool_with(&factory, 1);

        pool.acquire("old", Priority::Normal).await.unwrap();
        pool.release("old", false).await;

        tokio::time::advance(Duration::from_secs(61)).await;

        pool.acquire("new", Priority::Normal).await.unwrap();
        assert_eq!(pool.current_id("old"), None);
        assert!(factory.latest("old").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_failed_connect_maps_to_establish_failed() {
        let factory = MemoryTransportFactory::new();
        factory.fail_next(1, TransportError::Auth("403".into()));
        let pool = pool_with(&factory, 5);

        let err = pool.acquire("s1", Priority::Normal).await.unwrap_err();
        assert!(matches!(err, PoolError::EstablishFailed { .. }));
        assert_eq!(pool.stats().pending, 0);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let factory = MemoryTransportFactory::new();
        factory.set_connect_delay(Duration::from_secs(30));
        let pool = pool_with(&factory, 5);

        let err = pool.acquire("s1", Priority::Normal).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { .. }));
        assert!(factory.transports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_stops_connect() {
        let factory = MemoryTransportFactory::new();
        factory.set_connect_delay(Duration::from_secs(2));
        let pool = pool_with(&factory, 5);

        let attempt = tokio::time::timeout(
            Duration::from_millis(100),
            pool.acquire("s1", Priority::Normal),
        )
        .await;
        assert!(attempt.is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(factory.transports().is_empty());
        assert_eq!(pool.stats().total, 0);
        assert_eq!(pool.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_release_supersedes_connect_in_flight() {
        let factory = MemoryTransportFactory::new();
        factory.set_connect_delay(Duration::from_secs(2));
        let pool = pool_with(&factory, 5);

        let acquiring = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("s1", Priority::Normal).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        pool.release("s1", true).await;

        assert_eq!(pool.stats().pending, 0);
        let result = acquiring.await.unwrap();
        assert!(matches!(result, Err(PoolError::Cancelled { .. })));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(factory.transports().is_empty());
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_connection() {
        let factory = MemoryTransportFactory::new();
        let pool = pool_with(&factory, 5);

        let (a, b) = tokio::join!(
            pool.acquire("s1", Priority::Normal),
            pool.acquire("s1", Priority::Normal)
        );

        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(factory.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let factory = MemoryTransportFactory::new();
        let pool = pool_with(&factory, 5);

        pool.acquire("a", Priority::Normal).await.unwrap();
        pool.acquire("b", Priority::Normal).await.unwrap();
        pool.shutdown().await;

        assert!(factory.transports().iter().all(|t| t.is_closed()));
        assert!(matches!(
            pool.acquire("c", Priority::Critical).await,
            Err(PoolError::ShuttingDown)
        ));
    }
}
