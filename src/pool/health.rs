//! Periodic eviction of disconnected and stale pooled connections

use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior};

use crate::metrics::PoolMetrics;

use super::{ConnectionPool, PooledConnection};

impl ConnectionPool {
    /// Evict every entry that is disconnected or idle beyond `max_idle_time`.
    ///
    /// Returns the number of evicted connections.
    pub async fn run_health_check(&self) -> usize {
        let evicted: Vec<(PooledConnection, &'static str)> = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let max_idle = self.config.max_idle_time();

            let failing: Vec<(String, &'static str)> = inner
                .connections
                .iter()
                .filter_map(|(key, conn)| {
                    if !conn.transport.is_connected() {
                        Some((key.clone(), "disconnected"))
                    } else if conn.is_stale(max_idle, now) {
                        Some((key.clone(), "stale"))
                    } else {
                        None
                    }
                })
                .collect();

            let evicted: Vec<_> = failing
                .into_iter()
                .filter_map(|(key, reason)| {
                    inner.connections.remove(&key).map(|conn| (conn, reason))
                })
                .collect();

            PoolMetrics::set_size(inner.connections.len());
            evicted
        };

        let count = evicted.len();
        for (conn, reason) in &evicted {
            tracing::info!(
                key = %conn.key,
                connection_id = %conn.id,
                reason,
                use_count = conn.use_count,
                "Health check evicting connection"
            );
        }
        self.close_evicted(evicted).await;

        count
    }

    /// Spawn the background health check loop (every `health_check_interval`).
    ///
    /// The task holds only a weak reference, so it ends when the pool is
    /// dropped as well as on shutdown.
    pub fn start_health_checks(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let interval = self.config.health_check_interval();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick
            ticker.tick().await;

            tracing::info!(interval_secs = interval.as_secs(), "Pool health check task started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else {
                            break;
                        };
                        let evicted = pool.run_health_check().await;
                        if evicted > 0 {
                            tracing::info!(evicted, "Pool health check completed");
                        }
                    }
                    _ = shutdown.changed() => {
                        break;
                    }
                }
            }

            tracing::debug!("Pool health check task stopped");
        });

        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
    }
}
