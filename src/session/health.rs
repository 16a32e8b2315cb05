//! Session connection health tracking

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::pool::PoolStats;

use super::ConnectionState;

/// Session health tracker
pub struct SessionHealth {
    connected_since: Mutex<Option<Instant>>,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    reconnect_attempts: AtomicU32,
    total_reconnect_attempts: AtomicU64,
    total_reconnections: AtomicU32,
}

impl SessionHealth {
    pub fn new() -> Self {
        Self {
            connected_since: Mutex::new(None),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            total_reconnect_attempts: AtomicU64::new(0),
            total_reconnections: AtomicU32::new(0),
        }
    }

    /// Mark the session as connected
    pub fn set_connected(&self) {
        let mut since = self.connected_since.lock();
        if since.is_none() {
            *since = Some(Instant::now());
        }
        if self.reconnect_attempts.swap(0, Ordering::AcqRel) > 0 {
            self.total_reconnections.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn set_disconnected(&self) {
        *self.connected_since.lock() = None;
    }

    pub fn record_error(&self, error: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::AcqRel);
        self.total_reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Reconnect attempts since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Acquire)
    }

    pub fn total_reconnect_attempts(&self) -> u64 {
        self.total_reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn total_reconnections(&self) -> u32 {
        self.total_reconnections.load(Ordering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.connected_since
            .lock()
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }
}

impl Default for SessionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only health snapshot, recomputed on every call
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub connected: bool,
    pub state: ConnectionState,
    pub session_key: Option<String>,
    /// Messages waiting across all outbound queues
    pub queue_depth: usize,
    pub total_errors: u64,
    pub last_error: Option<String>,
    /// Retries made by the recovery controller plus reconnect attempts
    pub retry_count: u64,
    pub total_reconnections: u32,
    /// Seconds connected without interruption, 0 when not connected
    pub uptime_secs: u64,
    pub pool: PoolStats,
    pub subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_uptime_resets_on_disconnect() {
        let health = SessionHealth::new();
        assert_eq!(health.uptime(), Duration::ZERO);

        health.set_connected();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(health.uptime(), Duration::from_secs(5));

        health.set_disconnected();
        assert_eq!(health.uptime(), Duration::ZERO);
    }

    #[test]
    fn test_reconnection_counted_once_connected() {
        let health = SessionHealth::new();
        health.record_reconnect_attempt();
        health.record_reconnect_attempt();
        assert_eq!(health.reconnect_attempts(), 2);

        health.set_connected();
        assert_eq!(health.reconnect_attempts(), 0);
        assert_eq!(health.total_reconnections(), 1);
    }

    #[test]
    fn test_last_error() {
        let health = SessionHealth::new();
        health.record_error("connection reset");
        health.record_error("timed out");
        assert_eq!(health.errors(), 2);
        assert_eq!(health.last_error().as_deref(), Some("timed out"));
    }
}
