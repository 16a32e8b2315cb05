use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::recovery::{Classify, ErrorKind};
use crate::transport::{Transport, TransportError, TransportSignal};

/// Request priority. Only `Critical` may evict a live connection to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Error type for pool operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("Connection pool at capacity ({current}/{max})")]
    Capacity { current: usize, max: usize },

    #[error("Connecting '{key}' timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("Failed to establish connection for '{key}': {reason}")]
    EstablishFailed {
        key: String,
        reason: String,
        kind: ErrorKind,
    },

    /// Connect attempts for this key are suspended by its circuit breaker
    #[error("Circuit open for '{key}', retry after {retry_after:?}")]
    CircuitOpen { key: String, retry_after: Duration },

    /// Superseded by a newer acquire or release for the same key
    #[error("Connect for '{key}' was cancelled")]
    Cancelled { key: String },

    #[error("Connection pool is shutting down")]
    ShuttingDown,
}

impl PoolError {
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::Capacity { .. } => "POOL_CAPACITY",
            PoolError::Timeout { .. } => "CONNECT_TIMEOUT",
            PoolError::EstablishFailed { .. } => "ESTABLISH_FAILED",
            PoolError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            PoolError::Cancelled { .. } => "CONNECT_CANCELLED",
            PoolError::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl Classify for PoolError {
    fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Capacity { .. } => ErrorKind::ResourceExhausted,
            PoolError::Timeout { .. } => ErrorKind::Timeout,
            PoolError::EstablishFailed { kind, .. } => *kind,
            PoolError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            PoolError::Cancelled { .. } | PoolError::ShuttingDown => ErrorKind::Internal,
        }
    }
}

/// A live transport owned by the pool
pub struct PooledConnection {
    pub id: Uuid,
    pub key: String,
    pub transport: Arc<dyn Transport>,
    pub created_at: Instant,
    pub last_used_at: Instant,
    /// Wall-clock time of the connect, for reporting
    pub connected_at: DateTime<Utc>,
    pub use_count: u64,
    pub idle: bool,
}

impl PooledConnection {
    pub(crate) fn new(id: Uuid, key: &str, transport: Arc<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id,
            key: key.to_string(),
            transport,
            created_at: now,
            last_used_at: now,
            connected_at: Utc::now(),
            use_count: 1,
            idle: false,
        }
    }

    /// Idle for longer than `max_idle`
    pub fn is_stale(&self, max_idle: Duration, now: Instant) -> bool {
        self.idle && now.duration_since(self.last_used_at) > max_idle
    }

    pub fn is_healthy(&self, max_idle: Duration, now: Instant) -> bool {
        self.transport.is_connected() && !self.is_stale(max_idle, now)
    }

    pub(crate) fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            key: self.key.clone(),
            transport: self.transport.clone(),
            use_count: self.use_count,
        }
    }
}

/// Caller's view of a pooled connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    key: String,
    transport: Arc<dyn Transport>,
    use_count: u64,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Use count at the time this handle was issued
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.transport.send(envelope).await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("use_count", &self.use_count)
            .field("connected", &self.transport.is_connected())
            .finish()
    }
}

/// Signal from a pooled transport, tagged with the connection it came from
#[derive(Debug, Clone)]
pub struct PoolSignal {
    pub key: String,
    pub connection_id: Uuid,
    pub signal: TransportSignal,
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    /// Connects in flight, each holding a reserved slot
    pub pending: usize,
    pub average_use_count: f64,
    pub max_pool_size: usize,
}
