//! Prometheus metrics for the session transport.
//!
//! This module provides metrics for monitoring the transport core:
//! - Pool metrics (live connections, evictions, connect attempts)
//! - Circuit breaker and retry metrics
//! - Outbound queue metrics
//! - Event broadcaster metrics
//! - Session state and message metrics

mod helpers;

pub use helpers::{
    encode_metrics, BroadcastMetrics, CircuitMetrics, MessageMetrics, PoolMetrics, QueueMetrics,
    SessionMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "session_transport";

lazy_static! {
    // ============================================================================
    // Pool Metrics
    // ============================================================================

    /// Live pooled connections
    pub static ref POOL_CONNECTIONS: IntGauge = register_int_gauge!(
        format!("{}_pool_connections", METRIC_PREFIX),
        "Number of live pooled connections"
    ).unwrap();

    /// Pool evictions by reason
    pub static ref POOL_EVICTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_pool_evictions_total", METRIC_PREFIX),
        "Pooled connections evicted",
        &["reason"]
    ).unwrap();

    /// Connection establishment attempts by outcome
    pub static ref POOL_CONNECT_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_pool_connect_attempts_total", METRIC_PREFIX),
        "Connection establishment attempts",
        &["outcome"]
    ).unwrap();

    /// Time spent establishing connections
    pub static ref POOL_CONNECT_LATENCY: Histogram = register_histogram!(
        format!("{}_pool_connect_latency_seconds", METRIC_PREFIX),
        "Connection establishment latency in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // ============================================================================
    // Circuit Breaker & Retry Metrics
    // ============================================================================

    /// Circuit breaker state per operation (0=closed, 1=open, 2=half-open)
    pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_circuit_breaker_state", METRIC_PREFIX),
        "Circuit breaker state (0=closed, 1=open, 2=half-open)",
        &["operation"]
    ).unwrap();

    /// Calls rejected by an open circuit
    pub static ref CIRCUIT_REJECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_circuit_rejections_total", METRIC_PREFIX),
        "Calls rejected without invoking the operation"
    ).unwrap();

    /// Retries performed after a failed attempt
    pub static ref RETRY_ATTEMPTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_retry_attempts_total", METRIC_PREFIX),
        "Retries performed after a failed attempt"
    ).unwrap();

    /// Automatic recovery actions by outcome
    pub static ref RECOVERY_ACTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_recovery_actions_total", METRIC_PREFIX),
        "Automatic recovery actions executed",
        &["action", "outcome"]
    ).unwrap();

    // ============================================================================
    // Queue Metrics
    // ============================================================================

    /// Messages currently waiting in outbound queues
    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        format!("{}_queue_depth", METRIC_PREFIX),
        "Messages currently queued for delivery"
    ).unwrap();

    pub static ref QUEUE_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_enqueued_total", METRIC_PREFIX),
        "Messages queued while disconnected"
    ).unwrap();

    /// Messages dropped because a queue was full
    pub static ref QUEUE_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_dropped_total", METRIC_PREFIX),
        "Oldest messages dropped from full queues"
    ).unwrap();

    pub static ref QUEUE_FLUSHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_flushed_total", METRIC_PREFIX),
        "Queued messages delivered by a flush"
    ).unwrap();

    pub static ref QUEUE_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_expired_total", METRIC_PREFIX),
        "Queued messages discarded after their TTL"
    ).unwrap();

    // ============================================================================
    // Broadcaster Metrics
    // ============================================================================

    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_published_total", METRIC_PREFIX),
        "Events published to subscribers",
        &["kind"]
    ).unwrap();

    /// Events a slow subscriber lost to its full buffer
    pub static ref EVENTS_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_events_dropped_total", METRIC_PREFIX),
        "Events dropped from full subscriber buffers"
    ).unwrap();

    pub static ref EVENT_SUBSCRIBERS: IntGauge = register_int_gauge!(
        format!("{}_event_subscribers", METRIC_PREFIX),
        "Active event subscribers"
    ).unwrap();

    // ============================================================================
    // Session Metrics
    // ============================================================================

    /// Current connection state (0=disconnected, 1=connecting, 2=connected, 3=reconnecting, 4=error)
    pub static ref CONNECTION_STATE: IntGauge = register_int_gauge!(
        format!("{}_connection_state", METRIC_PREFIX),
        "Current connection state"
    ).unwrap();

    pub static ref STATE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_state_transitions_total", METRIC_PREFIX),
        "Connection state transitions",
        &["to"]
    ).unwrap();

    pub static ref MESSAGES_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Outbound messages by delivery path",
        &["path"]
    ).unwrap();

    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Inbound frames received from the transport"
    ).unwrap();
}
