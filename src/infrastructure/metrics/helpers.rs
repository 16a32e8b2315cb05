//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    CIRCUIT_BREAKER_STATE, CIRCUIT_REJECTIONS_TOTAL, CONNECTION_STATE, EVENTS_DROPPED_TOTAL,
    EVENTS_PUBLISHED_TOTAL, EVENT_SUBSCRIBERS, MESSAGES_RECEIVED_TOTAL, MESSAGES_SENT_TOTAL,
    POOL_CONNECTIONS, POOL_CONNECT_ATTEMPTS_TOTAL, POOL_CONNECT_LATENCY, POOL_EVICTIONS_TOTAL,
    QUEUE_DEPTH, QUEUE_DROPPED_TOTAL, QUEUE_ENQUEUED_TOTAL, QUEUE_EXPIRED_TOTAL,
    QUEUE_FLUSHED_TOTAL, RECOVERY_ACTIONS_TOTAL, RETRY_ATTEMPTS_TOTAL, STATE_TRANSITIONS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording pool metrics
pub struct PoolMetrics;

impl PoolMetrics {
    pub fn set_size(size: usize) {
        POOL_CONNECTIONS.set(size as i64);
    }

    /// Record an eviction (`stale`, `disconnected`, `capacity`, `released`, `shutdown`)
    pub fn record_eviction(reason: &str) {
        POOL_EVICTIONS_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn record_connect_success(elapsed_secs: f64) {
        POOL_CONNECT_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
        POOL_CONNECT_LATENCY.observe(elapsed_secs);
    }

    pub fn record_connect_failure() {
        POOL_CONNECT_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();
    }
}

/// Helper struct for recording circuit breaker and retry metrics
pub struct CircuitMetrics;

impl CircuitMetrics {
    pub fn set_state(operation: &str, state: i64) {
        CIRCUIT_BREAKER_STATE.with_label_values(&[operation]).set(state);
    }

    pub fn record_rejection() {
        CIRCUIT_REJECTIONS_TOTAL.inc();
    }

    pub fn record_retry() {
        RETRY_ATTEMPTS_TOTAL.inc();
    }

    pub fn record_recovery_action(action: &str, succeeded: bool) {
        let outcome = if succeeded { "success" } else { "failure" };
        RECOVERY_ACTIONS_TOTAL
            .with_label_values(&[action, outcome])
            .inc();
    }
}

/// Helper struct for recording outbound queue metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued() {
        QUEUE_ENQUEUED_TOTAL.inc();
        QUEUE_DEPTH.inc();
    }

    pub fn record_dropped() {
        QUEUE_DROPPED_TOTAL.inc();
        QUEUE_DEPTH.dec();
    }

    pub fn record_flushed() {
        QUEUE_FLUSHED_TOTAL.inc();
        QUEUE_DEPTH.dec();
    }

    pub fn record_expired(count: u64) {
        QUEUE_EXPIRED_TOTAL.inc_by(count);
        QUEUE_DEPTH.sub(count as i64);
    }

    pub fn record_cleared(count: usize) {
        QUEUE_DEPTH.sub(count as i64);
    }

    /// Resync the depth gauge with the queues
    pub fn set_depth(depth: usize) {
        QUEUE_DEPTH.set(depth as i64);
    }
}

/// Helper struct for recording broadcaster metrics
pub struct BroadcastMetrics;

impl BroadcastMetrics {
    pub fn record_published(kind: &str) {
        EVENTS_PUBLISHED_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn record_dropped() {
        EVENTS_DROPPED_TOTAL.inc();
    }

    pub fn set_subscribers(count: usize) {
        EVENT_SUBSCRIBERS.set(count as i64);
    }
}

/// Helper struct for recording session state metrics
pub struct SessionMetrics;

impl SessionMetrics {
    pub fn record_transition(to: &str, state_code: i64) {
        CONNECTION_STATE.set(state_code);
        STATE_TRANSITIONS_TOTAL.with_label_values(&[to]).inc();
    }
}

/// Helper struct for recording message metrics
pub struct MessageMetrics;

impl MessageMetrics {
    /// Message written straight to a live transport
    pub fn record_sent_direct() {
        MESSAGES_SENT_TOTAL.with_label_values(&["direct"]).inc();
    }

    /// Message parked in the outbound queue
    pub fn record_sent_queued() {
        MESSAGES_SENT_TOTAL.with_label_values(&["queued"]).inc();
    }

    pub fn record_received() {
        MESSAGES_RECEIVED_TOTAL.inc();
    }
}
