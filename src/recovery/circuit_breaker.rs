//! Circuit breaker pattern keyed by operation name

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::metrics::CircuitMetrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed, requests flow through normally
    Closed = 0,
    /// Circuit is open, requests are rejected
    Open = 1,
    /// Circuit is half-open, a single probe request is allowed
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Per-operation breaker record, created lazily on first failure
#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    /// Start of the outstanding half-open probe, if any
    probe_started_at: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            probe_started_at: None,
        }
    }
}

/// Snapshot of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub operation: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Milliseconds since the last recorded failure
    pub last_failure_ago_ms: Option<u64>,
    /// Milliseconds until an open circuit admits a probe
    pub retry_after_ms: Option<u64>,
}

/// Circuit breakers for every operation key.
///
/// All transitions for a key happen under one lock, so read-modify-write
/// sequences never interleave.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, BreakerEntry>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        assert!(config.failure_threshold > 0, "failure_threshold must be at least 1");
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask whether `operation` may run now.
    ///
    /// Returns the state the call proceeds under, or the remaining wait when
    /// the circuit is open. An open circuit whose recovery timeout elapsed
    /// moves to half-open and admits exactly one probe.
    pub fn try_acquire(&self, operation: &str) -> Result<CircuitState, Duration> {
        let now = Instant::now();
        let recovery_timeout = self.config.recovery_timeout();
        let mut breakers = self.breakers.lock();

        let Some(entry) = breakers.get_mut(operation) else {
            return Ok(CircuitState::Closed);
        };

        match entry.state {
            CircuitState::Closed => Ok(CircuitState::Closed),
            CircuitState::Open => {
                let next = entry.next_attempt_at.unwrap_or(now);
                if now < next {
                    return Err(next - now);
                }
                entry.state = CircuitState::HalfOpen;
                entry.probe_started_at = Some(now);
                CircuitMetrics::set_state(operation, CircuitState::HalfOpen as i64);
                tracing::info!(operation = %operation, "Circuit breaker transitioning to half-open state");
                Ok(CircuitState::HalfOpen)
            }
            CircuitState::HalfOpen => match entry.probe_started_at {
                // A probe that never reported back (cancelled caller) expires
                Some(started) if now.duration_since(started) < recovery_timeout => {
                    Err(recovery_timeout - now.duration_since(started))
                }
                _ => {
                    entry.probe_started_at = Some(now);
                    Ok(CircuitState::HalfOpen)
                }
            },
        }
    }

    /// Record a successful operation: close the circuit and reset the failure count
    pub fn record_success(&self, operation: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(entry) = breakers.get_mut(operation) {
            let was = entry.state;
            entry.state = CircuitState::Closed;
            entry.failure_count = 0;
            entry.next_attempt_at = None;
            entry.probe_started_at = None;

            if was != CircuitState::Closed {
                CircuitMetrics::set_state(operation, CircuitState::Closed as i64);
                tracing::info!(operation = %operation, "Circuit breaker closed after successful recovery");
            }
        }
    }

    /// Record a failed operation that counts toward opening the circuit
    pub fn record_failure(&self, operation: &str) {
        let now = Instant::now();
        let recovery_timeout = self.config.recovery_timeout();
        let mut breakers = self.breakers.lock();
        let entry = breakers
            .entry(operation.to_string())
            .or_insert_with(BreakerEntry::new);

        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure_at = Some(now);
        entry.probe_started_at = None;

        match entry.state {
            CircuitState::Closed => {
                if entry.failure_count >= self.config.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.next_attempt_at = Some(now + recovery_timeout);
                    CircuitMetrics::set_state(operation, CircuitState::Open as i64);
                    tracing::warn!(
                        operation = %operation,
                        failures = entry.failure_count,
                        "Circuit breaker opened due to failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state reopens the circuit
                entry.state = CircuitState::Open;
                entry.next_attempt_at = Some(now + recovery_timeout);
                CircuitMetrics::set_state(operation, CircuitState::Open as i64);
                tracing::warn!(operation = %operation, "Circuit breaker reopened after failure in half-open state");
            }
            CircuitState::Open => {
                entry.next_attempt_at = Some(now + recovery_timeout);
            }
        }
    }

    /// Release a half-open probe whose failure does not say anything about
    /// the health of the operation (e.g. a validation error)
    pub fn record_neutral(&self, operation: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(entry) = breakers.get_mut(operation) {
            entry.probe_started_at = None;
        }
    }

    /// Current state without triggering any transition
    pub fn state(&self, operation: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(operation)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn failure_count(&self, operation: &str) -> u32 {
        self.breakers
            .lock()
            .get(operation)
            .map(|e| e.failure_count)
            .unwrap_or(0)
    }

    /// Forget everything about `operation`
    pub fn reset(&self, operation: &str) {
        if self.breakers.lock().remove(operation).is_some() {
            CircuitMetrics::set_state(operation, CircuitState::Closed as i64);
        }
    }

    /// Snapshot of every known breaker, sorted by operation
    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let now = Instant::now();
        let breakers = self.breakers.lock();
        let mut stats: Vec<_> = breakers
            .iter()
            .map(|(operation, entry)| CircuitBreakerStats {
                operation: operation.clone(),
                state: entry.state,
                failure_count: entry.failure_count,
                last_failure_ago_ms: entry
                    .last_failure_at
                    .map(|at| now.duration_since(at).as_millis() as u64),
                retry_after_ms: match entry.state {
                    CircuitState::Open => entry
                        .next_attempt_at
                        .map(|next| next.saturating_duration_since(now).as_millis() as u64),
                    _ => None,
                },
            })
            .collect();
        stats.sort_by(|a, b| a.operation.cmp(&b.operation));
        stats
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32, recovery_secs: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
        })
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreakerRegistry::default();
        assert_eq!(cb.state("connect:s1"), CircuitState::Closed);
        assert_eq!(cb.try_acquire("connect:s1"), Ok(CircuitState::Closed));
        assert!(cb.snapshot().is_empty());
    }

    #[test]
    fn test_circuit_breaker_opens_on_failures() {
        let cb = registry(3, 60);

        cb.record_failure("op");
        cb.record_failure("op");
        assert_eq!(cb.state("op"), CircuitState::Closed);

        cb.record_failure("op"); // 3rd failure
        assert_eq!(cb.state("op"), CircuitState::Open);
        assert!(cb.try_acquire("op").is_err());
    }

    #[test]
    fn test_breakers_are_independent_per_key() {
        let cb = registry(1, 60);
        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Open);
        assert_eq!(cb.try_acquire("b"), Ok(CircuitState::Closed));
    }

    #[test]
    fn test_circuit_breaker_success_resets_failures() {
        let cb = registry(3, 60);

        cb.record_failure("op");
        cb.record_failure("op");
        cb.record_success("op"); // Reset failures

        cb.record_failure("op");
        cb.record_failure("op");
        assert_eq!(cb.state("op"), CircuitState::Closed); // Still closed, need 3 consecutive
        assert_eq!(cb.failure_count("op"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let cb = registry(1, 10);
        cb.record_failure("op");

        let wait = cb.try_acquire("op").unwrap_err();
        assert!(wait <= Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cb.try_acquire("op"), Ok(CircuitState::HalfOpen));
        assert_eq!(cb.state("op"), CircuitState::HalfOpen);

        // Second caller while the probe is outstanding
        assert!(cb.try_acquire("op").is_err());

        cb.record_success("op");
        assert_eq!(cb.state("op"), CircuitState::Closed);
        assert_eq!(cb.try_acquire("op"), Ok(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_reopens_on_half_open_failure() {
        let cb = registry(1, 10);
        cb.record_failure("op");

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.try_acquire("op"), Ok(CircuitState::HalfOpen));

        cb.record_failure("op"); // Failure in half-open should reopen
        assert_eq!(cb.state("op"), CircuitState::Open);
        let wait = cb.try_acquire("op").unwrap_err();
        assert!(wait > Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_expires() {
        let cb = registry(1, 10);
        cb.record_failure("op");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cb.try_acquire("op"), Ok(CircuitState::HalfOpen));

        // Probe owner vanished without reporting
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cb.try_acquire("op"), Ok(CircuitState::HalfOpen));
    }

    #[test]
    fn test_snapshot_reports_open_breakers() {
        let cb = registry(1, 60);
        cb.record_failure("connect:s1");
        cb.record_failure("connect:s2");
        cb.reset("connect:s2");

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].operation, "connect:s1");
        assert_eq!(snapshot[0].state, CircuitState::Open);
        assert!(snapshot[0].retry_after_ms.is_some());
    }
}
