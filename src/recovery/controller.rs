//! Retry loop combining circuit breakers, backoff and recovery actions

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::metrics::CircuitMetrics;

use super::backoff::RetryConfig;
use super::circuit_breaker::CircuitBreakerRegistry;
use super::classify::{Classify, ErrorKind, ErrorSeverity, RecoveryAction, RecoveryActionKind};

/// What a recovery handler knows about the failure it is asked to help with
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation_key: String,
    /// 1-based attempt that just failed
    pub attempt: u32,
    pub kind: ErrorKind,
    pub error: String,
}

/// Executes automatic recovery actions between retries
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Returns true if the action restored the operation's preconditions,
    /// in which case the next attempt runs without waiting out the backoff
    async fn execute(&self, action: &RecoveryAction, context: &OperationContext) -> bool;
}

/// Handler that never recovers anything; retries always wait out their backoff
pub struct NoopRecoveryHandler;

#[async_trait]
impl RecoveryHandler for NoopRecoveryHandler {
    async fn execute(&self, action: &RecoveryAction, context: &OperationContext) -> bool {
        tracing::debug!(
            operation = %context.operation_key,
            action = action.kind.as_str(),
            "No recovery handler installed, skipping action"
        );
        false
    }
}

/// Outcome of an operation the controller gave up on
#[derive(Debug, Error)]
pub enum RecoveryError<E>
where
    E: std::error::Error + 'static,
{
    /// Rejected without invoking the operation
    #[error("Circuit open for '{operation_key}', retry after {retry_after:?}")]
    CircuitOpen {
        operation_key: String,
        retry_after: Duration,
    },

    #[error("'{operation_key}' failed after {attempts} attempt(s): {source}")]
    Failed {
        operation_key: String,
        source: E,
        kind: ErrorKind,
        severity: ErrorSeverity,
        attempts: u32,
        /// Actions left for the caller to take
        suggested_actions: Vec<RecoveryAction>,
    },
}

impl<E> RecoveryError<E>
where
    E: std::error::Error + 'static,
{
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecoveryError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            RecoveryError::Failed { kind, .. } => *kind,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RecoveryError::CircuitOpen { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    pub total_errors: u64,
    pub total_retries: u64,
    pub last_error: Option<String>,
}

/// Wraps fallible async operations with per-key circuit breaking and retries
pub struct RecoveryController {
    breakers: Arc<CircuitBreakerRegistry>,
    handler: Arc<dyn RecoveryHandler>,
    total_errors: AtomicU64,
    total_retries: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RecoveryController {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self::with_handler(breakers, Arc::new(NoopRecoveryHandler))
    }

    pub fn with_handler(
        breakers: Arc<CircuitBreakerRegistry>,
        handler: Arc<dyn RecoveryHandler>,
    ) -> Self {
        Self {
            breakers,
            handler,
            total_errors: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts
    /// `retry.max_attempts`, or the circuit for `operation_key` is open.
    ///
    /// The circuit is consulted before every attempt, so a circuit opened by
    /// this very loop stops it immediately.
    pub async fn execute_with_recovery<T, E, F, Fut>(
        &self,
        operation_key: &str,
        retry: &RetryConfig,
        mut operation: F,
    ) -> Result<T, RecoveryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + 'static,
    {
        let max_attempts = retry.max_attempts.max(1);
        let mut executed: HashSet<RecoveryActionKind> = HashSet::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if let Err(retry_after) = self.breakers.try_acquire(operation_key) {
                CircuitMetrics::record_rejection();
                tracing::debug!(
                    operation = %operation_key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Circuit open, failing fast"
                );
                return Err(RecoveryError::CircuitOpen {
                    operation_key: operation_key.to_string(),
                    retry_after,
                });
            }

            let err = match operation().await {
                Ok(value) => {
                    self.breakers.record_success(operation_key);
                    if attempt > 1 {
                        tracing::info!(operation = %operation_key, attempt, "Operation recovered");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = err.kind();
            self.total_errors.fetch_add(1, Ordering::Relaxed);
            *self.last_error.lock() = Some(err.to_string());

            if kind.is_retryable() {
                self.breakers.record_failure(operation_key);
            } else {
                self.breakers.record_neutral(operation_key);
            }

            let severity = kind.severity(attempt);
            let actions = kind.recovery_actions();

            if !kind.is_retryable() || attempt >= max_attempts {
                tracing::error!(
                    operation = %operation_key,
                    attempt,
                    kind = %kind,
                    severity = ?severity,
                    error = %err,
                    "Operation failed, giving up"
                );
                return Err(RecoveryError::Failed {
                    operation_key: operation_key.to_string(),
                    source: err,
                    kind,
                    severity,
                    attempts: attempt,
                    suggested_actions: actions
                        .into_iter()
                        .filter(|a| !a.auto_executable)
                        .collect(),
                });
            }

            tracing::warn!(
                operation = %operation_key,
                attempt,
                max_attempts,
                kind = %kind,
                error = %err,
                "Operation failed, retrying"
            );

            let context = OperationContext {
                operation_key: operation_key.to_string(),
                attempt,
                kind,
                error: err.to_string(),
            };

            let mut recovered = false;
            for action in actions.iter().filter(|a| a.auto_executable) {
                // Each action runs at most once per call
                if !executed.insert(action.kind) {
                    continue;
                }
                let succeeded = self.handler.execute(action, &context).await;
                CircuitMetrics::record_recovery_action(action.kind.as_str(), succeeded);
                if succeeded {
                    tracing::info!(
                        operation = %operation_key,
                        action = action.kind.as_str(),
                        "Recovery action succeeded"
                    );
                    recovered = true;
                    break;
                }
            }

            self.total_retries.fetch_add(1, Ordering::Relaxed);
            CircuitMetrics::record_retry();

            if !recovered {
                let delay = retry.delay_for(attempt - 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            total_errors: self.total_errors.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}
