//! Failure isolation and retry.
//!
//! - [`CircuitBreakerRegistry`]: per-operation-key circuit breakers
//! - [`RetryConfig`] / [`Backoff`]: delay strategies with jitter
//! - [`ErrorKind`]: classification feeding retry decisions and recovery actions
//! - [`RecoveryController`]: `execute_with_recovery` over any fallible async operation

mod backoff;
mod circuit_breaker;
mod classify;
mod controller;

pub use backoff::{Backoff, RetryConfig, RetryStrategy};
pub use circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerStats, CircuitState};
pub use classify::{Classify, ErrorKind, ErrorSeverity, RecoveryAction, RecoveryActionKind};
pub use controller::{
    NoopRecoveryHandler, OperationContext, RecoveryController, RecoveryError, RecoveryHandler,
    RecoveryStats,
};
