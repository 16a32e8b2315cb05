//! Retry delay strategies with jitter

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `base * multiplier^attempt`
    #[default]
    ExponentialBackoff,
    /// `base * (attempt + 1)`
    LinearBackoff,
    /// Always `base`
    FixedDelay,
    /// No delay at all
    Immediate,
}

/// Retry budget and delay shape for one operation
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    /// Randomize each delay by up to ±50%
    pub jitter: bool,
    pub strategy: RetryStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            strategy: RetryStrategy::ExponentialBackoff,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay after the failed attempt with zero-based index `attempt`, before jitter.
    ///
    /// Never exceeds `max_delay`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();

        let delay = match self.strategy {
            RetryStrategy::ExponentialBackoff => {
                let exponent = attempt.min(i32::MAX as u32) as i32;
                base * self.multiplier.powi(exponent)
            }
            RetryStrategy::LinearBackoff => base * (attempt as f64 + 1.0),
            RetryStrategy::FixedDelay => base,
            RetryStrategy::Immediate => 0.0,
        };

        Duration::from_secs_f64(delay.min(max).max(0.0))
    }

    /// Delay after the failed attempt with zero-based index `attempt`, jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let factor = rand::rng().random_range(0.5..1.5);
        let jittered = delay.as_secs_f64() * factor;
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

/// Stateful backoff used by loops that retry until told to stop
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Get the next delay duration
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get the current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
