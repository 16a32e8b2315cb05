use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::recovery::{RetryConfig, RetryStrategy};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Remote analysis endpoint (ws:// or wss://)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

/// Connection pool limits and timings
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Idle time after which a pooled connection is considered stale (seconds)
    #[serde(default = "default_max_idle_time")]
    pub max_idle_time_secs: u64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time to wait before an open circuit lets a probe through (seconds)
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default)]
    pub strategy: RetryStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Pause between messages while flushing (milliseconds)
    #[serde(default = "default_flush_delay")]
    pub flush_delay_ms: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Consecutive failed flushes after which the queue is discarded
    #[serde(default = "default_max_flush_failures")]
    pub max_flush_failures: u32,
    #[serde(default = "default_message_ttl")]
    pub message_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Per-subscriber buffer size
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Session key to open on startup, if any
    #[serde(default)]
    pub auto_start_key: Option<String>,
}

/// Smallest per-subscriber buffer the broadcaster accepts
pub const MIN_SUBSCRIBER_BUFFER: usize = 50;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_endpoint() -> String {
    "ws://localhost:8000/ws".to_string()
}

fn default_max_pool_size() -> usize {
    5
}

fn default_max_idle_time() -> u64 {
    60
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_max_queue_size() -> usize {
    100
}

fn default_flush_delay() -> u64 {
    10
}

fn default_send_timeout() -> u64 {
    5
}

fn default_max_flush_failures() -> u32 {
    3
}

fn default_message_ttl() -> u64 {
    3600 // 1 hour
}

fn default_cleanup_interval() -> u64 {
    300 // 5 minutes
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Settings {
    /// Load settings from defaults, optional config files and `APP_*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `APP_POOL__MAX_POOL_SIZE=8`.
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("transport.endpoint", default_endpoint())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations no component can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_pool_size == 0 {
            return Err(ConfigError::Message("pool.max_pool_size must be at least 1".into()));
        }
        if self.pool.connection_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "pool.connection_timeout_secs must be at least 1".into(),
            ));
        }
        let intervals = [
            ("pool.health_check_interval_secs", self.pool.health_check_interval_secs),
            ("session.heartbeat_interval_secs", self.session.heartbeat_interval_secs),
            ("queue.cleanup_interval_secs", self.queue.cleanup_interval_secs),
            ("queue.send_timeout_secs", self.queue.send_timeout_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Message(format!("{} must be at least 1", name)));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Message(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Message("retry.max_attempts must be at least 1".into()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Message(
                "retry.multiplier must be a finite number >= 1.0".into(),
            ));
        }
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::Message("queue.max_queue_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
            strategy: self.strategy,
        }
    }
}

impl QueueConfig {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl EventsConfig {
    /// Buffer size actually used, never below [`MIN_SUBSCRIBER_BUFFER`]
    pub fn effective_buffer(&self) -> usize {
        self.subscriber_buffer.max(MIN_SUBSCRIBER_BUFFER)
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            max_idle_time_secs: default_max_idle_time(),
            connection_timeout_secs: default_connection_timeout(),
            health_check_interval_secs: default_health_check_interval(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: true,
            strategy: RetryStrategy::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            flush_delay_ms: default_flush_delay(),
            send_timeout_secs: default_send_timeout(),
            max_flush_failures: default_max_flush_failures(),
            message_ttl_secs: default_message_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            auto_start_key: None,
        }
    }
}
