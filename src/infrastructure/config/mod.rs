mod settings;

pub use settings::{
    CircuitBreakerConfig, EventsConfig, PoolConfig, QueueConfig, RetrySettings, ServerConfig,
    SessionConfig, Settings, TransportConfig, MIN_SUBSCRIBER_BUFFER,
};
