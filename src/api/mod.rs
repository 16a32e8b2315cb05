//! API layer - HTTP endpoint handlers for session control and introspection.

mod health;
mod metrics;
mod routes;
mod sessions;

pub use health::{circuit_breakers, health, stats};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
pub use sessions::{close_session, open_session, reconnect_session, send_message};
