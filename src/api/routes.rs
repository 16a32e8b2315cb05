use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::health::{circuit_breakers, health, stats};
use super::metrics::prometheus_metrics;
use super::sessions::{close_session, open_session, reconnect_session, send_message};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/circuit-breakers", get(circuit_breakers))
        .route("/metrics", get(prometheus_metrics))
        // Session control
        .nest(
            "/api/v1",
            Router::new()
                .route("/sessions/{key}", post(open_session).delete(close_session))
                .route("/sessions/{key}/reconnect", post(reconnect_session))
                .route("/messages", post(send_message)),
        )
}
