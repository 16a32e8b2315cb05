//! Prometheus metrics endpoint.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::error::AppError;
use crate::metrics::{self, CircuitMetrics, PoolMetrics, QueueMetrics};
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    update_metrics_from_state(&state);

    let output = metrics::encode_metrics()
        .map_err(|e| AppError::Internal(format!("failed to encode metrics: {}", e)))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    ))
}

/// Resync gauges that drift between scrapes
fn update_metrics_from_state(state: &AppState) {
    let health = state.session.stats();
    PoolMetrics::set_size(health.pool.total);
    QueueMetrics::set_depth(health.queue_depth);

    for breaker in state.session.circuit_breakers() {
        CircuitMetrics::set_state(&breaker.operation, breaker.state as i64);
    }
}
