//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::recovery::{CircuitBreakerStats, CircuitState};
use crate::server::AppState;
use crate::session::{ConnectionHealth, ConnectionState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub session: SessionHealthResponse,
    pub open_circuits: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionHealthResponse {
    pub state: ConnectionState,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub queue_depth: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub connection: ConnectionHealth,
}

#[derive(Debug, Serialize)]
pub struct CircuitBreakersResponse {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub breakers: Vec<CircuitBreakerStats>,
}

/// Overall status: `healthy` when connected or idle, `degraded` otherwise
fn status_for(state: ConnectionState, open_circuits: usize) -> &'static str {
    match state {
        ConnectionState::Error | ConnectionState::Reconnecting => "degraded",
        _ if open_circuits > 0 => "degraded",
        _ => "healthy",
    }
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let connection = state.session.stats();
    let open_circuits = state
        .session
        .circuit_breakers()
        .iter()
        .filter(|b| b.state == CircuitState::Open)
        .count();

    Json(HealthResponse {
        status: status_for(connection.state, open_circuits).to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        session: SessionHealthResponse {
            state: connection.state,
            connected: connection.connected,
            session_key: connection.session_key,
            queue_depth: connection.queue_depth,
        },
        open_circuits,
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        connection: state.session.stats(),
    })
}

pub async fn circuit_breakers(State(state): State<AppState>) -> Json<CircuitBreakersResponse> {
    let config = &state.settings.circuit_breaker;
    Json(CircuitBreakersResponse {
        failure_threshold: config.failure_threshold,
        recovery_timeout_secs: config.recovery_timeout_secs,
        breakers: state.session.circuit_breakers(),
    })
}
