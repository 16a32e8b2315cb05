//! Session control endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::{AppError, Result};
use crate::server::AppState;
use crate::session::ConnectionState;

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_key: String,
    pub state: ConnectionState,
    pub queued: usize,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    /// false when the message was queued for later delivery
    pub delivered: bool,
    pub state: ConnectionState,
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() || key.len() > 128 {
        return Err(AppError::Validation(
            "session key must be 1-128 characters".to_string(),
        ));
    }
    Ok(())
}

fn session_response(state: &AppState, key: String) -> SessionResponse {
    SessionResponse {
        queued: state.session.queued(&key),
        state: state.session.state(),
        session_key: key,
    }
}

/// POST /api/v1/sessions/{key} - make `key` the active session
pub async fn open_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SessionResponse>> {
    validate_key(&key)?;
    state.session.connect(&key).await?;
    Ok(Json(session_response(&state, key)))
}

/// POST /api/v1/sessions/{key}/reconnect - force a fresh connection
pub async fn reconnect_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SessionResponse>> {
    validate_key(&key)?;
    state.session.restart(&key).await?;
    Ok(Json(session_response(&state, key)))
}

/// DELETE /api/v1/sessions/{key} - end the session and drop its queue
pub async fn close_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode> {
    validate_key(&key)?;
    if state.session.active_key().as_deref() != Some(key.as_str()) && state.session.queued(&key) == 0 {
        return Err(AppError::NotFound(format!("session {}", key)));
    }
    state.session.disconnect(&key).await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/messages - send on the active session, queueing if offline
pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendMessageResponse>)> {
    if request.message_type.trim().is_empty() {
        return Err(AppError::Validation("message type is required".to_string()));
    }

    let payload = match request.payload {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let delivered = state
        .session
        .send(Envelope::with_json(request.message_type, payload))
        .await;
    let status = if delivered {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };

    Ok((
        status,
        Json(SendMessageResponse {
            delivered,
            state: state.session.state(),
        }),
    ))
}
