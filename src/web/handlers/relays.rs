//! Relay session inspection and control

use axum::{
    extract::{Path, State},
    response::Response,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::web::{
    AppState,
    responses::{bad_request, handle_error, ok},
};

/// GET /api/v1/relays
pub async fn list_relays(State(state): State<AppState>) -> Response {
    let sessions = state.relay_manager.list_sessions();
    let stats = state.relay_manager.relay_stats();
    ok(json!({
        "sessions": sessions,
        "stats": stats,
    }))
}

/// GET /api/v1/relays/{id}
pub async fn get_relay(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    let Ok(session_id) = Uuid::parse_str(&session_id) else {
        return bad_request("Invalid relay session id");
    };
    match state.relay_manager.get_session(session_id) {
        Ok(info) => ok(info),
        Err(e) => handle_error(AppError::from(e)),
    }
}

/// DELETE /api/v1/relays/{id}
pub async fn stop_relay(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    let Ok(session_id) = Uuid::parse_str(&session_id) else {
        return bad_request("Invalid relay session id");
    };
    match state.relay_manager.stop_relay(session_id) {
        Ok(()) => {
            info!(session_id = %session_id, "Relay session stopped via API");
            ok(json!({ "session_id": session_id, "stopped": true }))
        }
        Err(e) => handle_error(AppError::from(e)),
    }
}
