//! Health check HTTP handlers

use axum::{extract::State, response::Response};

use crate::utils::circuit_breaker::CircuitBreakerState;
use crate::web::{
    AppState,
    responses::{HealthResponse, ok},
};

/// Liveness plus a summary of relay and breaker state
pub async fn health_check(State(state): State<AppState>) -> Response {
    let stats = state.relay_manager.relay_stats();
    let open_circuits = state
        .relay_manager
        .circuit_breakers()
        .get_all_stats()
        .values()
        .filter(|s| s.state == CircuitBreakerState::Open)
        .count();

    ok(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_relays: stats.total_sessions,
        active_clients: stats.total_clients,
        open_circuits,
        timestamp: chrono::Utc::now(),
    })
}
