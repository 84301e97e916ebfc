//! Circuit breaker management HTTP handlers
//!
//! Runtime inspection and reconfiguration of the per-service breakers.

use axum::{
    Json,
    extract::{Path, State},
    response::Response,
};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{CircuitBreakerConfig, CircuitBreakerProfile};
use crate::web::{
    AppState,
    responses::{bad_request, not_found, ok},
};

/// GET /api/v1/circuit-breakers
pub async fn get_circuit_breaker_stats(State(state): State<AppState>) -> Response {
    let stats = state.relay_manager.circuit_breakers().get_all_stats();
    ok(json!({
        "circuit_breakers": stats,
        "count": stats.len(),
    }))
}

/// GET /api/v1/circuit-breakers/config
pub async fn get_circuit_breaker_config(State(state): State<AppState>) -> Response {
    ok(state.relay_manager.circuit_breakers().get_config())
}

/// PUT /api/v1/circuit-breakers/config
pub async fn update_circuit_breaker_config(
    State(state): State<AppState>,
    Json(config): Json<CircuitBreakerConfig>,
) -> Response {
    match state
        .relay_manager
        .circuit_breakers()
        .update_configuration(config)
    {
        Ok(()) => ok(state.relay_manager.circuit_breakers().get_config()),
        Err(e) => {
            warn!("Rejected circuit breaker configuration: {}", e);
            bad_request(&format!("Invalid circuit breaker configuration: {e}"))
        }
    }
}

/// PUT /api/v1/circuit-breakers/services/{name}/config
pub async fn update_service_config(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
    Json(profile): Json<CircuitBreakerProfile>,
) -> Response {
    match state
        .relay_manager
        .circuit_breakers()
        .update_service_config(&service_name, profile.clone())
    {
        Ok(()) => ok(json!({
            "service": service_name,
            "profile": profile,
        })),
        Err(e) => {
            warn!("Failed to update profile for service '{}': {}", service_name, e);
            bad_request(&format!("Failed to update profile: {e}"))
        }
    }
}

/// DELETE /api/v1/circuit-breakers/services/{name}/config
pub async fn remove_service_config(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
) -> Response {
    if state
        .relay_manager
        .circuit_breakers()
        .remove_service_config(&service_name)
    {
        ok(json!({ "service": service_name, "removed": true }))
    } else {
        not_found("circuit breaker profile", &service_name)
    }
}

/// POST /api/v1/circuit-breakers/services/{name}/reset
pub async fn reset_service(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
) -> Response {
    if state.relay_manager.circuit_breakers().reset(&service_name) {
        info!("Reset circuit breaker for service '{}'", service_name);
        ok(json!({ "service": service_name, "reset": true }))
    } else {
        not_found("circuit breaker", &service_name)
    }
}

/// POST /api/v1/circuit-breakers/reset
pub async fn reset_all(State(state): State<AppState>) -> Response {
    let count = state.relay_manager.circuit_breakers().reset_all();
    ok(json!({ "reset": count }))
}
