//! HTTP response types and utilities
//!
//! Every JSON endpoint answers with the [`ApiResponse`] envelope; errors are
//! mapped to status codes in one place by [`handle_error`].

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::{AppError, AppResult, ProbeError, RelayError};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the operation was successful
    pub success: bool,
    /// Response data (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, String>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            details: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            details: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error_with_details(message: String, details: HashMap<String, String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            details: Some(details),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        let status = if self.success {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        (status, Json(self)).into_response()
    }
}

/// Helper function to convert AppResult to HTTP response
pub fn handle_result<T>(result: AppResult<T>) -> Response
where
    T: Serialize,
{
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
        Err(error) => handle_error(error),
    }
}

/// Convert AppError to appropriate HTTP response
pub fn handle_error(error: AppError) -> Response {
    let status = status_for(&error);
    let mut details = HashMap::new();

    let message = match &error {
        AppError::Relay(RelayError::CircuitOpen { service }) => {
            details.insert("service".to_string(), service.clone());
            error.to_string()
        }
        AppError::Relay(RelayError::SessionUnavailable { session_id, state }) => {
            details.insert("session_id".to_string(), session_id.to_string());
            details.insert("state".to_string(), state.to_string());
            error.to_string()
        }
        AppError::NotFound { resource, id } => format!("{} with id '{}' not found", resource, id),
        AppError::Validation { message } => message.clone(),
        _ => error.to_string(),
    };

    let response = if details.is_empty() {
        ApiResponse::<()>::error(message)
    } else {
        ApiResponse::<()>::error_with_details(message, details)
    };

    (status, Json(response)).into_response()
}

fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::Relay(relay) => match relay {
            RelayError::ChannelNotFound { .. }
            | RelayError::ProfileNotFound { .. }
            | RelayError::SessionNotFound { .. }
            | RelayError::ClientNotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::SessionUnavailable { .. } => StatusCode::CONFLICT,
            RelayError::UpstreamFetch { .. } => StatusCode::BAD_GATEWAY,
            RelayError::StartTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        },
        AppError::Probe(ProbeError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        AppError::Probe(ProbeError::Failed { .. }) => StatusCode::BAD_GATEWAY,
        AppError::Probe(ProbeError::Spawn { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        AppError::Validation { .. } => StatusCode::BAD_REQUEST,
        AppError::NotFound { .. } => StatusCode::NOT_FOUND,
    }
}

/// Success response helpers
pub fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

pub fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::<()>::error(message.to_string())),
    )
        .into_response()
}

pub fn not_found(resource: &str, id: &str) -> Response {
    handle_error(AppError::not_found(resource, id))
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_relays: usize,
    pub active_clients: usize,
    pub open_circuits: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_relay_error_status_codes() {
        let cases = [
            (
                AppError::from(RelayError::CircuitOpen {
                    service: "a.example.com".into(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::from(RelayError::ChannelNotFound {
                    channel_id: "x".into(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::from(RelayError::SessionNotFound {
                    session_id: Uuid::new_v4(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::from(RelayError::upstream_fetch("a.example.com", "503")),
                StatusCode::BAD_GATEWAY,
            ),
            (
                AppError::from(RelayError::Configuration {
                    message: "channel 'x' has no upstream sources".into(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::validation("bad"), StatusCode::BAD_REQUEST),
        ];

        for (error, expected) in cases {
            assert_eq!(status_for(&error), expected, "{error}");
        }
    }

    #[test]
    fn test_error_envelope() {
        let response = handle_error(AppError::from(RelayError::CircuitOpen {
            service: "a.example.com".into(),
        }));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
