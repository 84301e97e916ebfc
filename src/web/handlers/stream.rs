//! Client stream endpoint
//!
//! `GET /stream/{channel_id}` joins (or starts) the channel's relay session and
//! streams its bytes until the client disconnects or the session ends.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use tracing::{debug, info, warn};

use crate::errors::{AppError, RelayError};
use crate::web::{AppState, responses::handle_error};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub profile: Option<String>,
}

pub async fn stream_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let user_agent = header_value(&headers, header::USER_AGENT.as_str());
    let remote_addr = header_value(&headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .or_else(|| header_value(&headers, "x-real-ip"));

    // a session can stop between start and attach; one retry starts a fresh one
    let mut attempts = 0;
    let (client, stream) = loop {
        attempts += 1;
        let handle = match state
            .relay_manager
            .start_relay(&channel_id, query.profile.as_deref())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "Failed to start relay for client");
                return handle_error(AppError::from(e));
            }
        };

        match state.relay_manager.add_relay_client(
            handle.session_id,
            user_agent.clone(),
            remote_addr.clone(),
        ) {
            Ok(attached) => break attached,
            Err(e @ (RelayError::SessionNotFound { .. } | RelayError::SessionUnavailable { .. }))
                if attempts < 2 =>
            {
                debug!(channel_id = %channel_id, error = %e, "Relay session ended before attach, retrying");
            }
            Err(e) => return handle_error(AppError::from(e)),
        }
    };

    info!(
        channel_id = %channel_id,
        session_id = %client.session_id,
        client_id = %client.id,
        user_agent = ?client.user_agent,
        "Streaming relay to client"
    );

    let body = Body::from_stream(stream.map(Ok::<_, Infallible>));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        body,
    )
        .into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
