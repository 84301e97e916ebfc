//! Stream diagnostics: codec probing and classification

use axum::{
    extract::{Query, State},
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use crate::errors::AppError;
use crate::services::stream_prober::ProbeReport;
use crate::utils::url::UrlUtils;
use crate::web::{
    AppState,
    responses::{bad_request, handle_error, ok},
};

#[derive(Debug, Deserialize)]
pub struct UrlQuery {
    pub url: String,
}

fn validate(url: &str) -> Result<(), Response> {
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(bad_request("url must be an absolute http(s) URL")),
    }
}

/// GET /api/v1/streams/probe?url=
pub async fn probe_stream(State(state): State<AppState>, Query(query): Query<UrlQuery>) -> Response {
    if let Err(response) = validate(&query.url) {
        return response;
    }
    match state.relay_manager.probe_stream(&query.url).await {
        Ok(codec_info) => ok(ProbeReport {
            url: UrlUtils::redact(&query.url),
            codec_info,
            probed_at: chrono::Utc::now(),
        }),
        Err(e) => handle_error(AppError::from(e)),
    }
}

/// GET /api/v1/streams/classify?url=
pub async fn classify_stream(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> Response {
    if let Err(response) = validate(&query.url) {
        return response;
    }
    ok(state.relay_manager.classify_stream(&query.url).await)
}

/// GET /api/v1/codec-cache/stats
pub async fn codec_cache_stats(State(state): State<AppState>) -> Response {
    ok(json!({
        "stats": state.relay_manager.codec_cache_stats(),
        "entries": state.relay_manager.codec_cache().entries(),
    }))
}
