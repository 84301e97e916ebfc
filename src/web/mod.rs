//! Web layer module
//!
//! Thin axum handlers over the relay session manager: the client stream
//! endpoint plus JSON routes for relay, diagnostics and circuit breaker
//! administration.

use anyhow::Result;
use axum::{
    Router,
    routing::{get, post, put},
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::services::relay_manager::RelaySessionManager;

pub mod handlers;
pub mod responses;

pub use responses::{ApiResponse, handle_error, handle_result};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub relay_manager: RelaySessionManager,
}

impl AppState {
    pub fn new(relay_manager: RelaySessionManager) -> Self {
        Self { relay_manager }
    }
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(host: &str, port: u16, state: AppState) -> Result<Self> {
        let addr: SocketAddr = format!("{host}:{port}").parse()?;
        Ok(Self {
            app: create_router(state),
            addr,
        })
    }

    /// Serve until the token is cancelled, then finish in-flight requests
    pub async fn serve_with_cancellation(self, cancellation_token: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.addr, e))?;
        info!("Web server listening on http://{}", self.addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move {
                cancellation_token.cancelled().await;
                info!("Web server received cancellation signal, shutting down gracefully");
            })
            .await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/relays", get(handlers::relays::list_relays))
        .route(
            "/relays/{id}",
            get(handlers::relays::get_relay).delete(handlers::relays::stop_relay),
        )
        .route("/streams/probe", get(handlers::streams::probe_stream))
        .route("/streams/classify", get(handlers::streams::classify_stream))
        .route("/codec-cache/stats", get(handlers::streams::codec_cache_stats))
        .route(
            "/circuit-breakers",
            get(handlers::circuit_breaker::get_circuit_breaker_stats),
        )
        .route(
            "/circuit-breakers/config",
            get(handlers::circuit_breaker::get_circuit_breaker_config)
                .put(handlers::circuit_breaker::update_circuit_breaker_config),
        )
        .route(
            "/circuit-breakers/services/{name}/config",
            put(handlers::circuit_breaker::update_service_config)
                .delete(handlers::circuit_breaker::remove_service_config),
        )
        .route(
            "/circuit-breakers/services/{name}/reset",
            post(handlers::circuit_breaker::reset_service),
        )
        .route(
            "/circuit-breakers/reset",
            post(handlers::circuit_breaker::reset_all),
        );

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/stream/{channel_id}", get(handlers::stream::stream_channel))
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
