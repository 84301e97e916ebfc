//! Error type definitions for the relay service

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::relay::RelaySessionState;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Relay subsystem errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// External probe errors
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },
}

impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }
}

/// Relay session errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("Channel not found: {channel_id}")]
    ChannelNotFound { channel_id: String },

    #[error("Relay profile not found: {profile_id}")]
    ProfileNotFound { profile_id: String },

    /// Upstream calls for the service are rejected without being attempted
    #[error("Service unavailable: circuit open for {service}")]
    CircuitOpen { service: String },

    #[error("Relay session not found: {session_id}")]
    SessionNotFound { session_id: Uuid },

    #[error("Relay client {client_id} not found in session {session_id}")]
    ClientNotFound { session_id: Uuid, client_id: Uuid },

    #[error("Relay session {session_id} is {state} and cannot accept clients")]
    SessionUnavailable {
        session_id: Uuid,
        state: RelaySessionState,
    },

    #[error("Upstream fetch failed for {service}: {message}")]
    UpstreamFetch { service: String, message: String },

    #[error("No upstream data for channel {channel_id} within {timeout:?}")]
    StartTimeout { channel_id: String, timeout: Duration },

    #[error("Relay configuration error: {message}")]
    Configuration { message: String },
}

impl RelayError {
    pub fn upstream_fetch<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::UpstreamFetch {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Lookups against sessions or clients that were torn down concurrently
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Self::SessionNotFound { .. } | Self::ClientNotFound { .. })
    }
}

/// External probe failure; cloneable so a cached failure can be handed to every caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe failed for {url}: {message}")]
    Failed { url: String, message: String },

    #[error("Probe timed out for {url} after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("Failed to run probe command '{command}': {message}")]
    Spawn { command: String, message: String },
}

impl ProbeError {
    pub fn failed<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::Failed {
            url: url.into(),
            message: message.into(),
        }
    }
}
