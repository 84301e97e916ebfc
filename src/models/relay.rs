//! Relay session data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::services::stream_prober::CodecInfo;
use crate::streaming::classification::ClassificationResult;

/// Lifecycle of a relay session
///
/// `Starting -> Active -> Draining -> Stopped`, with `Error` reachable from any
/// non-terminal state. A draining session returns to `Active` when a client attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaySessionState {
    Starting,
    Active,
    Draining,
    Stopped,
    Error,
}

impl RelaySessionState {
    /// Whether clients may attach
    pub fn accepts_clients(&self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Draining)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for RelaySessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Registry key: one upstream fetch per channel and relay profile
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelaySessionKey {
    pub channel_id: String,
    pub profile_id: Option<String>,
}

impl RelaySessionKey {
    pub fn new(channel_id: impl Into<String>, profile_id: Option<&str>) -> Self {
        Self {
            channel_id: channel_id.into(),
            profile_id: profile_id.map(str::to_string),
        }
    }
}

impl fmt::Display for RelaySessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.profile_id {
            Some(profile) => write!(f, "{}@{}", self.channel_id, profile),
            None => write!(f, "{}", self.channel_id),
        }
    }
}

/// An upstream source for a channel; lower priority values are tried first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamCandidate {
    pub url: String,
    pub priority: i32,
}

/// Returned by `start_relay`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelaySessionHandle {
    pub session_id: Uuid,
    pub channel_id: String,
    pub profile_id: Option<String>,
    pub state: RelaySessionState,
    /// The caller joined a session that already existed
    pub joined: bool,
}

/// Why a client byte stream ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum EndReason {
    /// The client was removed from its session
    Removed,
    /// The session stopped (drain elapsed, upstream ended or explicit stop)
    SessionStopped,
    /// The session failed; the failure is also kept in session state
    SessionFailed(String),
}

/// Snapshot of an attached client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayClientInfo {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub bytes_delivered: u64,
    pub chunks_dropped: u64,
    pub queued_chunks: usize,
}

/// Snapshot of a relay session
#[derive(Debug, Clone, Serialize)]
pub struct RelaySessionInfo {
    pub session_id: Uuid,
    pub channel_id: String,
    pub profile_id: Option<String>,
    pub state: RelaySessionState,
    pub failure_reason: Option<String>,
    pub upstream_url: Option<String>,
    pub service_name: Option<String>,
    /// `passthrough`, `collapse` or `remux`
    pub transport: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub client_count: usize,
    pub clients: Vec<RelayClientInfo>,
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub chunks_dropped: u64,
    pub reconnect_attempts: u32,
    pub classification: Option<ClassificationResult>,
    pub codec_info: Option<CodecInfo>,
}

/// Aggregate relay counters
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RelayStats {
    pub total_sessions: usize,
    pub sessions_by_state: BTreeMap<RelaySessionState, usize>,
    pub total_clients: usize,
    pub bytes_received: u64,
    pub chunks_dropped: u64,
}

/// Relay lifecycle notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayEvent {
    pub session_id: Uuid,
    pub channel_id: String,
    pub event_type: RelayEventType,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RelayEvent {
    pub fn new(
        session_id: Uuid,
        channel_id: impl Into<String>,
        event_type: RelayEventType,
        details: Option<String>,
    ) -> Self {
        Self {
            session_id,
            channel_id: channel_id.into(),
            event_type,
            details,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayEventType {
    Start,
    Stop,
    Error,
    ClientConnect,
    ClientDisconnect,
    Reconnect,
}
