//! Relay Session Manager
//!
//! One relay session per (channel, relay profile) fetches the upstream once and
//! fans every chunk out to the private buffers of its attached clients.
//!
//! Session lifecycle:
//!
//! - `start_relay` joins a live session for the key or creates one in
//!   `Starting`, admitted by the circuit breaker of the first upstream
//!   candidate whose breaker allows a call. An open breaker on every candidate
//!   fails fast with `CircuitOpen` before anything is created.
//! - The first upstream bytes move the session to `Active`.
//! - When the last client detaches the session enters `Draining`; a client
//!   attaching within `drain_grace_period` revives it on the same upstream
//!   fetch, otherwise it stops.
//! - Teardown happens exactly once: the upstream task is cancelled, every
//!   client stream ends and the session leaves the registry.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{RelayConfig, RelayProfileConfig};
use crate::errors::{ProbeError, RelayError};
use crate::models::relay::{
    EndReason, RelayClientInfo, RelayEvent, RelayEventType, RelaySessionHandle, RelaySessionInfo,
    RelaySessionKey, RelaySessionState, RelayStats, UpstreamCandidate,
};
use crate::observability::metrics;
use crate::services::channel_resolver::ChannelResolver;
use crate::services::circuit_breaker_manager::CircuitBreakerManager;
use crate::services::codec_cache::{CodecCacheStats, CodecProbeCache};
use crate::services::events::RelayEventSink;
use crate::services::relay_buffer::{ClientBuffer, DetachGuard, RelayByteStream};
use crate::services::stream_prober::CodecInfo;
use crate::services::upstream::{UpstreamError, UpstreamFetcher, UpstreamRequest, UpstreamTransport};
use crate::streaming::classification::{ClassificationResult, StreamClassifier};
use crate::utils::circuit_breaker::{CallOutcome, CallPermit, CircuitBreaker};
use crate::utils::url::UrlUtils;

/// Collaborators of the relay manager
pub struct RelayDependencies {
    pub resolver: Arc<dyn ChannelResolver>,
    pub fetcher: Arc<dyn UpstreamFetcher>,
    pub circuit_breakers: CircuitBreakerManager,
    pub classifier: Arc<StreamClassifier>,
    pub codec_cache: Arc<CodecProbeCache>,
    pub events: Arc<dyn RelayEventSink>,
}

/// Manages shared upstream relay sessions
#[derive(Clone)]
pub struct RelaySessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: RelayConfig,
    relay_profiles: HashMap<String, RelayProfileConfig>,
    resolver: Arc<dyn ChannelResolver>,
    fetcher: Arc<dyn UpstreamFetcher>,
    circuit_breakers: CircuitBreakerManager,
    classifier: Arc<StreamClassifier>,
    codec_cache: Arc<CodecProbeCache>,
    events: Arc<dyn RelayEventSink>,
    registry: Mutex<SessionRegistry>,
}

#[derive(Default)]
struct SessionRegistry {
    by_key: HashMap<RelaySessionKey, Arc<RelaySession>>,
    by_id: HashMap<Uuid, Arc<RelaySession>>,
}

impl SessionRegistry {
    fn joinable(&self, key: &RelaySessionKey) -> Option<Arc<RelaySession>> {
        self.by_key
            .get(key)
            .filter(|session| session.state().accepts_clients())
            .cloned()
    }

    fn insert(&mut self, session: Arc<RelaySession>) {
        self.by_id.insert(session.id, session.clone());
        self.by_key.insert(session.key.clone(), session);
    }

    /// Remove a session; a newer session under the same key is left alone
    fn remove(&mut self, session: &Arc<RelaySession>) {
        if self
            .by_key
            .get(&session.key)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            self.by_key.remove(&session.key);
        }
        self.by_id.remove(&session.id);
    }
}

#[derive(Debug, Clone)]
struct SessionStatus {
    state: RelaySessionState,
    failure: Option<RelayError>,
}

struct ClientEntry {
    user_agent: Option<String>,
    remote_addr: Option<String>,
    connected_at: DateTime<Utc>,
    buffer: Arc<ClientBuffer>,
}

struct ClientTable {
    clients: HashMap<Uuid, ClientEntry>,
    /// Chunks received before the first client attached
    prelude: Option<VecDeque<Bytes>>,
    closed: bool,
    /// Bumped on every attach and drain start; a drain timer only fires for its own generation
    drain_generation: u64,
    last_activity: DateTime<Utc>,
    /// Drops counted by clients that have since detached
    detached_drops: u64,
}

#[derive(Default)]
struct SessionDetails {
    upstream_url: Option<String>,
    service_name: Option<String>,
    transport: Option<&'static str>,
    classification: Option<ClassificationResult>,
    codec_info: Option<CodecInfo>,
}

struct RelaySession {
    id: Uuid,
    key: RelaySessionKey,
    created_at: DateTime<Utc>,
    status: watch::Sender<SessionStatus>,
    clients: Mutex<ClientTable>,
    details: Mutex<SessionDetails>,
    cancel: CancellationToken,
    torn_down: AtomicBool,
    bytes_received: AtomicU64,
    chunks_received: AtomicU64,
    reconnects: AtomicU32,
}

impl RelaySession {
    fn new(key: RelaySessionKey) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: RelaySessionState::Starting,
            failure: None,
        });
        Self {
            id: Uuid::new_v4(),
            key,
            created_at: Utc::now(),
            status,
            clients: Mutex::new(ClientTable {
                clients: HashMap::new(),
                prelude: Some(VecDeque::new()),
                closed: false,
                drain_generation: 0,
                last_activity: Utc::now(),
                detached_drops: 0,
            }),
            details: Mutex::new(SessionDetails::default()),
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
            chunks_received: AtomicU64::new(0),
            reconnects: AtomicU32::new(0),
        }
    }

    fn state(&self) -> RelaySessionState {
        self.status.borrow().state
    }

    /// Move between non-terminal states
    fn transition(&self, to: RelaySessionState) -> bool {
        self.status.send_if_modified(|status| {
            if status.state.is_terminal() || status.state == to {
                return false;
            }
            debug!(session_id = %self.id, from = %status.state, to = %to, "Relay session state change");
            status.state = to;
            true
        })
    }

    fn finish(&self, failure: Option<RelayError>) {
        self.status.send_modify(|status| {
            status.state = if failure.is_some() {
                RelaySessionState::Error
            } else {
                RelaySessionState::Stopped
            };
            status.failure = failure;
        });
    }

    fn has_clients(&self) -> bool {
        !self.clients.lock().clients.is_empty()
    }

    fn handle(&self, state: RelaySessionState, joined: bool) -> RelaySessionHandle {
        RelaySessionHandle {
            session_id: self.id,
            channel_id: self.key.channel_id.clone(),
            profile_id: self.key.profile_id.clone(),
            state,
            joined,
        }
    }

    fn info(&self) -> RelaySessionInfo {
        let status = self.status.borrow().clone();
        let (clients, last_activity, detached_drops) = {
            let table = self.clients.lock();
            let clients: Vec<RelayClientInfo> = table
                .clients
                .iter()
                .map(|(id, entry)| RelayClientInfo {
                    id: *id,
                    session_id: self.id,
                    user_agent: entry.user_agent.clone(),
                    remote_addr: entry.remote_addr.clone(),
                    connected_at: entry.connected_at,
                    bytes_delivered: entry.buffer.bytes_delivered(),
                    chunks_dropped: entry.buffer.chunks_dropped(),
                    queued_chunks: entry.buffer.queued(),
                })
                .collect();
            (clients, table.last_activity, table.detached_drops)
        };
        let details = self.details.lock();

        RelaySessionInfo {
            session_id: self.id,
            channel_id: self.key.channel_id.clone(),
            profile_id: self.key.profile_id.clone(),
            state: status.state,
            failure_reason: status.failure.map(|e| e.to_string()),
            upstream_url: details.upstream_url.as_deref().map(UrlUtils::redact),
            service_name: details.service_name.clone(),
            transport: details.transport.map(str::to_string),
            created_at: self.created_at,
            last_activity,
            client_count: clients.len(),
            chunks_dropped: detached_drops + clients.iter().map(|c| c.chunks_dropped).sum::<u64>(),
            clients,
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnects.load(Ordering::Relaxed),
            classification: details.classification.clone(),
            codec_info: details.codec_info.clone(),
        }
    }
}

/// Result of one upstream connection
enum PumpOutcome {
    /// Session cancelled while streaming
    Cancelled,
    /// Upstream closed cleanly after delivering data
    Ended,
    Failed {
        error: UpstreamError,
        delivered: bool,
    },
}

impl RelaySessionManager {
    pub fn new(
        config: RelayConfig,
        relay_profiles: HashMap<String, RelayProfileConfig>,
        deps: RelayDependencies,
    ) -> Self {
        info!(
            drain_grace_period = ?config.drain_grace_period,
            client_buffer_chunks = config.client_buffer_chunks,
            max_reconnect_attempts = config.max_reconnect_attempts,
            relay_profiles = relay_profiles.len(),
            "Relay session manager initialized"
        );
        Self {
            inner: Arc::new(ManagerInner {
                config,
                relay_profiles,
                resolver: deps.resolver,
                fetcher: deps.fetcher,
                circuit_breakers: deps.circuit_breakers,
                classifier: deps.classifier,
                codec_cache: deps.codec_cache,
                events: deps.events,
                registry: Mutex::new(SessionRegistry::default()),
            }),
        }
    }

    /// Join or start the relay session for a channel and optional relay profile.
    ///
    /// Resolves once the session has delivered its first upstream bytes, or
    /// with the reason it could not.
    pub async fn start_relay(
        &self,
        channel_id: &str,
        profile_id: Option<&str>,
    ) -> Result<RelaySessionHandle, RelayError> {
        if let Some(profile_id) = profile_id
            && !self.inner.relay_profiles.contains_key(profile_id)
        {
            return Err(RelayError::ProfileNotFound {
                profile_id: profile_id.to_string(),
            });
        }

        let key = RelaySessionKey::new(channel_id, profile_id);
        let existing = self.inner.registry.lock().joinable(&key);
        if let Some(session) = existing {
            debug!(session_id = %session.id, key = %key, "Joining existing relay session");
            return self.inner.await_started(&session, true).await;
        }

        let candidates = self.inner.resolver.resolve_channel(channel_id).await?;

        let (session, admitted) = {
            let mut registry = self.inner.registry.lock();
            match registry.joinable(&key) {
                Some(session) => (session, None),
                None => {
                    let admitted = self.inner.admit(&candidates, 0)?;
                    let session = Arc::new(RelaySession::new(key.clone()));
                    registry.insert(session.clone());
                    (session, Some(admitted))
                }
            }
        };

        let Some(first) = admitted else {
            debug!(session_id = %session.id, key = %key, "Joining relay session created concurrently");
            return self.inner.await_started(&session, true).await;
        };

        metrics().relay_starts.add(1, &[]);
        metrics().active_relays.add(1, &[]);
        info!(
            session_id = %session.id,
            channel_id = %channel_id,
            profile_id = ?profile_id,
            candidates = candidates.len(),
            "Starting relay session"
        );

        let inner = self.inner.clone();
        let task_session = session.clone();
        tokio::spawn(async move {
            inner.run_session(task_session, candidates, first).await;
        });

        self.inner.await_started(&session, false).await
    }

    /// Attach a client to a session and return its private byte stream
    pub fn add_relay_client(
        &self,
        session_id: Uuid,
        user_agent: Option<String>,
        remote_addr: Option<String>,
    ) -> Result<(RelayClientInfo, RelayByteStream), RelayError> {
        let session = self.inner.session(session_id)?;
        let buffer = Arc::new(ClientBuffer::new(self.inner.config.client_buffer_chunks));
        let client_id = Uuid::new_v4();
        let connected_at = Utc::now();

        let client_count = {
            let mut table = session.clients.lock();
            let state = session.state();
            if table.closed || !state.accepts_clients() {
                return Err(RelayError::SessionUnavailable { session_id, state });
            }

            if let Some(prelude) = table.prelude.take() {
                for chunk in prelude {
                    buffer.push(chunk);
                }
            }
            table.clients.insert(
                client_id,
                ClientEntry {
                    user_agent: user_agent.clone(),
                    remote_addr: remote_addr.clone(),
                    connected_at,
                    buffer: buffer.clone(),
                },
            );
            table.drain_generation += 1;
            table.last_activity = connected_at;

            if state == RelaySessionState::Draining {
                session.transition(RelaySessionState::Active);
                info!(session_id = %session_id, "Client rejoined draining relay session");
            }
            table.clients.len()
        };

        metrics().client_connections.add(1, &[]);
        metrics().active_clients.add(1, &[]);
        info!(
            session_id = %session_id,
            client_id = %client_id,
            remote_addr = ?remote_addr,
            clients = client_count,
            "Relay client attached"
        );
        self.inner.events.publish(RelayEvent::new(
            session_id,
            session.key.channel_id.clone(),
            RelayEventType::ClientConnect,
            remote_addr.clone(),
        ));

        let info = RelayClientInfo {
            id: client_id,
            session_id,
            user_agent,
            remote_addr,
            connected_at,
            bytes_delivered: 0,
            chunks_dropped: 0,
            queued_chunks: buffer.queued(),
        };

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let detach = DetachGuard::new(move || {
            if let Some(inner) = weak.upgrade()
                && let Err(e) = inner.detach_client(session_id, client_id, EndReason::Removed)
                && !e.is_benign_race()
            {
                warn!(session_id = %session_id, client_id = %client_id, error = %e, "Failed to detach relay client");
            }
        });

        Ok((info, RelayByteStream::new(buffer, detach)))
    }

    /// Detach a client. The last client leaving starts the drain grace period.
    pub fn remove_relay_client(&self, session_id: Uuid, client_id: Uuid) -> Result<(), RelayError> {
        self.inner
            .detach_client(session_id, client_id, EndReason::Removed)
    }

    /// Stop a session immediately
    pub fn stop_relay(&self, session_id: Uuid) -> Result<(), RelayError> {
        let session = self.inner.session(session_id)?;
        info!(session_id = %session_id, "Stopping relay session on request");
        self.inner.teardown(&session, None, "stopped on request");
        Ok(())
    }

    pub fn get_session(&self, session_id: Uuid) -> Result<RelaySessionInfo, RelayError> {
        Ok(self.inner.session(session_id)?.info())
    }

    /// Registered sessions, oldest first
    pub fn list_sessions(&self) -> Vec<RelaySessionInfo> {
        let sessions: Vec<_> = self.inner.registry.lock().by_id.values().cloned().collect();
        let mut infos: Vec<_> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn relay_stats(&self) -> RelayStats {
        let mut stats = RelayStats::default();
        for info in self.list_sessions() {
            stats.total_sessions += 1;
            *stats.sessions_by_state.entry(info.state).or_default() += 1;
            stats.total_clients += info.client_count;
            stats.bytes_received += info.bytes_received;
            stats.chunks_dropped += info.chunks_dropped;
        }
        stats
    }

    /// Stop every session; returns how many were stopped
    pub fn shutdown(&self) -> usize {
        let sessions: Vec<_> = self.inner.registry.lock().by_id.values().cloned().collect();
        for session in &sessions {
            self.inner.teardown(session, None, "shutdown");
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Relay sessions stopped for shutdown");
        }
        sessions.len()
    }

    /// Codec information through the probe cache
    pub async fn probe_stream(&self, url: &str) -> Result<CodecInfo, ProbeError> {
        self.inner.codec_cache.probe(url).await
    }

    pub async fn classify_stream(&self, url: &str) -> ClassificationResult {
        self.inner.classifier.classify_stream(url).await
    }

    pub fn codec_cache_stats(&self) -> CodecCacheStats {
        self.inner.codec_cache.stats()
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerManager {
        &self.inner.circuit_breakers
    }

    pub fn codec_cache(&self) -> &Arc<CodecProbeCache> {
        &self.inner.codec_cache
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Periodic debug report of running sessions
    pub fn spawn_status_report_task(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let sessions = manager.list_sessions();
                if sessions.is_empty() {
                    continue;
                }

                debug!("=== Relay Status Report ===");
                debug!("Active relays: {}", sessions.len());
                for session in sessions {
                    debug!(
                        session_id = %session.session_id,
                        channel_id = %session.channel_id,
                        profile_id = ?session.profile_id,
                        state = %session.state,
                        transport = ?session.transport,
                        clients = session.client_count,
                        bytes_received = session.bytes_received,
                        chunks_dropped = session.chunks_dropped,
                        "Relay status"
                    );
                }
                debug!("=== End Relay Status ===");
            }
        })
    }
}

impl ManagerInner {
    fn session(&self, session_id: Uuid) -> Result<Arc<RelaySession>, RelayError> {
        self.registry
            .lock()
            .by_id
            .get(&session_id)
            .cloned()
            .ok_or(RelayError::SessionNotFound { session_id })
    }

    /// First candidate at or after `from` whose breaker admits a call
    fn admit(
        &self,
        candidates: &[UpstreamCandidate],
        from: usize,
    ) -> Result<(usize, CallPermit), RelayError> {
        let mut rejected_service = None;
        for (index, candidate) in candidates.iter().enumerate().skip(from) {
            let breaker = self.circuit_breakers.get_for_url(&candidate.url);
            match breaker.try_acquire() {
                Ok(permit) => return Ok((index, permit)),
                Err(open) => {
                    debug!(service = %open.service, "Skipping upstream candidate with open circuit");
                    rejected_service.get_or_insert(open.service);
                }
            }
        }
        Err(RelayError::CircuitOpen {
            service: rejected_service.unwrap_or_else(|| {
                candidates
                    .first()
                    .map(|c| UrlUtils::service_name(&c.url))
                    .unwrap_or_else(|| "unknown".to_string())
            }),
        })
    }

    async fn await_started(
        &self,
        session: &Arc<RelaySession>,
        joined: bool,
    ) -> Result<RelaySessionHandle, RelayError> {
        let mut rx = session.status.subscribe();
        let waited = tokio::time::timeout(
            self.config.start_timeout,
            rx.wait_for(|status| status.state != RelaySessionState::Starting),
        )
        .await;

        let status = match waited {
            Ok(Ok(status)) => status.clone(),
            Ok(Err(_)) => {
                return Err(RelayError::SessionUnavailable {
                    session_id: session.id,
                    state: session.state(),
                });
            }
            Err(_) => {
                let error = RelayError::StartTimeout {
                    channel_id: session.key.channel_id.clone(),
                    timeout: self.config.start_timeout,
                };
                warn!(session_id = %session.id, timeout = ?self.config.start_timeout, "Relay session did not start in time");
                self.teardown(session, Some(error.clone()), "start timeout");
                return Err(error);
            }
        };

        match status.state {
            RelaySessionState::Starting | RelaySessionState::Active | RelaySessionState::Draining => {
                Ok(session.handle(status.state, joined))
            }
            RelaySessionState::Error => Err(status.failure.unwrap_or_else(|| {
                RelayError::upstream_fetch(
                    session.key.channel_id.clone(),
                    "relay session failed before start",
                )
            })),
            RelaySessionState::Stopped => Err(RelayError::SessionUnavailable {
                session_id: session.id,
                state: status.state,
            }),
        }
    }

    async fn run_session(
        self: Arc<Self>,
        session: Arc<RelaySession>,
        candidates: Vec<UpstreamCandidate>,
        first: (usize, CallPermit),
    ) {
        match self.pump(&session, &candidates, first).await {
            Ok(reason) => self.teardown(&session, None, reason),
            Err(error) => {
                warn!(session_id = %session.id, error = %error, "Relay session failed");
                self.teardown(&session, Some(error), "upstream failure");
            }
        }
    }

    /// Upstream loop: connect, stream, fail over before start, reconnect after
    async fn pump(
        self: &Arc<Self>,
        session: &Arc<RelaySession>,
        candidates: &[UpstreamCandidate],
        first: (usize, CallPermit),
    ) -> Result<&'static str, RelayError> {
        let mut next = Some(first);
        let mut prepared: HashMap<String, UpstreamRequest> = HashMap::new();
        let mut reconnects = 0u32;

        loop {
            let (index, permit) = match next.take() {
                Some(admitted) => admitted,
                None => self.admit(candidates, 0)?,
            };
            let candidate = &candidates[index];

            let request = match prepared.get(&candidate.url) {
                Some(request) => request.clone(),
                None => {
                    let request = tokio::select! {
                        _ = session.cancel.cancelled() => return Ok("cancelled"),
                        request = self.prepare_request(session, candidate) => request,
                    };
                    prepared.insert(candidate.url.clone(), request.clone());
                    request
                }
            };
            {
                let mut details = session.details.lock();
                details.upstream_url = Some(request.url.clone());
                details.service_name = Some(request.service_name.clone());
                details.transport = Some(request.transport.label());
            }

            let (error, delivered) = match self.stream_upstream(session, &request, permit).await {
                PumpOutcome::Cancelled => return Ok("cancelled"),
                PumpOutcome::Ended => {
                    info!(session_id = %session.id, "Upstream ended");
                    return Ok("upstream ended");
                }
                PumpOutcome::Failed { error, delivered } => (error, delivered),
            };
            let relay_error = RelayError::upstream_fetch(&request.service_name, error.to_string());

            if session.state() == RelaySessionState::Starting {
                match self.admit(candidates, index + 1) {
                    Ok(admitted) => {
                        warn!(
                            session_id = %session.id,
                            error = %error,
                            next_url = %UrlUtils::redact(&candidates[admitted.0].url),
                            "Upstream failed before start, trying next source"
                        );
                        next = Some(admitted);
                        continue;
                    }
                    Err(_) => return Err(relay_error),
                }
            }

            if delivered {
                reconnects = 0;
            }
            if !session.has_clients() {
                debug!(session_id = %session.id, error = %error, "Upstream failed with no clients attached");
                return Err(relay_error);
            }
            if reconnects >= self.config.max_reconnect_attempts {
                warn!(
                    session_id = %session.id,
                    attempts = reconnects,
                    error = %error,
                    "Upstream reconnect attempts exhausted"
                );
                return Err(relay_error);
            }

            reconnects += 1;
            session.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics().relay_reconnects.add(1, &[]);
            warn!(
                session_id = %session.id,
                attempt = reconnects,
                max_attempts = self.config.max_reconnect_attempts,
                error = %error,
                "Upstream interrupted, reconnecting"
            );
            self.events.publish(RelayEvent::new(
                session.id,
                session.key.channel_id.clone(),
                RelayEventType::Reconnect,
                Some(error.to_string()),
            ));

            tokio::select! {
                _ = session.cancel.cancelled() => return Ok("cancelled"),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    async fn prepare_request(
        &self,
        session: &Arc<RelaySession>,
        candidate: &UpstreamCandidate,
    ) -> UpstreamRequest {
        let profile = session
            .key
            .profile_id
            .as_deref()
            .and_then(|id| self.relay_profiles.get(id));

        let classification = if self.config.classify_before_start {
            Some(self.classifier.classify_stream(&candidate.url).await)
        } else {
            None
        };

        if self.config.probe_before_start {
            match self.codec_cache.probe(&candidate.url).await {
                Ok(codec_info) => session.details.lock().codec_info = Some(codec_info),
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Codec probe failed, relaying without codec info")
                }
            }
        }

        let transport = UpstreamTransport::select(classification.as_ref(), profile);
        debug!(
            session_id = %session.id,
            url = %UrlUtils::redact(&candidate.url),
            transport = transport.label(),
            "Upstream transport selected"
        );
        session.details.lock().classification = classification;

        UpstreamRequest {
            service_name: UrlUtils::service_name(&candidate.url),
            url: candidate.url.clone(),
            transport,
        }
    }

    /// One upstream connection. The permit is completed by the first chunk or
    /// by the failure that prevented it; later failures are recorded directly.
    async fn stream_upstream(
        self: &Arc<Self>,
        session: &Arc<RelaySession>,
        request: &UpstreamRequest,
        permit: CallPermit,
    ) -> PumpOutcome {
        let breaker = self.circuit_breakers.get_or_create(&request.service_name);
        let connect_timeout = self.config.upstream_connect_timeout;
        let read_timeout = self.config.upstream_read_timeout;

        let opened = tokio::select! {
            _ = session.cancel.cancelled() => return PumpOutcome::Cancelled,
            opened = tokio::time::timeout(connect_timeout, self.fetcher.open(request)) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                permit.record(error.outcome());
                return PumpOutcome::Failed {
                    error,
                    delivered: false,
                };
            }
            Err(_) => {
                let error = UpstreamError::Timeout(connect_timeout);
                permit.record(error.outcome());
                return PumpOutcome::Failed {
                    error,
                    delivered: false,
                };
            }
        };

        let mut permit = Some(permit);
        let mut delivered = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return PumpOutcome::Cancelled,
                next = tokio::time::timeout(read_timeout, stream.next()) => next,
            };

            let error = match next {
                Ok(Some(Ok(chunk))) => {
                    if let Some(permit) = permit.take() {
                        permit.record(CallOutcome::Success);
                    }
                    if !delivered {
                        delivered = true;
                        self.mark_active(session);
                    }
                    self.fan_out(session, chunk);
                    continue;
                }
                Ok(Some(Err(error))) => error,
                Ok(None) if delivered => return PumpOutcome::Ended,
                Ok(None) => UpstreamError::Stream("upstream closed before sending data".to_string()),
                Err(_) => UpstreamError::Timeout(read_timeout),
            };

            record_failure(permit.take(), &breaker, &error);
            return PumpOutcome::Failed { error, delivered };
        }
    }

    fn mark_active(self: &Arc<Self>, session: &Arc<RelaySession>) {
        let teardown_now = {
            let mut table = session.clients.lock();
            if session.state() != RelaySessionState::Starting {
                return;
            }
            session.transition(RelaySessionState::Active);
            table.clients.is_empty() && !self.begin_drain(session, &mut table)
        };

        info!(session_id = %session.id, channel_id = %session.key.channel_id, "Relay session active");
        self.events.publish(RelayEvent::new(
            session.id,
            session.key.channel_id.clone(),
            RelayEventType::Start,
            session.details.lock().transport.map(str::to_string),
        ));
        if teardown_now {
            self.teardown(session, None, "no clients");
        }
    }

    fn fan_out(&self, session: &RelaySession, chunk: Bytes) {
        let len = chunk.len() as u64;
        session.bytes_received.fetch_add(len, Ordering::Relaxed);
        session.chunks_received.fetch_add(1, Ordering::Relaxed);
        metrics().bytes_received.add(len, &[]);

        let mut dropped = 0u64;
        {
            let mut table = session.clients.lock();
            table.last_activity = Utc::now();
            if table.clients.is_empty() {
                let capacity = self.config.client_buffer_chunks.max(1);
                if let Some(prelude) = table.prelude.as_mut() {
                    if prelude.len() >= capacity {
                        prelude.pop_front();
                    }
                    prelude.push_back(chunk);
                }
                return;
            }
            for entry in table.clients.values() {
                if entry.buffer.push(chunk.clone()) {
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            metrics().chunks_dropped.add(dropped, &[]);
            trace!(session_id = %session.id, dropped, "Dropped oldest chunks for slow clients");
        }
    }

    fn detach_client(
        self: &Arc<Self>,
        session_id: Uuid,
        client_id: Uuid,
        reason: EndReason,
    ) -> Result<(), RelayError> {
        let session = self.session(session_id)?;

        let (remaining, teardown_now) = {
            let mut table = session.clients.lock();
            let entry = table
                .clients
                .remove(&client_id)
                .ok_or(RelayError::ClientNotFound {
                    session_id,
                    client_id,
                })?;
            entry.buffer.close(reason);
            table.detached_drops += entry.buffer.chunks_dropped();
            table.last_activity = Utc::now();

            let teardown_now =
                table.clients.is_empty() && !table.closed && !self.begin_drain(&session, &mut table);
            (table.clients.len(), teardown_now)
        };

        metrics().active_clients.add(-1, &[]);
        info!(
            session_id = %session_id,
            client_id = %client_id,
            clients = remaining,
            "Relay client detached"
        );
        self.events.publish(RelayEvent::new(
            session_id,
            session.key.channel_id.clone(),
            RelayEventType::ClientDisconnect,
            None,
        ));

        if teardown_now {
            self.teardown(&session, None, "no clients");
        }
        Ok(())
    }

    /// Start (or restart) the drain grace period. Returns `false` when no
    /// runtime is available to wait on, in which case the caller tears down.
    fn begin_drain(self: &Arc<Self>, session: &Arc<RelaySession>, table: &mut ClientTable) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        table.drain_generation += 1;
        let generation = table.drain_generation;
        if session.state() == RelaySessionState::Active {
            session.transition(RelaySessionState::Draining);
        }

        let grace = self.config.drain_grace_period;
        info!(session_id = %session.id, grace_period = ?grace, "Relay session draining");

        let inner = self.clone();
        let session = session.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => inner.finish_drain(&session, generation),
            }
        });
        true
    }

    fn finish_drain(&self, session: &Arc<RelaySession>, generation: u64) {
        let expired = {
            let table = session.clients.lock();
            table.drain_generation == generation && table.clients.is_empty() && !table.closed
        };
        if expired {
            info!(session_id = %session.id, "Drain grace period elapsed");
            self.teardown(session, None, "drain grace period elapsed");
        }
    }

    /// Stop a session. Runs once; later calls are no-ops.
    fn teardown(&self, session: &Arc<RelaySession>, failure: Option<RelayError>, reason: &str) {
        if session.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        session.cancel.cancel();

        let end = match &failure {
            Some(error) => EndReason::SessionFailed(error.to_string()),
            None => EndReason::SessionStopped,
        };
        let closed_clients = {
            let mut table = session.clients.lock();
            table.closed = true;
            table.prelude = None;
            let entries: Vec<ClientEntry> = table.clients.drain().map(|(_, entry)| entry).collect();
            for entry in &entries {
                entry.buffer.close(end.clone());
                table.detached_drops += entry.buffer.chunks_dropped();
            }
            session.finish(failure.clone());
            entries.len()
        };

        self.registry.lock().remove(session);

        metrics().active_relays.add(-1, &[]);
        metrics().active_clients.add(-(closed_clients as i64), &[]);
        let (event_type, details) = match &failure {
            Some(error) => {
                metrics().relay_errors.add(1, &[]);
                warn!(
                    session_id = %session.id,
                    channel_id = %session.key.channel_id,
                    error = %error,
                    clients = closed_clients,
                    "Relay session ended with error"
                );
                (RelayEventType::Error, error.to_string())
            }
            None => {
                metrics().relay_stops.add(1, &[]);
                info!(
                    session_id = %session.id,
                    channel_id = %session.key.channel_id,
                    reason = reason,
                    clients = closed_clients,
                    bytes_received = session.bytes_received.load(Ordering::Relaxed),
                    "Relay session stopped"
                );
                (RelayEventType::Stop, reason.to_string())
            }
        };
        self.events.publish(RelayEvent::new(
            session.id,
            session.key.channel_id.clone(),
            event_type,
            Some(details),
        ));
    }
}

fn record_failure(permit: Option<CallPermit>, breaker: &CircuitBreaker, error: &UpstreamError) {
    match permit {
        Some(permit) => permit.record(error.outcome()),
        None => breaker.record_outcome(error.outcome()),
    }
}
