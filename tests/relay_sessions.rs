//! Relay session scenarios against a scripted upstream, on a paused clock

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use m3u_relay::config::{
    ChannelConfig, ChannelSourceConfig, CircuitBreakerConfig, CircuitBreakerProfile,
    ClassificationConfig, RelayConfig,
};
use m3u_relay::errors::{ProbeError, RelayError};
use m3u_relay::models::relay::{EndReason, RelayEventType, RelaySessionState};
use m3u_relay::services::upstream::{UpstreamError, UpstreamRequest, UpstreamStream};
use m3u_relay::services::{
    BroadcastEventSink, CircuitBreakerManager, CodecInfo, CodecProbeCache, DefaultUpstreamFetcher,
    MediaProber, RelayDependencies, RelaySessionManager, StaticChannelResolver, UpstreamFetcher,
};
use m3u_relay::streaming::{
    ClassificationError, ClassificationPolicy, CollapsingError, HlsFetcher, ManifestFetcher,
    StreamClassifier,
};
use m3u_relay::streaming::classification::FetchedManifest;
use m3u_relay::utils::CircuitBreakerState;

/// Serves `initial` on every open, then whatever the test pushes.
/// URLs containing "bad" (or every URL while `failing`) are refused with 503.
#[derive(Default)]
struct ScriptedUpstream {
    initial: Vec<Bytes>,
    failing: AtomicBool,
    opens: AtomicUsize,
    opened_urls: Mutex<Vec<String>>,
    releases: Arc<AtomicUsize>,
    senders: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
}

struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScriptedUpstream {
    fn serving(chunks: &[&'static [u8]]) -> Arc<Self> {
        Arc::new(Self {
            initial: chunks.iter().map(|c| Bytes::from_static(c)).collect(),
            ..Default::default()
        })
    }

    fn push(&self, chunk: &'static [u8]) {
        for sender in self.senders.lock().iter() {
            let _ = sender.send(Bytes::from_static(chunk));
        }
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamFetcher for ScriptedUpstream {
    async fn open(&self, request: &UpstreamRequest) -> Result<UpstreamStream, UpstreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.opened_urls.lock().push(request.url.clone());
        if self.failing.load(Ordering::SeqCst) || request.url.contains("bad") {
            return Err(UpstreamError::Status(503));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        for chunk in &self.initial {
            let _ = tx.send(chunk.clone());
        }
        self.senders.lock().push(tx);
        let guard = ReleaseGuard(self.releases.clone());
        Ok(async_stream::stream! {
            let _guard = guard;
            while let Some(chunk) = rx.recv().await {
                yield Ok(chunk);
            }
        }
        .boxed())
    }
}

struct Offline;

#[async_trait]
impl ManifestFetcher for Offline {
    async fn fetch_manifest(
        &self,
        url: &str,
        _max_bytes: usize,
    ) -> Result<FetchedManifest, ClassificationError> {
        Err(ClassificationError::Fetch {
            url: url.to_string(),
            message: "offline".to_string(),
        })
    }
}

#[async_trait]
impl MediaProber for Offline {
    async fn probe(&self, url: &str) -> Result<CodecInfo, ProbeError> {
        Err(ProbeError::failed(url, "offline"))
    }
}

fn channel(id: &str, urls: &[&str]) -> ChannelConfig {
    ChannelConfig {
        id: id.to_string(),
        name: None,
        sources: urls
            .iter()
            .enumerate()
            .map(|(i, url)| ChannelSourceConfig {
                url: url.to_string(),
                priority: i as i32,
            })
            .collect(),
    }
}

struct Harness {
    manager: RelaySessionManager,
    upstream: Arc<ScriptedUpstream>,
    events: BroadcastEventSink,
}

fn harness(upstream: Arc<ScriptedUpstream>, relay: RelayConfig) -> Harness {
    let channels = [
        channel("news", &["http://primary.example.com/news.ts"]),
        channel(
            "sports",
            &["http://bad.example.com/sports.ts", "http://good.example.com/sports.ts"],
        ),
    ];
    let events = BroadcastEventSink::new(256);
    let deps = RelayDependencies {
        resolver: Arc::new(StaticChannelResolver::new(&channels)),
        fetcher: upstream.clone(),
        circuit_breakers: CircuitBreakerManager::new(CircuitBreakerConfig {
            global: CircuitBreakerProfile {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(30),
                half_open_max: 1,
                ..Default::default()
            },
            profiles: HashMap::new(),
        }),
        classifier: Arc::new(StreamClassifier::new(
            Arc::new(Offline),
            ClassificationPolicy::from(&ClassificationConfig::default()),
        )),
        codec_cache: Arc::new(CodecProbeCache::new(
            Arc::new(Offline),
            Duration::from_secs(300),
            Duration::from_secs(30),
        )),
        events: Arc::new(events.clone()),
    };
    Harness {
        manager: RelaySessionManager::new(relay, HashMap::new(), deps),
        upstream,
        events,
    }
}

fn relay_config() -> RelayConfig {
    RelayConfig {
        classify_before_start: false,
        client_buffer_chunks: 4,
        drain_grace_period: Duration::from_secs(10),
        start_timeout: Duration::from_secs(5),
        reconnect_delay: Duration::from_millis(200),
        upstream_read_timeout: Duration::from_secs(120),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_share_one_upstream() {
    let h = harness(ScriptedUpstream::serving(&[b"first"]), relay_config());

    let (a, b) = tokio::join!(
        h.manager.start_relay("news", None),
        h.manager.start_relay("news", None)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.session_id, b.session_id);
    assert!(!a.joined);
    assert!(b.joined);
    assert_eq!(h.upstream.opens(), 1);
    assert_eq!(h.manager.list_sessions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_client_only_loses_its_own_data() {
    let h = harness(ScriptedUpstream::serving(&[b"init"]), relay_config());
    let handle = h.manager.start_relay("news", None).await.unwrap();

    let (_, mut fast) = h.manager.add_relay_client(handle.session_id, None, None).unwrap();
    let (_, mut slow) = h.manager.add_relay_client(handle.session_id, None, None).unwrap();
    assert_eq!(fast.next().await, Some(Bytes::from_static(b"init")));

    let chunks: [&'static [u8]; 10] = [b"0", b"1", b"2", b"3", b"4", b"5", b"6", b"7", b"8", b"9"];
    for chunk in chunks {
        h.upstream.push(chunk);
        assert_eq!(fast.next().await, Some(Bytes::from_static(chunk)));
    }

    assert_eq!(fast.chunks_dropped(), 0);
    assert_eq!(slow.chunks_dropped(), 6);
    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(slow.next().await.unwrap());
    }
    assert_eq!(received, vec![
        Bytes::from_static(b"6"),
        Bytes::from_static(b"7"),
        Bytes::from_static(b"8"),
        Bytes::from_static(b"9"),
    ]);

    let info = h.manager.get_session(handle.session_id).unwrap();
    assert_eq!(info.chunks_dropped, 6);
    assert_eq!(info.chunks_received, 11);
}

#[tokio::test(start_paused = true)]
async fn rejoin_within_grace_period_reuses_upstream() {
    let h = harness(ScriptedUpstream::serving(&[b"x"]), relay_config());
    let handle = h.manager.start_relay("news", None).await.unwrap();

    let (_, stream) = h.manager.add_relay_client(handle.session_id, None, None).unwrap();
    drop(stream);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let info = h.manager.get_session(handle.session_id).unwrap();
    assert_eq!(info.state, RelaySessionState::Draining);
    assert_eq!(info.client_count, 0);

    let rejoined = h.manager.start_relay("news", None).await.unwrap();
    assert_eq!(rejoined.session_id, handle.session_id);
    let (_, mut stream) = h.manager.add_relay_client(handle.session_id, None, None).unwrap();
    assert_eq!(
        h.manager.get_session(handle.session_id).unwrap().state,
        RelaySessionState::Active
    );

    // the first drain timer must not stop the revived session
    tokio::time::sleep(Duration::from_secs(8)).await;
    h.upstream.push(b"y");
    assert_eq!(stream.next().await, Some(Bytes::from_static(b"y")));
    assert_eq!(h.upstream.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn drain_expiry_stops_session_and_releases_upstream_once() {
    let h = harness(ScriptedUpstream::serving(&[b"x"]), relay_config());
    let mut events = h.events.subscribe();
    let handle = h.manager.start_relay("news", None).await.unwrap();

    let (client, stream) = h.manager.add_relay_client(handle.session_id, None, None).unwrap();
    h.manager
        .remove_relay_client(handle.session_id, client.id)
        .unwrap();
    assert_eq!(stream.end_reason(), Some(EndReason::Removed));
    // dropping after an explicit removal is a no-op
    drop(stream);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(matches!(
        h.manager.get_session(handle.session_id),
        Err(RelayError::SessionNotFound { .. })
    ));
    assert_eq!(h.upstream.releases(), 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert_eq!(seen, vec![
        RelayEventType::Start,
        RelayEventType::ClientConnect,
        RelayEventType::ClientDisconnect,
        RelayEventType::Stop,
    ]);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_rejects_without_contacting_upstream() {
    let upstream = ScriptedUpstream::serving(&[b"x"]);
    upstream.failing.store(true, Ordering::SeqCst);
    let h = harness(upstream, relay_config());

    for _ in 0..2 {
        let err = h.manager.start_relay("news", None).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamFetch { .. }), "{err}");
    }
    assert_eq!(h.upstream.opens(), 2);

    let err = h.manager.start_relay("news", None).await.unwrap_err();
    assert_eq!(
        err,
        RelayError::CircuitOpen {
            service: "primary.example.com".to_string()
        }
    );
    assert_eq!(h.upstream.opens(), 2);
    assert!(h.manager.list_sessions().is_empty());

    let stats = h.manager.circuit_breakers().get_all_stats();
    assert_eq!(stats["primary.example.com"].state, CircuitBreakerState::Open);
    assert_eq!(stats["primary.example.com"].rejected_requests, 1);

    // after the reset timeout a trial goes through and closes the circuit
    h.upstream.failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(31)).await;
    h.manager.start_relay("news", None).await.unwrap();
    assert_eq!(h.upstream.opens(), 3);
    assert_eq!(
        h.manager.circuit_breakers().get_all_stats()["primary.example.com"].state,
        CircuitBreakerState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn start_fails_over_to_next_candidate() {
    let h = harness(ScriptedUpstream::serving(&[b"x"]), relay_config());

    let handle = h.manager.start_relay("sports", None).await.unwrap();
    let info = h.manager.get_session(handle.session_id).unwrap();
    assert_eq!(info.service_name.as_deref(), Some("good.example.com"));
    assert_eq!(
        *h.upstream.opened_urls.lock(),
        vec![
            "http://bad.example.com/sports.ts".to_string(),
            "http://good.example.com/sports.ts".to_string(),
        ]
    );

    let stats = h.manager.circuit_breakers().get_all_stats();
    assert_eq!(stats["bad.example.com"].failed_requests, 1);
    assert_eq!(stats["good.example.com"].successful_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn silent_upstream_times_out_start() {
    let h = harness(ScriptedUpstream::serving(&[]), relay_config());

    let err = h.manager.start_relay("news", None).await.unwrap_err();
    assert!(matches!(err, RelayError::StartTimeout { .. }), "{err}");
    assert!(h.manager.list_sessions().is_empty());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.upstream.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_relay_ends_every_client() {
    let h = harness(ScriptedUpstream::serving(&[b"x"]), relay_config());
    let handle = h.manager.start_relay("news", None).await.unwrap();
    let (_, mut a) = h.manager.add_relay_client(handle.session_id, None, None).unwrap();
    let (_, mut b) = h.manager.add_relay_client(handle.session_id, None, None).unwrap();

    h.manager.stop_relay(handle.session_id).unwrap();

    assert_eq!(a.next().await, Some(Bytes::from_static(b"x")));
    assert_eq!(a.next().await, None);
    assert_eq!(b.next().await, None);
    assert_eq!(a.end_reason(), Some(EndReason::SessionStopped));
    assert_eq!(h.manager.relay_stats().total_sessions, 0);
}

const HLS_URL: &str = "http://hls.example.com/live/index.m3u8";
const LIVE_SNAPSHOT: &str =
    "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2,\na.ts\n";
const FINAL_SNAPSHOT: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2,\na.ts\n#EXTINF:2,\nb.ts\n#EXT-X-ENDLIST\n";

/// HLS origin: one live snapshot, then the finished playlist
#[derive(Default)]
struct HlsOrigin {
    playlist_polls: AtomicUsize,
}

#[async_trait]
impl ManifestFetcher for HlsOrigin {
    async fn fetch_manifest(
        &self,
        url: &str,
        _max_bytes: usize,
    ) -> Result<FetchedManifest, ClassificationError> {
        Ok(FetchedManifest {
            final_url: url.to_string(),
            content_type: Some("application/vnd.apple.mpegurl".to_string()),
            body: LIVE_SNAPSHOT.to_string(),
        })
    }
}

#[async_trait]
impl HlsFetcher for HlsOrigin {
    async fn fetch_playlist(
        &self,
        _url: &str,
        _timeout: Duration,
        _max_bytes: usize,
    ) -> Result<String, CollapsingError> {
        match self.playlist_polls.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(LIVE_SNAPSHOT.to_string()),
            _ => Ok(FINAL_SNAPSHOT.to_string()),
        }
    }

    async fn fetch_segment(&self, url: &str, _timeout: Duration) -> Result<Bytes, CollapsingError> {
        match url {
            "http://hls.example.com/live/a.ts" => Ok(Bytes::from_static(b"seg-a")),
            "http://hls.example.com/live/b.ts" => Ok(Bytes::from_static(b"seg-b")),
            _ => Err(CollapsingError::SegmentFetch("HTTP 404 Not Found".to_string())),
        }
    }
}

/// Counts opens on the real fetcher
struct CountingFetcher {
    inner: DefaultUpstreamFetcher,
    opens: AtomicUsize,
}

#[async_trait]
impl UpstreamFetcher for CountingFetcher {
    async fn open(&self, request: &UpstreamRequest) -> Result<UpstreamStream, UpstreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(request).await
    }
}

#[tokio::test(start_paused = true)]
async fn collapsed_hls_ending_cleanly_stops_session() {
    let origin = Arc::new(HlsOrigin::default());
    let relay = RelayConfig {
        classify_before_start: true,
        ..relay_config()
    };
    let fetcher = Arc::new(CountingFetcher {
        inner: DefaultUpstreamFetcher::new(reqwest::Client::new(), &relay)
            .with_hls_fetcher(origin.clone()),
        opens: AtomicUsize::new(0),
    });
    let events = BroadcastEventSink::new(64);
    let mut received_events = events.subscribe();
    let deps = RelayDependencies {
        resolver: Arc::new(StaticChannelResolver::new(&[channel("hls", &[HLS_URL])])),
        fetcher: fetcher.clone(),
        circuit_breakers: CircuitBreakerManager::new(CircuitBreakerConfig::default()),
        classifier: Arc::new(StreamClassifier::new(
            origin.clone(),
            ClassificationPolicy::default(),
        )),
        codec_cache: Arc::new(CodecProbeCache::new(
            Arc::new(Offline),
            Duration::from_secs(300),
            Duration::from_secs(30),
        )),
        events: Arc::new(events.clone()),
    };
    let manager = RelaySessionManager::new(relay, HashMap::new(), deps);

    let handle = manager.start_relay("hls", None).await.unwrap();
    let (_, mut client) = manager.add_relay_client(handle.session_id, None, None).unwrap();
    assert_eq!(
        manager.get_session(handle.session_id).unwrap().transport.as_deref(),
        Some("collapse")
    );

    assert_eq!(client.next().await, Some(Bytes::from_static(b"seg-a")));
    assert_eq!(client.next().await, Some(Bytes::from_static(b"seg-b")));
    let end = tokio::time::timeout(Duration::from_secs(60), client.next()).await;
    assert_eq!(end, Ok(None));
    assert_eq!(client.end_reason(), Some(EndReason::SessionStopped));

    assert!(matches!(
        manager.get_session(handle.session_id),
        Err(RelayError::SessionNotFound { .. })
    ));
    assert_eq!(fetcher.opens.load(Ordering::SeqCst), 1);
    assert_eq!(origin.playlist_polls.load(Ordering::SeqCst), 2);

    let stats = &manager.circuit_breakers().get_all_stats()["hls.example.com"];
    assert_eq!(stats.state, CircuitBreakerState::Closed);
    assert_eq!(stats.failed_requests, 0);

    let mut seen = Vec::new();
    while let Ok(event) = received_events.try_recv() {
        seen.push(event.event_type);
    }
    assert!(!seen.contains(&RelayEventType::Reconnect), "{seen:?}");
    assert_eq!(seen.last(), Some(&RelayEventType::Stop));
}
