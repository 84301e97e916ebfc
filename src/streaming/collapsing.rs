/*!
 * Collapsed single-rendition HLS -> continuous MPEG-TS
 *
 * Polls one media playlist, fetches segments it has not emitted yet and
 * yields their bytes in order as a single stream. Only clear MPEG-TS
 * renditions reach this path; encrypted and fMP4 playlists are filtered out
 * by classification first.
 *
 * Dedup prefers `EXT-X-MEDIA-SEQUENCE` numbering and falls back to segment
 * URIs when the playlist carries no sequence. The poll loop starts lazily on
 * the first poll of the returned handle and stops when the handle is dropped.
 */

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use rand::{Rng, rng};
use std::{
    collections::HashSet,
    ops::Range,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::observability::metrics;
use crate::utils::url::UrlUtils;

const DEFAULT_CHANNEL_BUFFER: usize = 4;

/// Minimum poll interval guard
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(800);

/// Consecutive playlist fetch failures before the session aborts
pub const MAX_PLAYLIST_ERRORS: usize = 6;

/// Consecutive segment fetch failures before the session aborts
pub const MAX_SEGMENT_ERRORS: usize = 6;

const PLAYLIST_RETRY_DELAY: Duration = Duration::from_millis(500);

const DEFAULT_TARGET_DURATION_FALLBACK: f32 = 6.0;

#[derive(Debug, Clone)]
pub struct CollapsingConfig {
    /// Buffered segment bodies between the poll loop and the consumer
    pub channel_buffer: usize,
    pub playlist_timeout: Duration,
    pub segment_timeout: Duration,
    pub max_playlist_bytes: usize,
}

impl Default for CollapsingConfig {
    fn default() -> Self {
        Self {
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            playlist_timeout: Duration::from_secs(5),
            segment_timeout: Duration::from_secs(10),
            max_playlist_bytes: 256 * 1024,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CollapsingError {
    #[error("Playlist fetch failed: {0}")]
    PlaylistFetch(String),
    #[error("Segment fetch failed: {0}")]
    SegmentFetch(String),
    #[error("Invalid media playlist: {0}")]
    InvalidPlaylist(String),
}

/// Playlist and segment retrieval used by the poll loop
#[async_trait]
pub trait HlsFetcher: Send + Sync {
    async fn fetch_playlist(
        &self,
        url: &str,
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<String, CollapsingError>;

    async fn fetch_segment(&self, url: &str, timeout: Duration) -> Result<Bytes, CollapsingError>;
}

/// reqwest-backed HLS fetcher
#[derive(Debug, Clone)]
pub struct HttpHlsFetcher {
    client: reqwest::Client,
}

impl HttpHlsFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HlsFetcher for HttpHlsFetcher {
    async fn fetch_playlist(
        &self,
        url: &str,
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<String, CollapsingError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CollapsingError::PlaylistFetch(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CollapsingError::PlaylistFetch(format!(
                "HTTP {}",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::with_capacity(8192);
        while let Some(chunk) = stream.next().await {
            let c = chunk.map_err(|e| CollapsingError::PlaylistFetch(e.to_string()))?;
            if buf.len() + c.len() > max_bytes {
                buf.extend_from_slice(&c[..(max_bytes - buf.len())]);
                break;
            }
            buf.extend_from_slice(&c);
        }

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn fetch_segment(&self, url: &str, timeout: Duration) -> Result<Bytes, CollapsingError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CollapsingError::SegmentFetch(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CollapsingError::SegmentFetch(format!(
                "HTTP {}",
                resp.status()
            )));
        }

        resp.bytes()
            .await
            .map_err(|e| CollapsingError::SegmentFetch(e.to_string()))
    }
}

/// Consumer side of a collapsing session.
///
/// The handle holds the only sender until the poll loop starts; the loop then
/// owns it, so the stream ends (`None`) as soon as the loop returns.
pub struct CollapsingHandle {
    rx: mpsc::Receiver<Result<Bytes, CollapsingError>>,
    pending_tx: Option<mpsc::Sender<Result<Bytes, CollapsingError>>>,
    inner: Arc<CollapsingInner>,
}

impl CollapsingHandle {
    /// Request the poll loop to stop (idempotent)
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl Drop for CollapsingHandle {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Stream for CollapsingHandle {
    type Item = Result<Bytes, CollapsingError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        if let Some(tx) = me.pending_tx.take() {
            let inner = me.inner.clone();
            tokio::spawn(async move {
                run_collapsing_loop(inner, tx).await;
            });
            debug!(session_id = %me.inner.session_id, "Activated collapsing session (lazy start)");
        }

        me.rx.poll_recv(cx)
    }
}

struct CollapsingInner {
    fetcher: Arc<dyn HlsFetcher>,
    playlist_url: String,
    cfg: CollapsingConfig,
    cancel: CancellationToken,
    session_id: String,
    initial_target_duration: f32,
}

/// Create a collapsing session for a classified, collapse-eligible media playlist.
///
/// Nothing is fetched until the returned handle is first polled.
pub fn spawn_collapsing_session(
    fetcher: Arc<dyn HlsFetcher>,
    playlist_url: String,
    initial_target_duration: Option<f32>,
    cfg: CollapsingConfig,
) -> CollapsingHandle {
    let (tx, rx) = mpsc::channel(cfg.channel_buffer.max(1));
    let inner = Arc::new(CollapsingInner {
        fetcher,
        playlist_url,
        cfg,
        cancel: CancellationToken::new(),
        session_id: uuid::Uuid::new_v4().to_string(),
        initial_target_duration: initial_target_duration
            .filter(|td| *td > 0.0)
            .unwrap_or(DEFAULT_TARGET_DURATION_FALLBACK),
    });

    CollapsingHandle {
        rx,
        pending_tx: Some(tx),
        inner,
    }
}

/// Segments already emitted, limited to the current playlist window
#[derive(Debug, Default)]
struct SeenSegments {
    sequences: HashSet<u64>,
    uris: HashSet<String>,
}

impl SeenSegments {
    /// Forget everything that slid out of `playlist`. Segments leave a live
    /// window from the front and never come back, so older keys are dead.
    fn retain_window(&mut self, playlist: &ParsedMedia) {
        match playlist.sequence_range() {
            Some(window) => {
                self.sequences.retain(|seq| window.contains(seq));
                self.uris.clear();
            }
            None => {
                let current: HashSet<&str> =
                    playlist.segments.iter().map(String::as_str).collect();
                self.uris.retain(|uri| current.contains(uri.as_str()));
                self.sequences.clear();
            }
        }
    }

    /// True the first time a segment is offered
    fn first_sighting(&mut self, sequence: Option<u64>, uri: &str) -> bool {
        match sequence {
            Some(seq) => self.sequences.insert(seq),
            None => self.uris.insert(uri.to_string()),
        }
    }

    fn len(&self) -> usize {
        self.sequences.len() + self.uris.len()
    }
}

async fn run_collapsing_loop(
    inner: Arc<CollapsingInner>,
    tx: mpsc::Sender<Result<Bytes, CollapsingError>>,
) {
    let mut target_duration = inner.initial_target_duration;

    info!(
        session_id = %inner.session_id,
        playlist_url = %UrlUtils::redact(&inner.playlist_url),
        target_duration = target_duration,
        "Starting collapsing session"
    );

    let mut seen = SeenSegments::default();
    let mut playlist_errors = 0usize;
    let mut segment_errors = 0usize;
    let mut loop_iter = 0u64;

    'poll: while !inner.cancel.is_cancelled() {
        loop_iter += 1;
        let fetch_started = Instant::now();

        let fetched = tokio::select! {
            _ = inner.cancel.cancelled() => break 'poll,
            fetched = inner.fetcher.fetch_playlist(
                &inner.playlist_url,
                inner.cfg.playlist_timeout,
                inner.cfg.max_playlist_bytes,
            ) => fetched,
        };
        let parsed = match fetched.and_then(|text| parse_media_playlist(&text)) {
            Ok(parsed) => {
                playlist_errors = 0;
                parsed
            }
            Err(e) => {
                playlist_errors += 1;
                metrics().collapsing_playlist_errors.add(1, &[]);
                warn!(
                    session_id = %inner.session_id,
                    error = %e,
                    attempt = playlist_errors,
                    "Playlist fetch error"
                );
                if playlist_errors >= MAX_PLAYLIST_ERRORS {
                    let _ = tx
                        .send(Err(CollapsingError::PlaylistFetch(format!(
                            "exceeded playlist retry limit: {e}"
                        ))))
                        .await;
                    break;
                }
                tokio::select! {
                    _ = inner.cancel.cancelled() => {}
                    _ = tokio::time::sleep(PLAYLIST_RETRY_DELAY) => {}
                }
                continue;
            }
        };

        if let Some(td) = parsed.target_duration.filter(|td| *td > 0.0) {
            target_duration = td;
        }
        seen.retain_window(&parsed);

        debug!(
            session_id = %inner.session_id,
            iter = loop_iter,
            segment_count = parsed.segments.len(),
            target_duration = target_duration,
            media_sequence_start = parsed.media_sequence,
            tracked_segments = seen.len(),
            "Parsed media playlist"
        );

        let mut new_any = false;
        for (idx, seg_url) in parsed.segments.iter().enumerate() {
            if inner.cancel.is_cancelled() {
                break 'poll;
            }

            let seq_opt = parsed.sequence_of(idx);
            if !seen.first_sighting(seq_opt, seg_url) {
                continue;
            }
            new_any = true;

            let absolute = UrlUtils::resolve(&inner.playlist_url, seg_url);
            let fetched = tokio::select! {
                _ = inner.cancel.cancelled() => break 'poll,
                fetched = inner.fetcher.fetch_segment(&absolute, inner.cfg.segment_timeout) => fetched,
            };

            match fetched {
                Ok(bytes) => {
                    segment_errors = 0;
                    let len = bytes.len();
                    metrics().collapsing_segments_emitted.add(1, &[]);
                    if tx.send(Ok(bytes)).await.is_err() {
                        debug!(session_id = %inner.session_id, "Consumer dropped; ending collapsing loop");
                        break 'poll;
                    }
                    debug!(
                        session_id = %inner.session_id,
                        segment = %seg_url,
                        sequence = seq_opt,
                        size = len,
                        "Emitted segment"
                    );
                }
                Err(e) => {
                    segment_errors += 1;
                    metrics().collapsing_segment_errors.add(1, &[]);
                    warn!(
                        session_id = %inner.session_id,
                        error = %e,
                        attempt = segment_errors,
                        segment = %seg_url,
                        "Segment fetch error"
                    );
                    if segment_errors >= MAX_SEGMENT_ERRORS {
                        let _ = tx
                            .send(Err(CollapsingError::SegmentFetch(format!(
                                "exceeded segment retry limit: {e}"
                            ))))
                            .await;
                        break 'poll;
                    }
                }
            }
        }

        if parsed.end_list {
            debug!(session_id = %inner.session_id, "Playlist ended (EXT-X-ENDLIST)");
            break;
        }
        if tx.is_closed() {
            break;
        }

        let elapsed = fetch_started.elapsed();
        let interval = poll_interval(target_duration, new_any);
        if interval > elapsed && interval >= MIN_POLL_INTERVAL {
            tokio::select! {
                _ = inner.cancel.cancelled() => break 'poll,
                _ = tokio::time::sleep(interval - elapsed) => {}
            }
        } else {
            tokio::task::yield_now().await;
        }
    }

    info!(session_id = %inner.session_id, "Collapsing session ended");
}

/// Half the target duration, clamped to [800ms, max(target, 1500ms)].
/// Shortened with jitter when the last snapshot had nothing new.
fn poll_interval(target_duration: f32, new_segments: bool) -> Duration {
    let target_ms = target_duration * 1000.0;
    let mut interval_ms = (target_ms * 0.5).clamp(800.0, target_ms.max(1500.0));
    if !new_segments {
        let jitter: f32 = rng().random_range(0.85..1.15);
        interval_ms = (interval_ms * 0.8 * jitter).max(700.0);
    }
    Duration::from_millis(interval_ms as u64)
}

#[derive(Debug)]
struct ParsedMedia {
    segments: Vec<String>,
    target_duration: Option<f32>,
    media_sequence: Option<u64>,
    end_list: bool,
}

impl ParsedMedia {
    /// Sequence numbers covered by this snapshot
    fn sequence_range(&self) -> Option<Range<u64>> {
        let base = self.media_sequence?;
        base.checked_add(self.segments.len() as u64)
            .map(|end| base..end)
    }

    fn sequence_of(&self, idx: usize) -> Option<u64> {
        self.media_sequence
            .and_then(|base| base.checked_add(idx as u64))
    }
}

/// Parse a media playlist snapshot. A media sequence whose window does not
/// fit in `u64` is rejected.
fn parse_media_playlist(text: &str) -> Result<ParsedMedia, CollapsingError> {
    let mut parsed = ParsedMedia {
        segments: Vec::new(),
        target_duration: None,
        media_sequence: None,
        end_list: false,
    };

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(val) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            parsed.target_duration = val.trim().parse::<f32>().ok();
        } else if let Some(val) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            parsed.media_sequence = val.trim().parse::<u64>().ok();
        } else if line.starts_with("#EXT-X-ENDLIST") {
            parsed.end_list = true;
        } else if !line.starts_with('#') {
            parsed.segments.push(line.to_string());
        }
    }

    if let Some(base) = parsed.media_sequence
        && parsed.sequence_range().is_none()
    {
        return Err(CollapsingError::InvalidPlaylist(format!(
            "media sequence {base} overflows with {} segments",
            parsed.segments.len()
        )));
    }
    Ok(parsed)
}
