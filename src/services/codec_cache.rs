//! Codec probe cache
//!
//! TTL cache in front of the external prober. Concurrent requests for the
//! same URL are coalesced: one caller runs the probe, the others await the
//! same `OnceCell`. No lock is held across the probe itself, so unrelated URLs
//! are probed in parallel.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::ProbeError;
use crate::observability::metrics;
use crate::services::stream_prober::{CodecInfo, MediaProber};
use crate::utils::url::UrlUtils;

#[derive(Debug)]
struct CacheEntry {
    result: Result<CodecInfo, ProbeError>,
    created_at: DateTime<Utc>,
    expires_at: Instant,
    hits: AtomicU64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CodecCacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub error_entries: usize,
    /// Cumulative hits, including hits on entries since replaced or purged
    pub hits: u64,
    pub misses: u64,
    pub probes_executed: u64,
    pub in_flight: usize,
}

/// Cached probe outcome as exposed to diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CodecCacheEntryInfo {
    pub url: String,
    pub codec_info: Option<CodecInfo>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_in_secs: u64,
    pub hits: u64,
}

pub struct CodecProbeCache {
    prober: Arc<dyn MediaProber>,
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<Arc<CacheEntry>>>>>,
    ttl: Duration,
    error_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    probes_executed: AtomicU64,
}

impl CodecProbeCache {
    pub fn new(prober: Arc<dyn MediaProber>, ttl: Duration, error_ttl: Duration) -> Self {
        Self {
            prober,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            ttl,
            error_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            probes_executed: AtomicU64::new(0),
        }
    }

    /// Probe a stream, serving a live cached result when one exists
    pub async fn probe(&self, url: &str) -> Result<CodecInfo, ProbeError> {
        let key = UrlUtils::normalize_for_cache(url);

        if let Some(entry) = self.live_entry(&key) {
            entry.hits.fetch_add(1, Ordering::Relaxed);
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics().probe_cache_hits.add(1, &[]);
            return entry.result.clone();
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics().probe_cache_misses.add(1, &[]);

        let cell = self
            .in_flight
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let entry = cell
            .get_or_init(|| self.run_probe(url, &key))
            .await
            .clone();

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                in_flight.remove(&key);
            }
        }

        entry.result.clone()
    }

    async fn run_probe(&self, url: &str, key: &str) -> Arc<CacheEntry> {
        // A previous flight may have stored a fresh entry after our miss
        if let Some(entry) = self.live_entry(key) {
            return entry;
        }

        self.probes_executed.fetch_add(1, Ordering::Relaxed);
        metrics().probes_executed.add(1, &[]);
        let started = Instant::now();
        let result = self.prober.probe(url).await;

        let ttl = match &result {
            Ok(_) => self.ttl,
            Err(e) => {
                debug!(url = %UrlUtils::redact(url), error = %e, "Caching probe failure");
                self.error_ttl
            }
        };
        debug!(
            url = %UrlUtils::redact(url),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Probe finished"
        );

        let entry = Arc::new(CacheEntry {
            result,
            created_at: Utc::now(),
            expires_at: Instant::now() + ttl,
            hits: AtomicU64::new(0),
        });
        self.entries.write().insert(key.to_string(), entry.clone());
        entry
    }

    fn live_entry(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .cloned()
    }

    /// Cached result without probing (None when absent or expired)
    pub fn peek(&self, url: &str) -> Option<Result<CodecInfo, ProbeError>> {
        self.live_entry(&UrlUtils::normalize_for_cache(url))
            .map(|entry| entry.result.clone())
    }

    /// Drop the entry for a URL; returns whether one existed
    pub fn invalidate(&self, url: &str) -> bool {
        self.entries
            .write()
            .remove(&UrlUtils::normalize_for_cache(url))
            .is_some()
    }

    /// Remove expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn stats(&self) -> CodecCacheStats {
        let now = Instant::now();
        let entries = self.entries.read();
        let valid_entries = entries.values().filter(|e| e.is_live(now)).count();
        let error_entries = entries.values().filter(|e| e.result.is_err()).count();

        CodecCacheStats {
            total_entries: entries.len(),
            valid_entries,
            expired_entries: entries.len() - valid_entries,
            error_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            probes_executed: self.probes_executed.load(Ordering::Relaxed),
            in_flight: self.in_flight.lock().len(),
        }
    }

    /// Snapshot of every entry, sorted by URL
    pub fn entries(&self) -> Vec<CodecCacheEntryInfo> {
        let now = Instant::now();
        let mut list: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(url, entry)| CodecCacheEntryInfo {
                url: UrlUtils::redact(url),
                codec_info: entry.result.as_ref().ok().cloned(),
                error: entry.result.as_ref().err().map(|e| e.to_string()),
                created_at: entry.created_at,
                expires_in_secs: entry.expires_at.saturating_duration_since(now).as_secs(),
                hits: entry.hits.load(Ordering::Relaxed),
            })
            .collect();
        list.sort_by(|a, b| a.url.cmp(&b.url));
        list
    }

    /// Periodically purge expired entries until `shutdown` is cancelled
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            info!(removed, "Purged expired codec probe cache entries");
                        }
                    }
                }
            }
            debug!("Codec cache cleanup task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct CountingProber {
        calls: AtomicU32,
        delay: Duration,
        fail: bool,
    }

    impl CountingProber {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                delay,
                fail,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaProber for CountingProber {
        async fn probe(&self, url: &str) -> Result<CodecInfo, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ProbeError::failed(url, "connection refused"));
            }
            Ok(CodecInfo {
                video_codec: Some("h264".to_string()),
                audio_codec: Some("aac".to_string()),
                resolution: Some("1280x720".to_string()),
                ..Default::default()
            })
        }
    }

    fn cache(prober: Arc<CountingProber>) -> Arc<CodecProbeCache> {
        Arc::new(CodecProbeCache::new(
            prober,
            Duration::from_secs(60),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_probes_single_flight() {
        let prober = CountingProber::new(Duration::from_millis(200), false);
        let cache = cache(prober.clone());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.probe("http://example.com/live/1.ts").await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(prober.calls(), 1);
        assert!(results.iter().all(|r| r == &results[0]));
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_urls_probe_independently() {
        let prober = CountingProber::new(Duration::from_millis(100), false);
        let cache = cache(prober.clone());

        let (a, b) = tokio::join!(
            cache.probe("http://example.com/a.ts"),
            cache.probe("http://example.com/b.ts")
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(prober.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let prober = CountingProber::new(Duration::ZERO, false);
        let cache = cache(prober.clone());
        let url = "http://example.com/live/2.ts";

        cache.probe(url).await.unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        cache.probe(url).await.unwrap();
        assert_eq!(prober.calls(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.stats().expired_entries, 1);
        cache.probe(url).await.unwrap();
        assert_eq!(prober.calls(), 2);
        assert_eq!(cache.stats().valid_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_cached_with_error_ttl() {
        let prober = CountingProber::new(Duration::ZERO, true);
        let cache = cache(prober.clone());
        let url = "http://down.example.com/x.ts";

        assert!(cache.probe(url).await.is_err());
        assert!(cache.probe(url).await.is_err());
        assert_eq!(prober.calls(), 1);
        assert_eq!(cache.stats().error_entries, 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.probe(url).await.is_err());
        assert_eq!(prober.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normalized_urls_share_entry() {
        let prober = CountingProber::new(Duration::ZERO, false);
        let cache = cache(prober.clone());

        cache.probe("http://Example.com/a.ts#x").await.unwrap();
        cache.probe("http://example.com:80/a.ts").await.unwrap();
        assert_eq!(prober.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_purge() {
        let prober = CountingProber::new(Duration::ZERO, false);
        let cache = cache(prober.clone());

        cache.probe("http://example.com/a.ts").await.unwrap();
        cache.probe("http://example.com/a.ts").await.unwrap();
        cache.probe("http://example.com/a.ts").await.unwrap();
        cache.probe("http://example.com/b.ts").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.valid_entries, 2);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.probes_executed, 2);

        let entries = cache.entries();
        assert_eq!(entries[0].hits, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.purge_expired(), 2);
        let stats = cache.stats();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_reprobe() {
        let prober = CountingProber::new(Duration::ZERO, false);
        let cache = cache(prober.clone());

        cache.probe("http://example.com/a.ts").await.unwrap();
        assert!(cache.invalidate("http://example.com/a.ts"));
        assert!(!cache.invalidate("http://example.com/a.ts"));
        assert!(cache.peek("http://example.com/a.ts").is_none());
        cache.probe("http://example.com/a.ts").await.unwrap();
        assert_eq!(prober.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_purges() {
        let prober = CountingProber::new(Duration::ZERO, false);
        let cache = cache(prober.clone());
        let shutdown = CancellationToken::new();
        let handle = cache.spawn_cleanup_task(Duration::from_secs(30), shutdown.clone());

        cache.probe("http://example.com/a.ts").await.unwrap();
        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(cache.stats().total_entries, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
