/*!
 * Stream classification
 *
 * Decides how an upstream URL can be relayed:
 *
 * - `DirectFile`: not a playlist, bytes are passed through unmodified.
 * - `HlsMaster`: multi-rendition manifest. When policy allows and the manifest
 *   is clear MPEG-TS, the best-bandwidth rendition is selected so the relay can
 *   collapse it into a single continuous TS stream.
 * - `HlsMedia`: a single media playlist; collapsible when clear MPEG-TS.
 *
 * Classification is advisory and never streams. Anything that cannot be parsed
 * confidently falls back to passthrough with the reason recorded.
 */

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ClassificationConfig;
use crate::observability::{KeyValue, metrics};
use crate::utils::url::UrlUtils;

/// Upper bound for manifest bodies
pub const MAX_PLAYLIST_BYTES: usize = 256 * 1024;

const PLAYLIST_EXTENSIONS: &[&str] = &["m3u8", "m3u"];
const MEDIA_EXTENSIONS: &[&str] = &[
    "ts", "mts", "m2ts", "mp4", "m4v", "mkv", "flv", "aac", "mp3", "ac3", "webm", "mov", "avi",
];
const FMP4_SEGMENT_EXTENSIONS: &[&str] = &["m4s", "mp4", "m4v", "m4a", "cmfv", "cmfa"];

/// Transport shape of an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    DirectFile,
    HlsMaster,
    HlsMedia,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectFile => "direct_file",
            Self::HlsMaster => "hls_master",
            Self::HlsMedia => "hls_media",
        }
    }
}

/// Classification output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub url: String,
    pub mode: TransportMode,
    pub variant_count: Option<usize>,
    pub target_duration: Option<f32>,
    pub is_encrypted: bool,
    pub uses_fmp4: bool,
    /// A single rendition can be relayed as if it were the only one
    pub eligible_for_collapse: bool,
    pub selected_playlist_url: Option<String>,
    pub selected_bandwidth: Option<u64>,
    pub selected_resolution: Option<String>,
    /// The manifest could not be parsed confidently and passthrough was chosen
    pub ambiguous: bool,
    pub reasons: Vec<String>,
}

impl ClassificationResult {
    fn new(url: &str, mode: TransportMode) -> Self {
        Self {
            url: url.to_string(),
            mode,
            variant_count: None,
            target_duration: None,
            is_encrypted: false,
            uses_fmp4: false,
            eligible_for_collapse: false,
            selected_playlist_url: None,
            selected_bandwidth: None,
            selected_resolution: None,
            ambiguous: false,
            reasons: Vec::new(),
        }
    }

    fn direct(url: &str, reason: impl Into<String>) -> Self {
        let mut result = Self::new(url, TransportMode::DirectFile);
        result.reasons.push(reason.into());
        result
    }

    /// HLS upstream that cannot be served by collapsing a single rendition
    pub fn requires_rewrite(&self) -> bool {
        self.mode != TransportMode::DirectFile && !self.eligible_for_collapse
    }
}

/// Classification failures; [`StreamClassifier::classify_stream`] converts them to a passthrough result
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("Ambiguous manifest at {url}: {reason}")]
    Ambiguous { url: String, reason: String },
    #[error("Manifest fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("Manifest fetch for {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("Manifest fetch for {url} skipped: circuit open for {service}")]
    CircuitOpen { url: String, service: String },
}

/// Collapse selection policy
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationPolicy {
    pub collapse_enabled: bool,
    pub require_client_abr: bool,
    pub max_variants_for_collapse: Option<usize>,
    pub sniff_unknown: bool,
    pub max_manifest_bytes: usize,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self::from(&ClassificationConfig::default())
    }
}

impl From<&ClassificationConfig> for ClassificationPolicy {
    fn from(config: &ClassificationConfig) -> Self {
        Self {
            collapse_enabled: config.collapse_enabled,
            require_client_abr: config.require_client_abr,
            max_variants_for_collapse: config.max_variants_for_collapse,
            sniff_unknown: config.sniff_unknown,
            max_manifest_bytes: config.max_manifest_bytes.min(MAX_PLAYLIST_BYTES),
        }
    }
}

/// A fetched manifest body
#[derive(Debug, Clone, Default)]
pub struct FetchedManifest {
    /// URL after redirects; relative entries resolve against it
    pub final_url: String,
    pub content_type: Option<String>,
    /// Empty when the content type announced binary media
    pub body: String,
}

impl FetchedManifest {
    fn content_type_is_playlist(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("mpegurl"))
            .unwrap_or(false)
    }
}

/// Bounded manifest retrieval
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch_manifest(
        &self,
        url: &str,
        max_bytes: usize,
    ) -> Result<FetchedManifest, ClassificationError>;
}

/// reqwest-backed manifest fetcher
#[derive(Debug, Clone)]
pub struct HttpManifestFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpManifestFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch_manifest(
        &self,
        url: &str,
        max_bytes: usize,
    ) -> Result<FetchedManifest, ClassificationError> {
        let fetch_error = |message: String| ClassificationError::Fetch {
            url: url.to_string(),
            message,
        };

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClassificationError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if content_type.as_deref().is_some_and(is_binary_media_type) {
            return Ok(FetchedManifest {
                final_url,
                content_type,
                body: String::new(),
            });
        }

        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::with_capacity(8192);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fetch_error(e.to_string()))?;
            let remaining = max_bytes.saturating_sub(buf.len());
            if chunk.len() >= remaining {
                buf.extend_from_slice(&chunk[..remaining]);
                break;
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(FetchedManifest {
            final_url,
            content_type,
            body: String::from_utf8_lossy(&buf).into_owned(),
        })
    }
}

fn is_binary_media_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("mpegurl") {
        return false;
    }
    ct.starts_with("video/") || ct.starts_with("audio/")
}

/// Stream classifier
pub struct StreamClassifier {
    fetcher: Arc<dyn ManifestFetcher>,
    policy: ClassificationPolicy,
}

impl StreamClassifier {
    pub fn new(fetcher: Arc<dyn ManifestFetcher>, policy: ClassificationPolicy) -> Self {
        Self { fetcher, policy }
    }

    pub fn policy(&self) -> &ClassificationPolicy {
        &self.policy
    }

    /// Classify a URL, falling back to passthrough when the manifest is ambiguous
    pub async fn classify_stream(&self, url: &str) -> ClassificationResult {
        match self.try_classify(url).await {
            Ok(result) => {
                metrics()
                    .classification_total
                    .add(1, &[KeyValue::new("mode", result.mode.as_str())]);
                debug!(
                    url = %UrlUtils::redact(url),
                    mode = result.mode.as_str(),
                    eligible_for_collapse = result.eligible_for_collapse,
                    reasons = ?result.reasons,
                    "Stream classified"
                );
                result
            }
            Err(error) => {
                metrics().classification_fallback_total.add(1, &[]);
                warn!(url = %UrlUtils::redact(url), error = %error, "Classification ambiguous, using passthrough");
                let mut result = ClassificationResult::direct(url, error.to_string());
                result.ambiguous = true;
                result
                    .reasons
                    .push("falling back to passthrough without collapse".to_string());
                result
            }
        }
    }

    /// Classify a URL, surfacing ambiguity and fetch failures as errors
    pub async fn try_classify(&self, url: &str) -> Result<ClassificationResult, ClassificationError> {
        let extension = UrlUtils::path_extension(url);
        let declared_playlist = match extension.as_deref() {
            Some(ext) if PLAYLIST_EXTENSIONS.contains(&ext) => true,
            Some(ext) if MEDIA_EXTENSIONS.contains(&ext) => {
                return Ok(ClassificationResult::direct(
                    url,
                    format!("extension .{ext} is a media file, not a playlist"),
                ));
            }
            _ if !self.policy.sniff_unknown => {
                return Ok(ClassificationResult::direct(
                    url,
                    "no playlist extension and sniffing disabled",
                ));
            }
            _ => false,
        };

        let manifest = self
            .fetcher
            .fetch_manifest(url, self.policy.max_manifest_bytes)
            .await?;

        let looks_like_playlist =
            manifest.body.trim_start().starts_with("#EXTM3U") || manifest.content_type_is_playlist();

        if !declared_playlist && !looks_like_playlist {
            return Ok(ClassificationResult::direct(
                url,
                "sniffed content carries no playlist markers",
            ));
        }

        let analysis = analyze_playlist(&manifest.body);
        if !analysis.has_extm3u {
            return Err(ClassificationError::Ambiguous {
                url: url.to_string(),
                reason: "missing #EXTM3U header (truncated or not HLS)".to_string(),
            });
        }

        if analysis.is_master() {
            self.classify_master(url, &manifest, analysis).await
        } else if analysis.segment_count > 0 {
            Ok(self.classify_media(url, &manifest.final_url, &analysis))
        } else {
            Err(ClassificationError::Ambiguous {
                url: url.to_string(),
                reason: "neither variants nor segments found".to_string(),
            })
        }
    }

    async fn classify_master(
        &self,
        url: &str,
        manifest: &FetchedManifest,
        analysis: PlaylistAnalysis,
    ) -> Result<ClassificationResult, ClassificationError> {
        let mut result = ClassificationResult::new(url, TransportMode::HlsMaster);
        result.variant_count = Some(analysis.variants.len());
        result.is_encrypted = analysis.is_encrypted;
        result.uses_fmp4 = analysis.uses_fmp4;
        result.reasons.push(format!(
            "master playlist with {} variant(s)",
            analysis.variants.len()
        ));

        let rejections = self.policy_rejections(&analysis);
        if !rejections.is_empty() {
            result.reasons.extend(rejections);
            return Ok(result);
        }

        let Some(best) = best_variant(&analysis.variants) else {
            return Err(ClassificationError::Ambiguous {
                url: url.to_string(),
                reason: "variant entries without URIs".to_string(),
            });
        };
        let variant_url = UrlUtils::resolve(&manifest.final_url, &best.uri);

        // The master cannot reveal segment encryption or fMP4; confirm on the chosen rendition
        let media = match self
            .fetcher
            .fetch_manifest(&variant_url, self.policy.max_manifest_bytes)
            .await
        {
            Ok(media) => media,
            Err(e) => {
                result
                    .reasons
                    .push(format!("selected variant playlist unreachable: {e}"));
                return Ok(result);
            }
        };
        let media_analysis = analyze_playlist(&media.body);
        if !media_analysis.has_extm3u || media_analysis.segment_count == 0 {
            result
                .reasons
                .push("selected variant playlist is ambiguous".to_string());
            return Ok(result);
        }

        result.target_duration = media_analysis.target_duration;
        result.is_encrypted |= media_analysis.is_encrypted;
        result.uses_fmp4 |= media_analysis.uses_fmp4;
        if media_analysis.is_encrypted {
            result.reasons.push("encrypted".to_string());
            return Ok(result);
        }
        if media_analysis.uses_fmp4 {
            result
                .reasons
                .push("fmp4 requires segment rewriting".to_string());
            return Ok(result);
        }

        result.eligible_for_collapse = true;
        result.selected_playlist_url = Some(media.final_url);
        result.selected_bandwidth = Some(best.bandwidth);
        result.selected_resolution = best.resolution.clone();
        result.reasons.push(format!(
            "collapsing to best variant at {} bps",
            best.bandwidth
        ));
        Ok(result)
    }

    fn classify_media(
        &self,
        url: &str,
        final_url: &str,
        analysis: &PlaylistAnalysis,
    ) -> ClassificationResult {
        let mut result = ClassificationResult::new(url, TransportMode::HlsMedia);
        result.target_duration = analysis.target_duration;
        result.is_encrypted = analysis.is_encrypted;
        result.uses_fmp4 = analysis.uses_fmp4;
        result.reasons.push(format!(
            "media playlist with {} segment(s)",
            analysis.segment_count
        ));

        if !self.policy.collapse_enabled {
            result
                .reasons
                .push("collapse disabled by policy".to_string());
        } else if analysis.is_encrypted {
            result.reasons.push("encrypted".to_string());
        } else if analysis.uses_fmp4 {
            result
                .reasons
                .push("fmp4 requires segment rewriting".to_string());
        } else {
            result.eligible_for_collapse = true;
            result.selected_playlist_url = Some(final_url.to_string());
        }
        result
    }

    fn policy_rejections(&self, analysis: &PlaylistAnalysis) -> Vec<String> {
        let mut reasons = Vec::new();
        let variant_count = analysis.variants.len();

        if !self.policy.collapse_enabled {
            reasons.push("collapse disabled by policy".to_string());
        }
        if self.policy.require_client_abr && variant_count > 1 {
            reasons.push("client abr required by policy".to_string());
        }
        if self
            .policy
            .max_variants_for_collapse
            .is_some_and(|max| variant_count > max)
        {
            reasons.push("variant count does not match policy".to_string());
        }
        if analysis.is_encrypted {
            reasons.push("encrypted".to_string());
        }
        if analysis.uses_fmp4 {
            reasons.push("fmp4 requires segment rewriting".to_string());
        }
        reasons
    }
}

/// One `#EXT-X-STREAM-INF` entry
#[derive(Debug, Clone, PartialEq)]
pub struct MasterVariant {
    pub bandwidth: u64,
    pub resolution: Option<String>,
    pub codecs: Option<String>,
    pub uri: String,
}

#[derive(Debug, Default)]
struct PlaylistAnalysis {
    has_extm3u: bool,
    variants: Vec<MasterVariant>,
    stream_inf_count: usize,
    target_duration: Option<f32>,
    is_encrypted: bool,
    uses_fmp4: bool,
    segment_count: usize,
}

impl PlaylistAnalysis {
    fn is_master(&self) -> bool {
        self.stream_inf_count > 0
    }
}

fn analyze_playlist(text: &str) -> PlaylistAnalysis {
    let mut analysis = PlaylistAnalysis {
        variants: parse_master_variants(text),
        ..Default::default()
    };

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("#EXTM3U") {
            analysis.has_extm3u = true;
        } else if line.starts_with("#EXT-X-STREAM-INF") {
            analysis.stream_inf_count += 1;
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            analysis.target_duration = value.trim().parse::<f32>().ok();
        } else if let Some(attrs) = line
            .strip_prefix("#EXT-X-KEY:")
            .or_else(|| line.strip_prefix("#EXT-X-SESSION-KEY:"))
        {
            let method = parse_attributes(attrs).remove("METHOD").unwrap_or_default();
            if !method.eq_ignore_ascii_case("NONE") {
                analysis.is_encrypted = true;
            }
        } else if line.starts_with("#EXT-X-MAP") {
            analysis.uses_fmp4 = true;
        } else if !line.starts_with('#') && analysis.stream_inf_count == 0 {
            analysis.segment_count += 1;
            if UrlUtils::path_extension(line)
                .is_some_and(|ext| FMP4_SEGMENT_EXTENSIONS.contains(&ext.as_str()))
            {
                analysis.uses_fmp4 = true;
            }
        }
    }
    analysis
}

/// Parse `#EXT-X-STREAM-INF` entries in source order
pub fn parse_master_variants(text: &str) -> Vec<MasterVariant> {
    let mut out = Vec::new();
    let mut pending: Option<HashMap<String, String>> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending = Some(parse_attributes(attrs));
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(mut attrs) = pending.take() {
            out.push(MasterVariant {
                bandwidth: attrs
                    .get("BANDWIDTH")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                resolution: attrs
                    .remove("RESOLUTION")
                    .filter(|r| r.split_once('x').is_some()),
                codecs: attrs.remove("CODECS"),
                uri: line.to_string(),
            });
        }
    }
    out
}

/// Highest bandwidth variant; the first one wins ties
fn best_variant(variants: &[MasterVariant]) -> Option<&MasterVariant> {
    variants.iter().fold(None, |best, candidate| match best {
        Some(current) if current.bandwidth >= candidate.bandwidth => Some(current),
        _ => Some(candidate),
    })
}

/// Parse an HLS attribute list (`KEY=VALUE,KEY="quoted,value"`)
fn parse_attributes(input: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after_eq)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().to_ascii_uppercase();
        let (value, remainder) = if let Some(quoted) = after_eq.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((value, tail)) => (value.to_string(), tail),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after_eq.split_once(',') {
                Some((value, tail)) => (value.trim().to_string(), tail),
                None => (after_eq.trim().to_string(), ""),
            }
        };
        attrs.insert(key, value);
        rest = remainder.trim_start_matches(',').trim_start();
    }
    attrs
}


#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeFetcher {
        bodies: HashMap<String, (Option<String>, String)>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.bodies.insert(url.to_string(), (None, body.to_string()));
            self
        }

        fn with_content_type(mut self, url: &str, content_type: &str, body: &str) -> Self {
            self.bodies.insert(
                url.to_string(),
                (Some(content_type.to_string()), body.to_string()),
            );
            self
        }
    }

    #[async_trait]
    impl ManifestFetcher for FakeFetcher {
        async fn fetch_manifest(
            &self,
            url: &str,
            _max_bytes: usize,
        ) -> Result<FetchedManifest, ClassificationError> {
            self.requests.lock().push(url.to_string());
            match self.bodies.get(url) {
                Some((content_type, body)) => Ok(FetchedManifest {
                    final_url: url.to_string(),
                    content_type: content_type.clone(),
                    body: body.clone(),
                }),
                None => Err(ClassificationError::Fetch {
                    url: url.to_string(),
                    message: "HTTP 404 Not Found".to_string(),
                }),
            }
        }
    }

    fn classifier(fetcher: FakeFetcher, policy: ClassificationPolicy) -> StreamClassifier {
        StreamClassifier::new(Arc::new(fetcher), policy)
    }

    const MEDIA_TS: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:1\n#EXTINF:6,\ns1.ts\n#EXTINF:6,\ns2.ts\n";

    #[tokio::test]
    async fn test_ts_extension_is_direct_without_fetch() {
        let fetcher = Arc::new(FakeFetcher::default());
        let c = StreamClassifier::new(fetcher.clone(), ClassificationPolicy::default());
        let result = c.classify_stream("http://h/live/1.ts").await;
        assert_eq!(result.mode, TransportMode::DirectFile);
        assert!(!result.eligible_for_collapse);
        assert!(fetcher.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_media_playlist_clear_ts_is_collapsible() {
        let c = classifier(
            FakeFetcher::default().with("http://h/a/index.m3u8", MEDIA_TS),
            ClassificationPolicy::default(),
        );
        let result = c.try_classify("http://h/a/index.m3u8").await.unwrap();
        assert_eq!(result.mode, TransportMode::HlsMedia);
        assert_eq!(result.target_duration, Some(6.0));
        assert!(result.eligible_for_collapse);
        assert_eq!(result.selected_playlist_url.as_deref(), Some("http://h/a/index.m3u8"));
    }

    #[tokio::test]
    async fn test_single_rendition_master_collapses() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1200000,RESOLUTION=1280x720\nhd/index.m3u8\n";
        let c = classifier(
            FakeFetcher::default()
                .with("http://h/live/master.m3u8", master)
                .with("http://h/live/hd/index.m3u8", MEDIA_TS),
            ClassificationPolicy::default(),
        );
        let result = c.try_classify("http://h/live/master.m3u8").await.unwrap();
        assert_eq!(result.mode, TransportMode::HlsMaster);
        assert_eq!(result.variant_count, Some(1));
        assert!(result.eligible_for_collapse);
        assert_eq!(result.selected_playlist_url.as_deref(), Some("http://h/live/hd/index.m3u8"));
        assert_eq!(result.selected_bandwidth, Some(1_200_000));
        assert_eq!(result.selected_resolution.as_deref(), Some("1280x720"));
    }

    #[tokio::test]
    async fn test_multi_variant_selects_best_bandwidth() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nlow.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=3000000\nhigh.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=1500000\nmid.m3u8\n";
        let c = classifier(
            FakeFetcher::default()
                .with("http://h/m.m3u8", master)
                .with("http://h/high.m3u8", MEDIA_TS),
            ClassificationPolicy::default(),
        );
        let result = c.try_classify("http://h/m.m3u8").await.unwrap();
        assert!(result.eligible_for_collapse);
        assert_eq!(result.variant_count, Some(3));
        assert_eq!(result.selected_bandwidth, Some(3_000_000));
    }

    #[tokio::test]
    async fn test_encrypted_master_never_collapses() {
        let master = "#EXTM3U\n#EXT-X-SESSION-KEY:METHOD=AES-128,URI=\"k\"\n#EXT-X-STREAM-INF:BANDWIDTH=1\na.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2\nb.m3u8\n";
        let c = classifier(
            FakeFetcher::default().with("http://h/m.m3u8", master),
            ClassificationPolicy::default(),
        );
        let result = c.try_classify("http://h/m.m3u8").await.unwrap();
        assert!(result.is_encrypted);
        assert!(!result.eligible_for_collapse);
        assert!(result.reasons.iter().any(|r| r == "encrypted"));
    }

    #[tokio::test]
    async fn test_encrypted_variant_rejects_collapse() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\na.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2\nb.m3u8\n";
        let media = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:4,\ns.ts\n";
        let c = classifier(
            FakeFetcher::default()
                .with("http://h/m.m3u8", master)
                .with("http://h/b.m3u8", media),
            ClassificationPolicy::default(),
        );
        let result = c.try_classify("http://h/m.m3u8").await.unwrap();
        assert!(result.is_encrypted);
        assert!(!result.eligible_for_collapse);
        assert!(result.requires_rewrite());
    }

    #[tokio::test]
    async fn test_fmp4_media_not_collapsible() {
        let media = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:4,\ns1.m4s\n";
        let c = classifier(
            FakeFetcher::default().with("http://h/f.m3u8", media),
            ClassificationPolicy::default(),
        );
        let result = c.try_classify("http://h/f.m3u8").await.unwrap();
        assert_eq!(result.mode, TransportMode::HlsMedia);
        assert!(result.uses_fmp4);
        assert!(!result.eligible_for_collapse);
        assert!(result.reasons.iter().any(|r| r.contains("fmp4")));
    }

    #[tokio::test]
    async fn test_policy_variant_limit_and_client_abr() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\na.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2\nb.m3u8\n";
        let c = classifier(
            FakeFetcher::default().with("http://h/m.m3u8", master),
            ClassificationPolicy {
                max_variants_for_collapse: Some(1),
                require_client_abr: true,
                ..Default::default()
            },
        );
        let result = c.try_classify("http://h/m.m3u8").await.unwrap();
        assert!(!result.eligible_for_collapse);
        assert!(result.reasons.iter().any(|r| r == "variant count does not match policy"));
        assert!(result.reasons.iter().any(|r| r == "client abr required by policy"));
    }

    #[tokio::test]
    async fn test_unreachable_variant_fails_safe() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nmissing.m3u8\n";
        let c = classifier(
            FakeFetcher::default().with("http://h/m.m3u8", master),
            ClassificationPolicy::default(),
        );
        let result = c.try_classify("http://h/m.m3u8").await.unwrap();
        assert_eq!(result.mode, TransportMode::HlsMaster);
        assert!(!result.eligible_for_collapse);
        assert!(result.selected_playlist_url.is_none());
    }

    #[tokio::test]
    async fn test_ambiguous_manifest_falls_back_to_passthrough() {
        let c = classifier(
            FakeFetcher::default().with("http://h/broken.m3u8", "<html>error</html>"),
            ClassificationPolicy::default(),
        );
        assert!(matches!(
            c.try_classify("http://h/broken.m3u8").await,
            Err(ClassificationError::Ambiguous { .. })
        ));

        let result = c.classify_stream("http://h/broken.m3u8").await;
        assert_eq!(result.mode, TransportMode::DirectFile);
        assert!(result.ambiguous);
        assert!(!result.eligible_for_collapse);
    }

    #[tokio::test]
    async fn test_fetch_failure_falls_back_to_passthrough() {
        let c = classifier(FakeFetcher::default(), ClassificationPolicy::default());
        let result = c.classify_stream("http://h/gone.m3u8").await;
        assert_eq!(result.mode, TransportMode::DirectFile);
        assert!(result.ambiguous);
    }

    #[tokio::test]
    async fn test_sniffs_extensionless_urls() {
        let c = classifier(
            FakeFetcher::default()
                .with_content_type("http://h/live/u/p/100", "application/vnd.apple.mpegurl", MEDIA_TS)
                .with_content_type("http://h/live/u/p/200", "video/mp2t", ""),
            ClassificationPolicy::default(),
        );
        let playlist = c.try_classify("http://h/live/u/p/100").await.unwrap();
        assert_eq!(playlist.mode, TransportMode::HlsMedia);

        let raw = c.try_classify("http://h/live/u/p/200").await.unwrap();
        assert_eq!(raw.mode, TransportMode::DirectFile);
        assert!(!raw.ambiguous);
    }

    #[tokio::test]
    async fn test_sniffing_disabled_is_direct() {
        let fetcher = Arc::new(FakeFetcher::default());
        let c = StreamClassifier::new(
            fetcher.clone(),
            ClassificationPolicy {
                sniff_unknown: false,
                ..Default::default()
            },
        );
        let result = c.try_classify("http://h/live/u/p/100").await.unwrap();
        assert_eq!(result.mode, TransportMode::DirectFile);
        assert!(fetcher.requests.lock().is_empty());
    }
}
