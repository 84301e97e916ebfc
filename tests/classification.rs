//! Table tests for stream classification and transport selection

use async_trait::async_trait;
use rstest::rstest;
use std::collections::HashMap;
use std::sync::Arc;

use m3u_relay::config::RelayProfileConfig;
use m3u_relay::services::upstream::UpstreamTransport;
use m3u_relay::streaming::classification::FetchedManifest;
use m3u_relay::streaming::{
    ClassificationError, ClassificationPolicy, ManifestFetcher, StreamClassifier, TransportMode,
};

const MEDIA_TS: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:100\n#EXTINF:4,\nseg100.ts\n#EXTINF:4,\nseg101.ts\n";
const MEDIA_AES: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:4,\nseg1.ts\n";
const MEDIA_KEY_NONE: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-KEY:METHOD=NONE\n#EXTINF:4,\nseg1.ts\n";
const MEDIA_FMP4: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:4,\nseg1.m4s\n";
const MASTER_ONE: &str = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720\nhd/index.m3u8\n";
const MASTER_THREE: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\nsd/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080,CODECS=\"avc1.640028,mp4a.40.2\"\nfhd/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720\nhd/index.m3u8\n";

#[derive(Default)]
struct Manifests(HashMap<String, String>);

impl Manifests {
    fn with(mut self, url: &str, body: &str) -> Self {
        self.0.insert(url.to_string(), body.to_string());
        self
    }
}

#[async_trait]
impl ManifestFetcher for Manifests {
    async fn fetch_manifest(
        &self,
        url: &str,
        _max_bytes: usize,
    ) -> Result<FetchedManifest, ClassificationError> {
        self.0
            .get(url)
            .map(|body| FetchedManifest {
                final_url: url.to_string(),
                content_type: Some("application/vnd.apple.mpegurl".to_string()),
                body: body.clone(),
            })
            .ok_or_else(|| ClassificationError::Fetch {
                url: url.to_string(),
                message: "HTTP 404 Not Found".to_string(),
            })
    }
}

fn classifier(manifests: Manifests, policy: ClassificationPolicy) -> StreamClassifier {
    StreamClassifier::new(Arc::new(manifests), policy)
}

#[rstest]
#[case::clear_ts(MEDIA_TS, true, None)]
#[case::aes_128(MEDIA_AES, false, Some("encrypted"))]
#[case::key_method_none(MEDIA_KEY_NONE, true, None)]
#[case::fmp4(MEDIA_FMP4, false, Some("fmp4 requires segment rewriting"))]
#[tokio::test]
async fn media_playlist_eligibility(
    #[case] body: &str,
    #[case] eligible: bool,
    #[case] reason: Option<&str>,
) {
    let url = "http://cdn.example.com/live/index.m3u8";
    let c = classifier(Manifests::default().with(url, body), ClassificationPolicy::default());

    let result = c.classify_stream(url).await;
    assert_eq!(result.mode, TransportMode::HlsMedia);
    assert_eq!(result.eligible_for_collapse, eligible);
    assert!(!result.ambiguous);
    assert_eq!(result.target_duration, Some(4.0));
    if let Some(reason) = reason {
        assert!(result.reasons.iter().any(|r| r == reason), "{:?}", result.reasons);
    }
}

#[rstest]
#[case::defaults(ClassificationPolicy::default(), true, None)]
#[case::abr_required(
    ClassificationPolicy { require_client_abr: true, ..Default::default() },
    false,
    Some("client abr required by policy")
)]
#[case::too_many_variants(
    ClassificationPolicy { max_variants_for_collapse: Some(2), ..Default::default() },
    false,
    Some("variant count does not match policy")
)]
#[case::collapse_disabled(
    ClassificationPolicy { collapse_enabled: false, ..Default::default() },
    false,
    Some("collapse disabled by policy")
)]
#[tokio::test]
async fn master_playlist_policy(
    #[case] policy: ClassificationPolicy,
    #[case] eligible: bool,
    #[case] reason: Option<&str>,
) {
    let master = "http://cdn.example.com/live/master.m3u8";
    let c = classifier(
        Manifests::default()
            .with(master, MASTER_THREE)
            .with("http://cdn.example.com/live/fhd/index.m3u8", MEDIA_TS),
        policy,
    );

    let result = c.classify_stream(master).await;
    assert_eq!(result.mode, TransportMode::HlsMaster);
    assert_eq!(result.variant_count, Some(3));
    assert_eq!(result.eligible_for_collapse, eligible);
    if eligible {
        assert_eq!(result.selected_bandwidth, Some(5_000_000));
        assert_eq!(result.selected_resolution.as_deref(), Some("1920x1080"));
        assert_eq!(
            result.selected_playlist_url.as_deref(),
            Some("http://cdn.example.com/live/fhd/index.m3u8")
        );
    }
    if let Some(reason) = reason {
        assert!(result.reasons.iter().any(|r| r == reason), "{:?}", result.reasons);
    }
}

#[rstest]
#[case::ts("http://cdn.example.com/live/1.ts")]
#[case::mp4("http://cdn.example.com/vod/movie.mp4?token=abc")]
#[case::mkv("http://cdn.example.com/vod/movie.mkv")]
#[tokio::test]
async fn media_extensions_are_direct(#[case] url: &str) {
    let c = classifier(Manifests::default(), ClassificationPolicy::default());
    let result = c.try_classify(url).await.unwrap();
    assert_eq!(result.mode, TransportMode::DirectFile);
    assert!(!result.ambiguous);
}

#[rstest]
#[case::truncated("#EXT-X-TARGETDURATION:4\n#EXTINF:4,\nseg.ts\n")]
#[case::no_entries("#EXTM3U\n#EXT-X-VERSION:3\n")]
#[tokio::test]
async fn ambiguous_manifests_fall_back_to_direct(#[case] body: &str) {
    let url = "http://cdn.example.com/live/broken.m3u8";
    let c = classifier(Manifests::default().with(url, body), ClassificationPolicy::default());

    assert!(matches!(
        c.try_classify(url).await,
        Err(ClassificationError::Ambiguous { .. })
    ));
    let result = c.classify_stream(url).await;
    assert_eq!(result.mode, TransportMode::DirectFile);
    assert!(result.ambiguous);
    assert!(!result.eligible_for_collapse);
}

#[tokio::test]
async fn unreachable_variant_is_not_collapsed() {
    let master = "http://cdn.example.com/live/master.m3u8";
    let c = classifier(
        Manifests::default().with(master, MASTER_ONE),
        ClassificationPolicy::default(),
    );

    let result = c.classify_stream(master).await;
    assert_eq!(result.mode, TransportMode::HlsMaster);
    assert!(!result.eligible_for_collapse);
    assert!(result.requires_rewrite());
}

#[rstest]
#[case::collapsible(MASTER_ONE, false, "collapse")]
#[case::rewrite_needed(MEDIA_FMP4, false, "remux")]
#[case::profile_wins(MASTER_ONE, true, "remux")]
#[tokio::test]
async fn transport_follows_classification(
    #[case] body: &str,
    #[case] with_profile: bool,
    #[case] expected: &str,
) {
    let url = "http://cdn.example.com/live/index.m3u8";
    let c = classifier(
        Manifests::default()
            .with(url, body)
            .with("http://cdn.example.com/live/hd/index.m3u8", MEDIA_TS),
        ClassificationPolicy::default(),
    );
    let classification = c.classify_stream(url).await;
    let profile = RelayProfileConfig {
        description: None,
        input_args: vec![],
        output_args: vec!["-c".to_string(), "copy".to_string()],
    };

    let transport = UpstreamTransport::select(
        Some(&classification),
        with_profile.then_some(&profile),
    );
    assert_eq!(transport.label(), expected);
}

#[tokio::test]
async fn direct_stream_is_passthrough() {
    let c = classifier(Manifests::default(), ClassificationPolicy::default());
    let classification = c.classify_stream("http://cdn.example.com/live/1.ts").await;
    assert_eq!(
        UpstreamTransport::select(Some(&classification), None),
        UpstreamTransport::Passthrough
    );
}
