//! Relay services
//!
//! [`RelaySessionManager`] is the entry point; the other modules are its
//! collaborators and can be replaced through [`RelayDependencies`].

pub mod channel_resolver;
pub mod circuit_breaker_manager;
pub mod codec_cache;
pub mod events;
pub mod manifest_fetcher;
pub mod relay_buffer;
pub mod relay_manager;
pub mod stream_prober;
pub mod upstream;

use std::sync::Arc;

use crate::config::Config;
use crate::streaming::classification::{
    ClassificationPolicy, HttpManifestFetcher, StreamClassifier,
};

pub use channel_resolver::{ChannelResolver, StaticChannelResolver};
pub use circuit_breaker_manager::CircuitBreakerManager;
pub use codec_cache::{CodecCacheStats, CodecProbeCache};
pub use events::{BroadcastEventSink, RelayEventSink, TracingEventSink};
pub use manifest_fetcher::BreakerManifestFetcher;
pub use relay_buffer::RelayByteStream;
pub use relay_manager::{RelayDependencies, RelaySessionManager};
pub use stream_prober::{CodecInfo, FfprobeProber, MediaProber};
pub use upstream::{DefaultUpstreamFetcher, UpstreamFetcher};

/// HTTP client shared by every upstream fetcher
pub fn build_http_client(config: &Config) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.relay.upstream_connect_timeout)
        .user_agent(config.relay.user_agent.clone())
        .build()
}

/// Production wiring: config channels, ffprobe, HTTP upstreams and log events
pub fn build_relay_manager(config: &Config, client: reqwest::Client) -> RelaySessionManager {
    let circuit_breakers = CircuitBreakerManager::new(config.circuitbreaker.clone());
    let manifests = HttpManifestFetcher::new(client.clone(), config.classification.fetch_timeout);
    let classifier = StreamClassifier::new(
        Arc::new(BreakerManifestFetcher::new(
            Arc::new(manifests),
            circuit_breakers.clone(),
        )),
        ClassificationPolicy::from(&config.classification),
    );
    let codec_cache = CodecProbeCache::new(
        Arc::new(FfprobeProber::new(&config.probe)),
        config.probe.cache_ttl,
        config.probe.error_ttl,
    );

    let deps = RelayDependencies {
        resolver: Arc::new(StaticChannelResolver::new(&config.channels)),
        fetcher: Arc::new(DefaultUpstreamFetcher::new(client, &config.relay)),
        circuit_breakers,
        classifier: Arc::new(classifier),
        codec_cache: Arc::new(codec_cache),
        events: Arc::new(TracingEventSink),
    };

    RelaySessionManager::new(config.relay.clone(), config.relay_profiles.clone(), deps)
}
