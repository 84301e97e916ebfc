//! Metrics instrumentation for the relay subsystem
//!
//! Instruments are created lazily from the global meter. The binary installs
//! an [`SdkMeterProvider`] with [`init_meter_provider`] before any service is
//! built; without it (unit tests) every instrument is a no-op.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use std::sync::OnceLock;
use tracing::info;

pub use opentelemetry::KeyValue;

const METER_NAME: &str = "m3u-relay";

/// Install a local SDK meter provider as the global provider
pub fn init_meter_provider() -> SdkMeterProvider {
    let provider = SdkMeterProvider::builder().build();
    global::set_meter_provider(provider.clone());
    info!("OpenTelemetry configured: local metrics provider");
    provider
}

/// Aggregated metric instruments
pub struct RelayMetrics {
    pub relay_starts: Counter<u64>,
    pub relay_stops: Counter<u64>,
    pub relay_errors: Counter<u64>,
    pub relay_reconnects: Counter<u64>,
    pub active_relays: UpDownCounter<i64>,
    pub client_connections: Counter<u64>,
    pub active_clients: UpDownCounter<i64>,
    pub bytes_received: Counter<u64>,
    pub chunks_dropped: Counter<u64>,
    pub breaker_rejections: Counter<u64>,
    pub breaker_transitions: Counter<u64>,
    pub probe_cache_hits: Counter<u64>,
    pub probe_cache_misses: Counter<u64>,
    pub probes_executed: Counter<u64>,
    pub classification_total: Counter<u64>,
    pub classification_fallback_total: Counter<u64>,
    pub collapsing_segments_emitted: Counter<u64>,
    pub collapsing_playlist_errors: Counter<u64>,
    pub collapsing_segment_errors: Counter<u64>,
}

impl RelayMetrics {
    fn new() -> Self {
        let meter: Meter = global::meter(METER_NAME);
        Self {
            relay_starts: meter
                .u64_counter("relay_starts_total")
                .with_description("Relay sessions started")
                .build(),
            relay_stops: meter
                .u64_counter("relay_stops_total")
                .with_description("Relay sessions stopped")
                .build(),
            relay_errors: meter
                .u64_counter("relay_errors_total")
                .with_description("Relay sessions ended in error")
                .build(),
            relay_reconnects: meter
                .u64_counter("relay_reconnects_total")
                .with_description("Upstream reconnect attempts")
                .build(),
            active_relays: meter
                .i64_up_down_counter("active_relays")
                .with_description("Currently running relay sessions")
                .build(),
            client_connections: meter
                .u64_counter("client_connections_total")
                .with_description("Relay clients attached")
                .build(),
            active_clients: meter
                .i64_up_down_counter("active_clients")
                .with_description("Currently attached relay clients")
                .build(),
            bytes_received: meter
                .u64_counter("bytes_received_total")
                .with_description("Bytes read from upstreams")
                .build(),
            chunks_dropped: meter
                .u64_counter("relay_chunks_dropped_total")
                .with_description("Chunks dropped from slow client buffers")
                .build(),
            breaker_rejections: meter
                .u64_counter("circuit_breaker_rejections_total")
                .with_description("Calls rejected by an open circuit")
                .build(),
            breaker_transitions: meter
                .u64_counter("circuit_breaker_transitions_total")
                .with_description("Circuit breaker state changes")
                .build(),
            probe_cache_hits: meter
                .u64_counter("codec_probe_cache_hits_total")
                .with_description("Codec probe cache hits")
                .build(),
            probe_cache_misses: meter
                .u64_counter("codec_probe_cache_misses_total")
                .with_description("Codec probe cache misses")
                .build(),
            probes_executed: meter
                .u64_counter("codec_probes_executed_total")
                .with_description("External probe invocations")
                .build(),
            classification_total: meter
                .u64_counter("stream_classification_total")
                .with_description("Total stream classifications")
                .build(),
            classification_fallback_total: meter
                .u64_counter("stream_classification_fallback_total")
                .with_description("Classifications that fell back to passthrough")
                .build(),
            collapsing_segments_emitted: meter
                .u64_counter("collapsing_segments_emitted_total")
                .with_description("Segments emitted by collapsing loop")
                .build(),
            collapsing_playlist_errors: meter
                .u64_counter("collapsing_playlist_errors_total")
                .with_description("Playlist fetch errors in collapsing loop")
                .build(),
            collapsing_segment_errors: meter
                .u64_counter("collapsing_segment_errors_total")
                .with_description("Segment fetch errors in collapsing loop")
                .build(),
        }
    }
}

static METRICS: OnceLock<RelayMetrics> = OnceLock::new();

/// Global relay metrics instruments
pub fn metrics() -> &'static RelayMetrics {
    METRICS.get_or_init(RelayMetrics::new)
}
