use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use defaults::*;
use duration_serde::parse_or;

/// Environment variable prefix; nested keys are separated by `__`
/// (e.g. `M3U_RELAY__WEB__PORT=9000`).
pub const ENV_PREFIX: &str = "M3U_RELAY__";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub circuitbreaker: CircuitBreakerConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
    /// Static channel lineup used by the built-in channel resolver
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Relay profiles keyed by profile id; a profile routes the session through ffmpeg
    #[serde(default)]
    pub relay_profiles: HashMap<String, RelayProfileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Relay session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Command used for relay profiles and non-collapsible HLS upstreams
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,
    /// Per-client queue bound in chunks; the oldest chunk is dropped on overflow
    #[serde(default = "default_client_buffer_chunks")]
    pub client_buffer_chunks: usize,
    /// Time a session with no clients is kept alive for reconnecting viewers
    #[serde(default = "default_drain_grace_period", with = "duration_serde::duration")]
    pub drain_grace_period: Duration,
    /// Maximum wait for the first upstream bytes
    #[serde(default = "default_start_timeout", with = "duration_serde::duration")]
    pub start_timeout: Duration,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay", with = "duration_serde::duration")]
    pub reconnect_delay: Duration,
    #[serde(default = "default_upstream_connect_timeout", with = "duration_serde::duration")]
    pub upstream_connect_timeout: Duration,
    /// Idle time between upstream chunks before the read is considered failed
    #[serde(default = "default_upstream_read_timeout", with = "duration_serde::duration")]
    pub upstream_read_timeout: Duration,
    #[serde(default = "default_hls_playlist_timeout", with = "duration_serde::duration")]
    pub hls_playlist_timeout: Duration,
    #[serde(default = "default_hls_segment_timeout", with = "duration_serde::duration")]
    pub hls_segment_timeout: Duration,
    /// Classify the upstream before fetching it
    #[serde(default = "default_true")]
    pub classify_before_start: bool,
    /// Probe codecs (through the cache) before fetching
    #[serde(default)]
    pub probe_before_start: bool,
    #[serde(default = "default_status_report_interval", with = "duration_serde::duration")]
    pub status_report_interval: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_command: default_ffmpeg_command(),
            client_buffer_chunks: default_client_buffer_chunks(),
            drain_grace_period: default_drain_grace_period(),
            start_timeout: default_start_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay: default_reconnect_delay(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_read_timeout: default_upstream_read_timeout(),
            hls_playlist_timeout: default_hls_playlist_timeout(),
            hls_segment_timeout: default_hls_segment_timeout(),
            classify_before_start: true,
            probe_before_start: false,
            status_report_interval: default_status_report_interval(),
            user_agent: default_user_agent(),
        }
    }
}

/// Circuit breaker settings: a global profile plus per-service overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub global: CircuitBreakerProfile,
    /// Overrides keyed by service name (upstream host)
    #[serde(default)]
    pub profiles: HashMap<String, CircuitBreakerProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerProfile {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,
    /// Time spent open before a half-open trial is allowed
    #[serde(default = "default_cb_reset_timeout", with = "duration_serde::duration")]
    pub reset_timeout: Duration,
    /// Trial calls admitted while half-open; all must succeed to close
    #[serde(default = "default_cb_half_open_max")]
    pub half_open_max: u32,
    /// Timeout applied by `CircuitBreaker::execute`
    #[serde(default = "default_cb_operation_timeout", with = "duration_serde::duration")]
    pub operation_timeout: Duration,
    /// Status patterns counted as success besides 2xx ("404", "4xx", ...)
    #[serde(default = "default_acceptable_status_codes")]
    pub acceptable_status_codes: Vec<String>,
}

impl Default for CircuitBreakerProfile {
    fn default() -> Self {
        Self {
            failure_threshold: default_cb_failure_threshold(),
            reset_timeout: default_cb_reset_timeout(),
            half_open_max: default_cb_half_open_max(),
            operation_timeout: default_cb_operation_timeout(),
            acceptable_status_codes: default_acceptable_status_codes(),
        }
    }
}

impl CircuitBreakerProfile {
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.half_open_max == 0 {
            return Err("half_open_max must be at least 1".to_string());
        }
        for pattern in &self.acceptable_status_codes {
            if !crate::utils::status_code_matcher::is_valid_pattern(pattern) {
                return Err(format!("invalid status code pattern '{pattern}'"));
            }
        }
        Ok(())
    }
}

/// External probe settings and cache lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_ffprobe_command")]
    pub ffprobe_command: String,
    #[serde(default = "default_probe_timeout", with = "duration_serde::duration")]
    pub timeout: Duration,
    #[serde(default = "default_probe_cache_ttl", with = "duration_serde::duration")]
    pub cache_ttl: Duration,
    /// Failed probes are cached for a shorter period
    #[serde(default = "default_probe_error_ttl", with = "duration_serde::duration")]
    pub error_ttl: Duration,
    #[serde(default = "default_probe_cleanup_interval", with = "duration_serde::duration")]
    pub cleanup_interval: Duration,
    /// ffprobe `-analyzeduration` in microseconds
    #[serde(default = "default_analyze_duration_us")]
    pub analyze_duration_us: u64,
    /// ffprobe `-probesize` in bytes
    #[serde(default = "default_probe_size_bytes")]
    pub probe_size_bytes: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffprobe_command: default_ffprobe_command(),
            timeout: default_probe_timeout(),
            cache_ttl: default_probe_cache_ttl(),
            error_ttl: default_probe_error_ttl(),
            cleanup_interval: default_probe_cleanup_interval(),
            analyze_duration_us: default_analyze_duration_us(),
            probe_size_bytes: default_probe_size_bytes(),
        }
    }
}

/// HLS classification and collapse policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    #[serde(default = "default_true")]
    pub collapse_enabled: bool,
    /// When set, multi-variant manifests are never collapsed
    #[serde(default)]
    pub require_client_abr: bool,
    /// Upper bound on variants for a master playlist to be collapsed
    #[serde(default)]
    pub max_variants_for_collapse: Option<usize>,
    /// Fetch URLs with unknown extensions to check whether they are playlists
    #[serde(default = "default_true")]
    pub sniff_unknown: bool,
    #[serde(default = "default_manifest_fetch_timeout", with = "duration_serde::duration")]
    pub fetch_timeout: Duration,
    #[serde(default = "default_max_manifest_bytes")]
    pub max_manifest_bytes: usize,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            collapse_enabled: true,
            require_client_abr: false,
            max_variants_for_collapse: None,
            sniff_unknown: true,
            fetch_timeout: default_manifest_fetch_timeout(),
            max_manifest_bytes: DEFAULT_MAX_MANIFEST_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Upstream sources, lower priority value is tried first
    #[serde(default)]
    pub sources: Vec<ChannelSourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelSourceConfig {
    pub url: String,
    #[serde(default)]
    pub priority: i32,
}

/// Arguments for the external encoder used by a relay profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RelayProfileConfig {
    #[serde(default)]
    pub description: Option<String>,
    /// Arguments placed before `-i <input>`
    #[serde(default)]
    pub input_args: Vec<String>,
    /// Arguments placed after the input and before the MPEG-TS output
    #[serde(default = "default_output_args")]
    pub output_args: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_ffmpeg_command() -> String {
    DEFAULT_FFMPEG_COMMAND.to_string()
}

fn default_client_buffer_chunks() -> usize {
    DEFAULT_CLIENT_BUFFER_CHUNKS
}

fn default_drain_grace_period() -> Duration {
    parse_or(DEFAULT_DRAIN_GRACE_PERIOD, Duration::from_secs(10))
}

fn default_start_timeout() -> Duration {
    parse_or(DEFAULT_START_TIMEOUT, Duration::from_secs(15))
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_reconnect_delay() -> Duration {
    parse_or(DEFAULT_RECONNECT_DELAY, Duration::from_secs(1))
}

fn default_upstream_connect_timeout() -> Duration {
    parse_or(DEFAULT_UPSTREAM_CONNECT_TIMEOUT, Duration::from_secs(10))
}

fn default_upstream_read_timeout() -> Duration {
    parse_or(DEFAULT_UPSTREAM_READ_TIMEOUT, Duration::from_secs(30))
}

fn default_hls_playlist_timeout() -> Duration {
    parse_or(DEFAULT_HLS_PLAYLIST_TIMEOUT, Duration::from_secs(5))
}

fn default_hls_segment_timeout() -> Duration {
    parse_or(DEFAULT_HLS_SEGMENT_TIMEOUT, Duration::from_secs(10))
}

fn default_status_report_interval() -> Duration {
    parse_or(DEFAULT_STATUS_REPORT_INTERVAL, Duration::from_secs(60))
}

fn default_user_agent() -> String {
    format!("{}/{}", DEFAULT_USER_AGENT, env!("CARGO_PKG_VERSION"))
}

fn default_cb_failure_threshold() -> u32 {
    DEFAULT_CB_FAILURE_THRESHOLD
}

fn default_cb_reset_timeout() -> Duration {
    parse_or(DEFAULT_CB_RESET_TIMEOUT, Duration::from_secs(30))
}

fn default_cb_half_open_max() -> u32 {
    DEFAULT_CB_HALF_OPEN_MAX
}

fn default_cb_operation_timeout() -> Duration {
    parse_or(DEFAULT_CB_OPERATION_TIMEOUT, Duration::from_secs(10))
}

fn default_acceptable_status_codes() -> Vec<String> {
    vec!["2xx".to_string()]
}

fn default_ffprobe_command() -> String {
    DEFAULT_FFPROBE_COMMAND.to_string()
}

fn default_probe_timeout() -> Duration {
    parse_or(DEFAULT_PROBE_TIMEOUT, Duration::from_secs(10))
}

fn default_probe_cache_ttl() -> Duration {
    parse_or(DEFAULT_PROBE_CACHE_TTL, Duration::from_secs(3600))
}

fn default_probe_error_ttl() -> Duration {
    parse_or(DEFAULT_PROBE_ERROR_TTL, Duration::from_secs(60))
}

fn default_probe_cleanup_interval() -> Duration {
    parse_or(DEFAULT_PROBE_CLEANUP_INTERVAL, Duration::from_secs(300))
}

fn default_analyze_duration_us() -> u64 {
    DEFAULT_ANALYZE_DURATION_US
}

fn default_probe_size_bytes() -> u64 {
    DEFAULT_PROBE_SIZE_BYTES
}

fn default_manifest_fetch_timeout() -> Duration {
    parse_or(DEFAULT_MANIFEST_FETCH_TIMEOUT, Duration::from_secs(5))
}

fn default_max_manifest_bytes() -> usize {
    DEFAULT_MAX_MANIFEST_BYTES
}

fn default_output_args() -> Vec<String> {
    vec!["-c".to_string(), "copy".to_string()]
}

impl Config {
    /// Load configuration from defaults, the TOML file and `M3U_RELAY__*` env vars.
    ///
    /// A missing file is created with the default configuration.
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if !Path::new(config_file).exists() {
            let contents = toml::to_string_pretty(&Self::default())?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
        }

        Self::figment(config_file).extract().map_err(Into::into)
    }

    /// Layered provider stack, exposed for callers that want to add their own layers
    pub fn figment(config_file: &str) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Reject values the services cannot run with
    pub fn validate(&self) -> Result<(), String> {
        self.circuitbreaker.global.validate()?;
        for (name, profile) in &self.circuitbreaker.profiles {
            profile
                .validate()
                .map_err(|e| format!("circuitbreaker.profiles.{name}: {e}"))?;
        }
        if self.relay.client_buffer_chunks == 0 {
            return Err("relay.client_buffer_chunks must be at least 1".to_string());
        }
        for channel in &self.channels {
            if channel.sources.is_empty() {
                return Err(format!("channel '{}' has no sources", channel.id));
            }
        }
        Ok(())
    }
}
