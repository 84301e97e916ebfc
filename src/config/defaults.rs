/// Configuration default values
///
/// Central location for every default used by the configuration structs.
// Web server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

// Relay defaults
pub const DEFAULT_FFMPEG_COMMAND: &str = "ffmpeg";
pub const DEFAULT_CLIENT_BUFFER_CHUNKS: usize = 512;
pub const DEFAULT_DRAIN_GRACE_PERIOD: &str = "10s";
pub const DEFAULT_START_TIMEOUT: &str = "15s";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_DELAY: &str = "1s";
pub const DEFAULT_UPSTREAM_CONNECT_TIMEOUT: &str = "10s";
pub const DEFAULT_UPSTREAM_READ_TIMEOUT: &str = "30s";
pub const DEFAULT_STATUS_REPORT_INTERVAL: &str = "1m";
pub const DEFAULT_HLS_PLAYLIST_TIMEOUT: &str = "5s";
pub const DEFAULT_HLS_SEGMENT_TIMEOUT: &str = "10s";
pub const DEFAULT_USER_AGENT: &str = "m3u-relay";

// Circuit breaker defaults
pub const DEFAULT_CB_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_CB_RESET_TIMEOUT: &str = "30s";
pub const DEFAULT_CB_HALF_OPEN_MAX: u32 = 2;
pub const DEFAULT_CB_OPERATION_TIMEOUT: &str = "10s";

// Probe defaults
pub const DEFAULT_FFPROBE_COMMAND: &str = "ffprobe";
pub const DEFAULT_PROBE_TIMEOUT: &str = "10s";
pub const DEFAULT_PROBE_CACHE_TTL: &str = "1h";
pub const DEFAULT_PROBE_ERROR_TTL: &str = "1m";
pub const DEFAULT_PROBE_CLEANUP_INTERVAL: &str = "5m";
pub const DEFAULT_ANALYZE_DURATION_US: u64 = 5_000_000;
pub const DEFAULT_PROBE_SIZE_BYTES: u64 = 5_000_000;

// Classification defaults
pub const DEFAULT_MANIFEST_FETCH_TIMEOUT: &str = "5s";
pub const DEFAULT_MAX_MANIFEST_BYTES: usize = 256 * 1024;
