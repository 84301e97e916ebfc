//! Upstream byte sources for relay sessions
//!
//! A relay session never talks HTTP or spawns processes itself; it asks an
//! [`UpstreamFetcher`] to open a byte stream for an [`UpstreamRequest`]. The
//! default fetcher dispatches on the transport chosen for the stream:
//! direct passthrough, collapsed single-rendition HLS, or an external encoder.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::{RelayConfig, RelayProfileConfig};
use crate::streaming::classification::ClassificationResult;
use crate::streaming::collapsing::{
    CollapsingConfig, HlsFetcher, HttpHlsFetcher, spawn_collapsing_session,
};
use crate::utils::circuit_breaker::{CallOutcome, OutcomeError};
use crate::utils::url::UrlUtils;

/// Byte stream handed to a relay session
pub type UpstreamStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream responded with HTTP {0}")]
    Status(u16),
    #[error("Upstream connection failed: {0}")]
    Connect(String),
    #[error("Upstream stream error: {0}")]
    Stream(String),
    #[error("Upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("Encoder process failed: {0}")]
    Process(String),
}

impl UpstreamError {
    /// Outcome to record against the upstream's circuit breaker
    pub fn outcome(&self) -> CallOutcome {
        match self {
            Self::Status(status) => CallOutcome::Status(*status),
            other => CallOutcome::Failure(other.to_string()),
        }
    }
}

impl OutcomeError for UpstreamError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status(status) => Some(*status),
            _ => None,
        }
    }
}

/// How upstream bytes are obtained
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamTransport {
    /// Bytes relayed exactly as served
    Passthrough,
    /// One media playlist polled and its segments concatenated
    Collapse {
        playlist_url: String,
        target_duration: Option<f32>,
    },
    /// External encoder reading the upstream and writing MPEG-TS to stdout
    Remux {
        input_args: Vec<String>,
        output_args: Vec<String>,
    },
}

impl UpstreamTransport {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Collapse { .. } => "collapse",
            Self::Remux { .. } => "remux",
        }
    }

    /// Pick the transport for a stream.
    ///
    /// A relay profile always goes through the encoder. Without one, a
    /// collapse-eligible HLS stream is collapsed, any other HLS stream is
    /// remuxed (stream copy), and everything else is passed through.
    pub fn select(
        classification: Option<&ClassificationResult>,
        profile: Option<&RelayProfileConfig>,
    ) -> Self {
        if let Some(profile) = profile {
            return Self::Remux {
                input_args: profile.input_args.clone(),
                output_args: profile.output_args.clone(),
            };
        }

        match classification {
            Some(result) if result.eligible_for_collapse => match &result.selected_playlist_url {
                Some(playlist_url) => Self::Collapse {
                    playlist_url: playlist_url.clone(),
                    target_duration: result.target_duration,
                },
                None => Self::Passthrough,
            },
            Some(result) if result.requires_rewrite() => Self::Remux {
                input_args: Vec::new(),
                output_args: vec!["-c".to_string(), "copy".to_string()],
            },
            _ => Self::Passthrough,
        }
    }
}

/// What to open
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub url: String,
    /// Circuit breaker service name of `url`
    pub service_name: String,
    pub transport: UpstreamTransport,
}

impl UpstreamRequest {
    pub fn passthrough(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            service_name: UrlUtils::service_name(&url),
            url,
            transport: UpstreamTransport::Passthrough,
        }
    }
}

/// Opens upstream byte streams
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    /// Connect and return the byte stream. Connection-level failures
    /// (refused, non-success status, spawn failure) are returned here;
    /// failures after that surface as stream items.
    async fn open(&self, request: &UpstreamRequest) -> Result<UpstreamStream, UpstreamError>;
}

/// reqwest, collapsing and ffmpeg backed fetcher
pub struct DefaultUpstreamFetcher {
    client: reqwest::Client,
    hls: Arc<dyn HlsFetcher>,
    collapsing: CollapsingConfig,
    ffmpeg_command: String,
    user_agent: String,
}

impl DefaultUpstreamFetcher {
    pub fn new(client: reqwest::Client, config: &RelayConfig) -> Self {
        Self {
            hls: Arc::new(HttpHlsFetcher::new(client.clone())),
            client,
            collapsing: CollapsingConfig {
                playlist_timeout: config.hls_playlist_timeout,
                segment_timeout: config.hls_segment_timeout,
                ..CollapsingConfig::default()
            },
            ffmpeg_command: config.ffmpeg_command.clone(),
            user_agent: config.user_agent.clone(),
        }
    }

    /// Replace the playlist/segment fetcher used by the collapse transport
    pub fn with_hls_fetcher(mut self, hls: Arc<dyn HlsFetcher>) -> Self {
        self.hls = hls;
        self
    }

    async fn open_passthrough(&self, url: &str) -> Result<UpstreamStream, UpstreamError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Connect(format!("timed out: {e}"))
            } else {
                UpstreamError::Connect(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        debug!(
            url = %UrlUtils::redact(url),
            content_type = ?response.headers().get(reqwest::header::CONTENT_TYPE),
            "Upstream connected"
        );

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| UpstreamError::Stream(e.to_string())))
            .boxed())
    }

    fn open_collapse(&self, playlist_url: &str, target_duration: Option<f32>) -> UpstreamStream {
        spawn_collapsing_session(
            self.hls.clone(),
            playlist_url.to_string(),
            target_duration,
            self.collapsing.clone(),
        )
        .map(|chunk| chunk.map_err(|e| UpstreamError::Stream(e.to_string())))
        .boxed()
    }

    fn open_remux(
        &self,
        url: &str,
        input_args: &[String],
        output_args: &[String],
    ) -> Result<UpstreamStream, UpstreamError> {
        let args = encoder_args(url, &self.user_agent, input_args, output_args);
        debug!(command = %self.ffmpeg_command, args = ?args, "Starting encoder process");

        let mut cmd = Command::new(&self.ffmpeg_command);
        cmd.args(&args);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| UpstreamError::Process(format!("{}: {e}", self.ffmpeg_command)))?;
        info!(pid = ?child.id(), url = %UrlUtils::redact(url), "Encoder process started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpstreamError::Process("encoder stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "m3u_relay::encoder", "{}", line);
                }
            });
        }

        let stream = async_stream::try_stream! {
            let mut reader = ReaderStream::new(stdout);
            while let Some(chunk) = reader.next().await {
                let chunk = chunk.map_err(|e| UpstreamError::Stream(e.to_string()))?;
                yield chunk;
            }
            let status = child
                .wait()
                .await
                .map_err(|e| UpstreamError::Process(e.to_string()))?;
            if !status.success() {
                Err(UpstreamError::Process(format!("encoder exited with {status}")))?;
            }
        };
        Ok(stream.boxed())
    }
}

#[async_trait]
impl UpstreamFetcher for DefaultUpstreamFetcher {
    async fn open(&self, request: &UpstreamRequest) -> Result<UpstreamStream, UpstreamError> {
        match &request.transport {
            UpstreamTransport::Passthrough => self.open_passthrough(&request.url).await,
            UpstreamTransport::Collapse {
                playlist_url,
                target_duration,
            } => Ok(self.open_collapse(playlist_url, *target_duration)),
            UpstreamTransport::Remux {
                input_args,
                output_args,
            } => self.open_remux(&request.url, input_args, output_args),
        }
    }
}

/// Encoder command line: quiet logging, profile input args, the upstream as
/// input, profile output args, MPEG-TS on stdout.
fn encoder_args(
    url: &str,
    user_agent: &str,
    input_args: &[String],
    output_args: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostats", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if url.starts_with("http://") || url.starts_with("https://") {
        args.push("-user_agent".to_string());
        args.push(user_agent.to_string());
    }
    args.extend(input_args.iter().cloned());
    args.push("-i".to_string());
    args.push(url.to_string());
    args.extend(output_args.iter().cloned());
    args.extend(["-f", "mpegts", "pipe:1"].iter().map(|s| s.to_string()));
    args
}
