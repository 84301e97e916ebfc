//! Stream Probing Service
//!
//! Runs the external `ffprobe` tool against an upstream URL and reduces its
//! JSON report to the codec summary the relay cares about.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::errors::ProbeError;
use crate::utils::url::UrlUtils;

/// Codec and container summary of a stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CodecInfo {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// `"1920x1080"` when both dimensions are known
    pub resolution: Option<String>,
    pub framerate: Option<f64>,
    pub video_bitrate: Option<u64>,
    pub audio_bitrate: Option<u64>,
    pub overall_bitrate: Option<u64>,
    pub audio_channels: Option<u32>,
    pub audio_sample_rate: Option<u32>,
    pub container_format: Option<String>,
    pub duration: Option<f64>,
}

impl CodecInfo {
    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }
}

/// External media probe
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, url: &str) -> Result<CodecInfo, ProbeError>;
}

/// `ffprobe` backed prober
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_command: String,
    probe_timeout: Duration,
    analyze_duration_us: u64,
    probe_size_bytes: u64,
}

impl FfprobeProber {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            ffprobe_command: config.ffprobe_command.clone(),
            probe_timeout: config.timeout,
            analyze_duration_us: config.analyze_duration_us,
            probe_size_bytes: config.probe_size_bytes,
        }
    }

    fn command(&self, url: &str) -> Command {
        let mut cmd = Command::new(&self.ffprobe_command);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_error",
            "-show_entries",
            "stream=index,codec_type,codec_name,bit_rate,width,height,r_frame_rate,avg_frame_rate,sample_rate,channels:format=format_name,duration,bit_rate",
        ])
        .arg("-analyzeduration")
        .arg(self.analyze_duration_us.to_string())
        .arg("-probesize")
        .arg(self.probe_size_bytes.to_string())
        .arg(url);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, url: &str) -> Result<CodecInfo, ProbeError> {
        debug!(url = %UrlUtils::redact(url), "Probing input stream");

        let output = tokio::time::timeout(self.probe_timeout, self.command(url).output())
            .await
            .map_err(|_| ProbeError::Timeout {
                url: url.to_string(),
                timeout: self.probe_timeout,
            })?
            .map_err(|e| ProbeError::Spawn {
                command: self.ffprobe_command.clone(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = match stderr.trim() {
                "" => format!("ffprobe exited with {}", output.status),
                trimmed => trimmed.to_string(),
            };
            return Err(ProbeError::failed(url, message));
        }

        let report: FfprobeOutput = serde_json::from_str(&stdout)
            .map_err(|e| ProbeError::failed(url, format!("unparseable ffprobe output: {e}")))?;

        let info = codec_info_from_report(url, report)?;
        debug!(
            url = %UrlUtils::redact(url),
            video = ?info.video_codec,
            audio = ?info.audio_codec,
            resolution = ?info.resolution,
            "Probe complete"
        );
        Ok(info)
    }
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
    error: Option<FfprobeError>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    bit_rate: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeError {
    code: Option<i32>,
    string: Option<String>,
}

fn codec_info_from_report(url: &str, report: FfprobeOutput) -> Result<CodecInfo, ProbeError> {
    if let Some(error) = report.error {
        let message = error.string.unwrap_or_else(|| "unknown ffprobe error".to_string());
        warn!(url = %UrlUtils::redact(url), code = ?error.code, "FFprobe reported error: {}", message);
        return Err(ProbeError::failed(url, format!("{message} (code: {:?})", error.code)));
    }

    let video = report
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = report
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    if video.is_none() && audio.is_none() {
        return Err(ProbeError::failed(url, "no audio or video streams detected"));
    }

    let width = video.and_then(|v| v.width);
    let height = video.and_then(|v| v.height);
    let framerate = video.and_then(|v| {
        v.avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| v.r_frame_rate.as_deref().and_then(parse_frame_rate))
    });

    Ok(CodecInfo {
        video_codec: video.and_then(|v| v.codec_name.as_deref()).map(normalize_codec_name),
        audio_codec: audio.and_then(|a| a.codec_name.as_deref()).map(normalize_codec_name),
        width,
        height,
        resolution: width.zip(height).map(|(w, h)| format!("{w}x{h}")),
        framerate,
        video_bitrate: video.and_then(|v| v.bit_rate.as_deref()).and_then(|b| b.parse().ok()),
        audio_bitrate: audio.and_then(|a| a.bit_rate.as_deref()).and_then(|b| b.parse().ok()),
        overall_bitrate: report
            .format
            .as_ref()
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|b| b.parse().ok()),
        audio_channels: audio.and_then(|a| a.channels),
        audio_sample_rate: audio.and_then(|a| a.sample_rate.as_deref()).and_then(|s| s.parse().ok()),
        container_format: report.format.as_ref().and_then(|f| f.format_name.clone()),
        duration: report
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse().ok()),
    })
}

/// `"30000/1001"` -> 29.97; `"0/0"` is treated as unknown
fn parse_frame_rate(value: &str) -> Option<f64> {
    let (num, den) = value.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if num <= 0.0 || den <= 0.0 {
        return None;
    }
    Some((num / den * 100.0).round() / 100.0)
}

/// Normalize codec names for comparison
pub fn normalize_codec_name(codec: &str) -> String {
    match codec.to_lowercase().as_str() {
        "h264" | "avc" | "avc1" => "h264".to_string(),
        "h265" | "hevc" | "hev1" | "hvc1" => "h265".to_string(),
        "aac" | "mp4a" => "aac".to_string(),
        "mp3" | "mp3float" => "mp3".to_string(),
        "ac3" | "ac-3" => "ac3".to_string(),
        "eac3" | "eac-3" => "eac3".to_string(),
        other => other.to_string(),
    }
}

/// Timestamped probe result used by API responses
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub url: String,
    pub codec_info: CodecInfo,
    pub probed_at: DateTime<Utc>,
}
