#![allow(
    clippy::collapsible_if,
    clippy::redundant_closure,
    clippy::unused_async
)]
pub mod buffer;
pub mod cache;
pub mod command;
pub mod ffprobe;
pub mod gpu;
pub mod hls;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod session;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("source not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),
    #[error("failed to start transcoder: {0}")]
    SpawnFailed(String),
    #[error("transcoder exited with {code:?}: {stderr}")]
    ProcessExited { code: Option<i32>, stderr: String },
    #[error("stream not ready, retry in {}s", retry_after.as_secs())]
    NotReady { retry_after: Duration },
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("segment not found: {0}")]
    SegmentNotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Global transcoder configuration.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Working root; every session gets its own subdirectory.
    pub transcode_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub max_concurrent: usize,
    pub segment_secs: u32,
    pub idle_timeout: Duration,
    pub absolute_timeout: Duration,
    /// Untracked processes and directories younger than this are left alone by the sweep.
    pub orphan_grace: Duration,
    /// Time between the graceful and the forced termination signal.
    pub kill_grace: Duration,
    pub ready_timeout: Duration,
    pub seek_ready_timeout: Duration,
    pub join_ready_timeout: Duration,
    pub poll_interval: Duration,
    pub segment_wait: Duration,
    pub retry_after: Duration,
    pub hw_accel: HwAccelPreference,
    /// Downscale target; `None` keeps the source resolution.
    pub target_height: Option<u32>,
    pub probe_sources: bool,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            transcode_dir: PathBuf::from("/tmp/reelcast_transcode"),
            cache_dir: PathBuf::from("/tmp/reelcast_segments"),
            max_concurrent: 2,
            segment_secs: 2,
            idle_timeout: Duration::from_secs(5 * 60),
            absolute_timeout: Duration::from_secs(30 * 60),
            orphan_grace: Duration::from_secs(15),
            kill_grace: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(60),
            seek_ready_timeout: Duration::from_secs(15),
            join_ready_timeout: Duration::from_secs(8),
            poll_interval: Duration::from_millis(250),
            segment_wait: Duration::from_secs(5),
            retry_after: Duration::from_secs(5),
            hw_accel: HwAccelPreference::Auto,
            target_height: None,
            probe_sources: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwAccel {
    Nvenc,
    Vaapi,
    Qsv,
    VideoToolbox,
}

impl HwAccel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nvenc => "nvenc",
            Self::Vaapi => "vaapi",
            Self::Qsv => "qsv",
            Self::VideoToolbox => "videotoolbox",
        }
    }
}

/// How the hardware detector should pick an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwAccelPreference {
    Auto,
    Software,
    Prefer(HwAccel),
}

impl std::str::FromStr for HwAccelPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "sw" | "software" | "cpu" | "none" => Ok(Self::Software),
            "nvenc" | "nvidia" | "cuda" => Ok(Self::Prefer(HwAccel::Nvenc)),
            "vaapi" => Ok(Self::Prefer(HwAccel::Vaapi)),
            "qsv" | "intel" => Ok(Self::Prefer(HwAccel::Qsv)),
            "videotoolbox" | "vt" => Ok(Self::Prefer(HwAccel::VideoToolbox)),
            other => Err(format!("unknown hardware acceleration mode '{other}'")),
        }
    }
}
