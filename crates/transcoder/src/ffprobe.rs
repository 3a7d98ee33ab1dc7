use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TranscodeError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Media information extracted via ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub container: String,
    pub duration_secs: f64,
    pub video: Option<VideoStream>,
    pub audio: Vec<AudioStream>,
    pub subtitles: Vec<SubtitleStream>,
}

impl MediaInfo {
    /// Whether `track` is a valid relative audio index (`0:a:<track>`).
    pub fn has_audio_track(&self, track: u32) -> bool {
        (track as usize) < self.audio.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoStream {
    pub index: u32,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub framerate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioStream {
    pub index: u32,
    pub codec: String,
    pub channels: u32,
    pub language: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleStream {
    pub index: u32,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub is_forced: bool,
}

// Raw ffprobe JSON shapes.

#[derive(Deserialize)]
struct RawProbe {
    format: Option<RawFormat>,
    #[serde(default)]
    streams: Vec<RawStream>,
}

#[derive(Deserialize)]
struct RawFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct RawStream {
    #[serde(default)]
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    channels: Option<u32>,
    #[serde(default)]
    tags: RawTags,
    #[serde(default)]
    disposition: RawDisposition,
}

#[derive(Deserialize, Default)]
struct RawTags {
    language: Option<String>,
    title: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawDisposition {
    #[serde(default)]
    default: u8,
    #[serde(default)]
    forced: u8,
}

/// Run ffprobe on a file and parse the JSON output.
pub async fn probe(ffprobe_path: &Path, file: &Path) -> Result<MediaInfo, TranscodeError> {
    let run = tokio::process::Command::new(ffprobe_path)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(file)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, run)
        .await
        .map_err(|_| TranscodeError::ProbeFailed("timed out".into()))?
        .map_err(|e| TranscodeError::ProbeFailed(format!("spawn failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TranscodeError::ProbeFailed(stderr.into_owned()));
    }

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(raw: &[u8]) -> Result<MediaInfo, TranscodeError> {
    let raw: RawProbe = serde_json::from_slice(raw)
        .map_err(|e| TranscodeError::ProbeFailed(format!("parse JSON: {e}")))?;
    let format = raw
        .format
        .ok_or_else(|| TranscodeError::ProbeFailed("missing 'format'".into()))?;

    let mut info = MediaInfo {
        container: format.format_name.unwrap_or_else(|| "unknown".into()),
        duration_secs: format
            .duration
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0),
        video: None,
        audio: Vec::new(),
        subtitles: Vec::new(),
    };

    for s in raw.streams {
        let codec = s.codec_name.unwrap_or_else(|| "unknown".into());
        match s.codec_type.as_deref() {
            Some("video") if info.video.is_none() => {
                info.video = Some(VideoStream {
                    index: s.index,
                    codec,
                    width: s.width.unwrap_or(0),
                    height: s.height.unwrap_or(0),
                    framerate: s.r_frame_rate.as_deref().and_then(parse_fraction),
                });
            }
            Some("audio") => info.audio.push(AudioStream {
                index: s.index,
                codec,
                channels: s.channels.unwrap_or(2),
                language: s.tags.language,
                title: s.tags.title,
                is_default: s.disposition.default == 1,
            }),
            Some("subtitle") => info.subtitles.push(SubtitleStream {
                index: s.index,
                codec,
                language: s.tags.language,
                title: s.tags.title,
                is_forced: s.disposition.forced == 1,
            }),
            _ => {}
        }
    }

    Ok(info)
}

fn parse_fraction(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let n: f64 = num.parse().ok()?;
        let d: f64 = den.parse().ok()?;
        if d > 0.0 { Some(n / d) } else { None }
    } else {
        s.parse().ok()
    }
}
