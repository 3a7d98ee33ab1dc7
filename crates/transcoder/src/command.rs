//! ffmpeg invocation for segmented HLS output.
//!
//! Exactly one video and one audio stream are mapped, and keyframes are forced on
//! every segment boundary so segment `N` always covers `[N * seg, (N + 1) * seg)`.

use std::path::Path;

use crate::gpu::HardwareProfile;
use crate::hls;

/// Everything needed to start one transcode.
#[derive(Debug, Clone)]
pub struct TranscodeJob<'a> {
    pub source: &'a Path,
    pub output_dir: &'a Path,
    pub audio_track: u32,
    pub seek_offset: Option<u32>,
    pub segment_secs: u32,
    pub target_height: Option<u32>,
    pub profile: &'a HardwareProfile,
}

pub fn build_hls_args(job: &TranscodeJob<'_>) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-nostdin",
        "-y",
        "-loglevel",
        "warning",
        "-nostats",
        "-progress",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.extend(job.profile.decoder_args.iter().cloned());

    // Input-side seek: fast, lands on the nearest preceding keyframe.
    if let Some(offset) = job.seek_offset {
        args.extend(["-ss".into(), offset.to_string()]);
    }

    args.extend(["-i".into(), job.source.to_string_lossy().into_owned()]);

    args.extend([
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        format!("0:a:{}", job.audio_track),
    ]);

    if let Some(height) = job.target_height {
        args.extend(["-vf".into(), job.profile.scale_filter_for(height)]);
    }

    args.extend(["-c:v".into(), job.profile.encoder.clone()]);
    args.extend(job.profile.encoder_args.iter().cloned());

    let seg = job.segment_secs.max(1);
    args.extend([
        "-force_key_frames".into(),
        format!("expr:gte(t,n_forced*{seg})"),
        "-sc_threshold".into(),
        "0".into(),
    ]);

    // Audio: always AAC stereo for HLS compatibility
    args.extend([
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-ac".into(),
        "2".into(),
    ]);

    if let Some(offset) = job.seek_offset {
        args.extend(["-output_ts_offset".into(), offset.to_string()]);
    }

    let seg_pattern = job.output_dir.join(hls::segment_pattern());
    let playlist = job.output_dir.join(hls::PLAYLIST_NAME);

    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        seg.to_string(),
        "-hls_list_size".into(),
        "0".into(),
        "-hls_playlist_type".into(),
        "event".into(),
        "-hls_flags".into(),
        "independent_segments+temp_file".into(),
        "-start_number".into(),
        "0".into(),
        "-hls_segment_filename".into(),
        seg_pattern.to_string_lossy().into_owned(),
        playlist.to_string_lossy().into_owned(),
    ]);

    args
}
