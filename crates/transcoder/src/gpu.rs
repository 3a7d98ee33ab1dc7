//! GPU hardware acceleration detection.
//!
//! Probes for available encoders by running `ffmpeg -encoders`, verifies the best
//! candidate with a one-frame test encode and memoizes the resulting
//! [`HardwareProfile`]. Any failure along the way degrades to software encoding.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{HwAccel, HwAccelPreference};

const VAAPI_DEVICE: &str = "/dev/dri/renderD128";
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Detected GPU capabilities.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GpuCapabilities {
    pub nvenc: bool,
    pub vaapi: bool,
    pub qsv: bool,
    pub videotoolbox: bool,
}

impl GpuCapabilities {
    pub fn none() -> Self {
        Self {
            nvenc: false,
            vaapi: false,
            qsv: false,
            videotoolbox: false,
        }
    }

    /// Parse `ffmpeg -encoders` output. VAAPI also needs a render node.
    pub fn from_encoder_list(encoders: &str, vaapi_device: bool) -> Self {
        Self {
            nvenc: encoders.contains("h264_nvenc"),
            vaapi: vaapi_device && encoders.contains("h264_vaapi"),
            qsv: encoders.contains("h264_qsv"),
            videotoolbox: encoders.contains("h264_videotoolbox"),
        }
    }

    pub fn has(&self, accel: HwAccel) -> bool {
        match accel {
            HwAccel::Nvenc => self.nvenc,
            HwAccel::Vaapi => self.vaapi,
            HwAccel::Qsv => self.qsv,
            HwAccel::VideoToolbox => self.videotoolbox,
        }
    }

    /// Pick the best available HW accelerator, or None for CPU.
    pub fn best(&self) -> Option<HwAccel> {
        if self.nvenc {
            Some(HwAccel::Nvenc)
        } else if self.qsv {
            Some(HwAccel::Qsv)
        } else if self.vaapi {
            Some(HwAccel::Vaapi)
        } else if self.videotoolbox {
            Some(HwAccel::VideoToolbox)
        } else {
            None
        }
    }
}

/// Everything the pipeline needs to know about the encoder it should use.
/// The argument lists are embedded verbatim into the transcoder invocation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HardwareProfile {
    pub accel: Option<HwAccel>,
    pub encoder: String,
    pub decoder_args: Vec<String>,
    pub encoder_args: Vec<String>,
    /// Scale filter with a `{h}` placeholder for the target height.
    pub scale_filter: String,
    pub platform: String,
    pub detected_at: DateTime<Utc>,
}

impl HardwareProfile {
    pub fn software() -> Self {
        Self {
            accel: None,
            encoder: "libx264".into(),
            decoder_args: Vec::new(),
            encoder_args: strings(&["-preset", "veryfast", "-crf", "23"]),
            scale_filter: "scale=-2:{h}".into(),
            platform: platform_tag(),
            detected_at: Utc::now(),
        }
    }

    pub fn for_accel(accel: HwAccel) -> Self {
        let (encoder, decoder_args, encoder_args, scale_filter) = match accel {
            HwAccel::Nvenc => (
                "h264_nvenc",
                strings(&["-hwaccel", "cuda"]),
                strings(&["-preset", "p4", "-cq", "23"]),
                "scale=-2:{h}",
            ),
            HwAccel::Vaapi => (
                "h264_vaapi",
                strings(&[
                    "-hwaccel",
                    "vaapi",
                    "-hwaccel_output_format",
                    "vaapi",
                    "-vaapi_device",
                    VAAPI_DEVICE,
                ]),
                strings(&["-qp", "23"]),
                "scale_vaapi=w=-2:h={h}",
            ),
            HwAccel::Qsv => (
                "h264_qsv",
                strings(&["-hwaccel", "qsv"]),
                strings(&["-preset", "veryfast", "-global_quality", "23"]),
                "scale=-2:{h}",
            ),
            HwAccel::VideoToolbox => (
                "h264_videotoolbox",
                strings(&["-hwaccel", "videotoolbox"]),
                strings(&["-q:v", "60"]),
                "scale=-2:{h}",
            ),
        };

        Self {
            accel: Some(accel),
            encoder: encoder.into(),
            decoder_args,
            encoder_args,
            scale_filter: scale_filter.into(),
            platform: platform_tag(),
            detected_at: Utc::now(),
        }
    }

    pub fn accel_name(&self) -> &'static str {
        self.accel.map(HwAccel::as_str).unwrap_or("none")
    }

    pub fn scale_filter_for(&self, height: u32) -> String {
        self.scale_filter.replace("{h}", &height.to_string())
    }
}

/// Memoizing front for hardware detection. Built once at startup and shared.
pub struct HardwareDetector {
    ffmpeg_path: PathBuf,
    preference: HwAccelPreference,
    profile: RwLock<Option<Arc<HardwareProfile>>>,
    probing: tokio::sync::Mutex<()>,
}

impl HardwareDetector {
    pub fn new(ffmpeg_path: PathBuf, preference: HwAccelPreference) -> Self {
        Self {
            ffmpeg_path,
            preference,
            profile: RwLock::new(None),
            probing: tokio::sync::Mutex::new(()),
        }
    }

    /// Detector that never probes and always answers with `profile`.
    pub fn fixed(profile: HardwareProfile) -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            preference: HwAccelPreference::Software,
            profile: RwLock::new(Some(Arc::new(profile))),
            probing: tokio::sync::Mutex::new(()),
        }
    }

    /// Return the cached profile, probing the host on first use.
    pub async fn detect(&self) -> Arc<HardwareProfile> {
        if let Some(profile) = self.profile.read().clone() {
            return profile;
        }

        let _guard = self.probing.lock().await;
        if let Some(profile) = self.profile.read().clone() {
            return profile;
        }

        let profile = Arc::new(probe_profile(&self.ffmpeg_path, self.preference).await);
        *self.profile.write() = Some(profile.clone());
        profile
    }

    /// Re-run detection and replace the cached profile.
    pub async fn redetect(&self) -> Arc<HardwareProfile> {
        let _guard = self.probing.lock().await;
        let profile = Arc::new(probe_profile(&self.ffmpeg_path, self.preference).await);
        *self.profile.write() = Some(profile.clone());
        info!(accel = profile.accel_name(), "hardware profile recomputed");
        profile
    }
}

async fn probe_profile(ffmpeg_path: &Path, preference: HwAccelPreference) -> HardwareProfile {
    if preference == HwAccelPreference::Software {
        info!("hardware acceleration disabled by configuration");
        return HardwareProfile::software();
    }

    let caps = detect(ffmpeg_path).await;
    let candidate = match preference {
        HwAccelPreference::Prefer(accel) if caps.has(accel) => Some(accel),
        HwAccelPreference::Prefer(accel) => {
            warn!(
                requested = accel.as_str(),
                "requested accelerator not available, picking best available"
            );
            caps.best()
        }
        _ => caps.best(),
    };

    let Some(accel) = candidate else {
        return HardwareProfile::software();
    };

    let profile = HardwareProfile::for_accel(accel);
    match verify_encoder(ffmpeg_path, accel).await {
        Ok(()) => {
            info!(accel = accel.as_str(), encoder = %profile.encoder, "hardware encoder verified");
            profile
        }
        Err(e) => {
            warn!(accel = accel.as_str(), error = %e, "hardware test encode failed, using software");
            HardwareProfile::software()
        }
    }
}

/// Detect available hardware encoders by querying ffmpeg.
pub async fn detect(ffmpeg_path: &Path) -> GpuCapabilities {
    let encoders = match get_encoders(ffmpeg_path).await {
        Ok(s) => s,
        Err(e) => {
            info!(error = %e, "could not query ffmpeg encoders, assuming CPU-only");
            return GpuCapabilities::none();
        }
    };

    let caps = GpuCapabilities::from_encoder_list(&encoders, vaapi_device_exists());
    info!(?caps, "GPU encoder detection complete");
    caps
}

async fn get_encoders(ffmpeg_path: &Path) -> Result<String, String> {
    let output = tokio::process::Command::new(ffmpeg_path)
        .args(["-hide_banner", "-encoders"])
        .output()
        .await
        .map_err(|e| format!("spawn ffmpeg: {e}"))?;

    if !output.status.success() {
        return Err("ffmpeg -encoders failed".into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Encode a single synthetic frame to prove the encoder actually works on this host.
async fn verify_encoder(ffmpeg_path: &Path, accel: HwAccel) -> Result<(), String> {
    let profile = HardwareProfile::for_accel(accel);
    let mut args = strings(&["-hide_banner", "-loglevel", "error"]);
    if accel == HwAccel::Vaapi {
        args.extend(strings(&["-vaapi_device", VAAPI_DEVICE]));
    }
    args.extend(strings(&[
        "-f",
        "lavfi",
        "-i",
        "color=c=black:s=256x144:d=0.1",
        "-frames:v",
        "1",
    ]));
    if accel == HwAccel::Vaapi {
        args.extend(strings(&["-vf", "format=nv12,hwupload"]));
    }
    args.extend(["-c:v".to_string(), profile.encoder.clone()]);
    args.extend(strings(&["-f", "null", "-"]));

    let run = tokio::process::Command::new(ffmpeg_path)
        .args(&args)
        .stdin(std::process::Stdio::null())
        .output();

    let output = tokio::time::timeout(VERIFY_TIMEOUT, run)
        .await
        .map_err(|_| "test encode timed out".to_string())?
        .map_err(|e| format!("spawn ffmpeg: {e}"))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Check if a VAAPI device exists (Linux).
pub fn vaapi_device_exists() -> bool {
    Path::new(VAAPI_DEVICE).exists()
}

fn platform_tag() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_accelerator_preference() {
        let caps = GpuCapabilities {
            nvenc: true,
            vaapi: true,
            qsv: false,
            videotoolbox: false,
        };
        assert!(matches!(caps.best(), Some(HwAccel::Nvenc)));

        let caps = GpuCapabilities {
            nvenc: false,
            vaapi: true,
            qsv: true,
            videotoolbox: false,
        };
        assert!(matches!(caps.best(), Some(HwAccel::Qsv)));

        assert!(GpuCapabilities::none().best().is_none());
    }

    #[test]
    fn vaapi_requires_render_node() {
        let listing = " V..... h264_vaapi   H.264/AVC (VAAPI)\n";
        assert!(!GpuCapabilities::from_encoder_list(listing, false).vaapi);
        assert!(GpuCapabilities::from_encoder_list(listing, true).vaapi);
    }

    #[test]
    fn scale_filter_substitutes_height() {
        assert_eq!(HardwareProfile::software().scale_filter_for(720), "scale=-2:720");
        assert_eq!(
            HardwareProfile::for_accel(HwAccel::Vaapi).scale_filter_for(480),
            "scale_vaapi=w=-2:h=480"
        );
    }

    #[tokio::test]
    async fn missing_binary_degrades_to_software() {
        let detector = HardwareDetector::new(
            PathBuf::from("/nonexistent/reelcast-ffmpeg"),
            HwAccelPreference::Auto,
        );
        let profile = detector.detect().await;
        assert_eq!(profile.encoder, "libx264");
        assert!(profile.accel.is_none());

        // Memoized: same allocation on the second call.
        let again = detector.detect().await;
        assert!(Arc::ptr_eq(&profile, &again));
    }

    #[tokio::test]
    async fn software_preference_skips_probe() {
        let detector = HardwareDetector::new(PathBuf::from("ffmpeg"), HwAccelPreference::Software);
        assert_eq!(detector.detect().await.accel_name(), "none");
    }
}
