use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use reelcast_transcoder::{HwAccelPreference, TranscoderConfig};

/// Process-level settings, read once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub log_json: bool,
    pub sweep_interval: Duration,
    pub transcoder: TranscoderConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8096".to_string(),
            log_json: false,
            sweep_interval: Duration::from_secs(60),
            transcoder: TranscoderConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let tc = &mut config.transcoder;

        if let Some(bind) = lookup("REELCAST_BIND") {
            config.bind = bind;
        }
        if let Some(format) = lookup("REELCAST_LOG_FORMAT") {
            config.log_json = format.eq_ignore_ascii_case("json");
        }
        if let Some(secs) = lookup("REELCAST_SWEEP_SECS") {
            let secs: u64 = secs.parse().context("REELCAST_SWEEP_SECS must be an integer")?;
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(dir) = lookup("REELCAST_TRANSCODE_DIR") {
            tc.transcode_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("REELCAST_CACHE_DIR") {
            tc.cache_dir = PathBuf::from(dir);
        }
        if let Some(max) = lookup("REELCAST_MAX_TRANSCODES") {
            tc.max_concurrent = max
                .parse()
                .context("REELCAST_MAX_TRANSCODES must be an integer")?;
        }
        if let Some(path) = lookup("REELCAST_FFMPEG") {
            tc.ffmpeg_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("REELCAST_FFPROBE") {
            tc.ffprobe_path = PathBuf::from(path);
        }
        if let Some(mode) = lookup("REELCAST_HW_ACCEL") {
            tc.hw_accel = mode
                .parse::<HwAccelPreference>()
                .map_err(anyhow::Error::msg)
                .context("invalid REELCAST_HW_ACCEL")?;
        }
        if let Some(height) = lookup("REELCAST_TARGET_HEIGHT") {
            let height = height.trim();
            tc.target_height = if height.is_empty() || height == "source" {
                None
            } else {
                Some(
                    height
                        .parse()
                        .context("REELCAST_TARGET_HEIGHT must be a pixel height")?,
                )
            };
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind, "0.0.0.0:8096");
        assert!(!config.log_json);
        assert_eq!(config.transcoder.max_concurrent, 2);
        assert_eq!(config.transcoder.target_height, None);
    }

    #[test]
    fn reads_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("REELCAST_BIND", "127.0.0.1:9000"),
            ("REELCAST_LOG_FORMAT", "JSON"),
            ("REELCAST_MAX_TRANSCODES", "4"),
            ("REELCAST_HW_ACCEL", "software"),
            ("REELCAST_TARGET_HEIGHT", "720"),
            ("REELCAST_SWEEP_SECS", "30"),
            ("REELCAST_TRANSCODE_DIR", "/var/tmp/rc"),
        ]))
        .unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000");
        assert!(config.log_json);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.transcoder.max_concurrent, 4);
        assert_eq!(config.transcoder.hw_accel, HwAccelPreference::Software);
        assert_eq!(config.transcoder.target_height, Some(720));
        assert_eq!(config.transcoder.transcode_dir, PathBuf::from("/var/tmp/rc"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(ServerConfig::from_lookup(lookup(&[("REELCAST_MAX_TRANSCODES", "lots")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("REELCAST_HW_ACCEL", "voodoo")])).is_err());
    }
}
