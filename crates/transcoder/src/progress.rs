//! Parser for ffmpeg's `-progress` key/value stream.
//!
//! ffmpeg emits blocks of `key=value` lines terminated by `progress=continue`
//! (or `progress=end` on the final block).

use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderProgress {
    pub frame: u64,
    pub fps: f64,
    /// Encode speed as a multiple of realtime.
    pub speed: f64,
    /// Media time written so far, relative to the transcoder's start offset.
    pub out_time: Duration,
    pub finished: bool,
}

#[derive(Debug, Default)]
pub struct ProgressParser {
    current: EncoderProgress,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a completed snapshot at each block boundary.
    pub fn push_line(&mut self, line: &str) -> Option<EncoderProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key.trim() {
            "frame" => {
                if let Ok(frame) = value.parse() {
                    self.current.frame = frame;
                }
            }
            "fps" => {
                if let Ok(fps) = value.parse() {
                    self.current.fps = fps;
                }
            }
            "speed" => {
                // "1.53x", or "N/A" before the first frame
                if let Ok(speed) = value.trim_end_matches('x').trim().parse() {
                    self.current.speed = speed;
                }
            }
            // out_time_ms is microseconds despite its name
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.current.out_time = Duration::from_micros(us.max(0) as u64);
                }
            }
            "progress" => {
                self.current.finished = value == "end";
                return Some(self.current.clone());
            }
            _ => {}
        }
        None
    }
}
