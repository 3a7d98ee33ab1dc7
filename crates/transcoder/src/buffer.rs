//! Adaptive buffer monitor.
//!
//! One monitor per session accumulates encoder progress samples and estimates how far
//! the transcoder is ahead of the player. The estimate is advisory: nothing in the
//! delivery path waits on it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::progress::EncoderProgress;

const HISTORY: usize = 64;
const TREND_WINDOW: usize = 10;
const LOW_WATERMARK: i64 = 3;
const HIGH_WATERMARK: i64 = 15;

/// One encoder-progress observation.
#[derive(Debug, Clone, Serialize)]
pub struct BufferMetricsSample {
    pub speed: f64,
    pub fps: f64,
    pub frames: u64,
    pub segments_generated: u64,
    pub segments_consumed: u64,
    pub timestamp: DateTime<Utc>,
}

impl BufferMetricsSample {
    fn buffered(&self) -> i64 {
        self.segments_generated as i64 - self.segments_consumed as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferHealth {
    Unknown,
    Critical,
    Low,
    Healthy,
    Surplus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Player should buffer more aggressively.
    PreloadMore,
    Steady,
    /// Transcoder is far ahead; segment production can slow down.
    Throttle,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStatusReport {
    pub health: BufferHealth,
    pub recommendation: Recommendation,
    pub buffered_segments: i64,
    pub segments_generated: u64,
    pub segments_consumed: u64,
    pub trend_segments_per_sec: f64,
    pub mean_speed: f64,
    pub latest_fps: f64,
    pub samples: usize,
    pub encode_finished: bool,
}

#[derive(Debug)]
pub struct AdaptiveBufferMonitor {
    segment_secs: u32,
    samples: VecDeque<BufferMetricsSample>,
    consumed: u64,
    finished: bool,
}

impl AdaptiveBufferMonitor {
    pub fn new(segment_secs: u32) -> Self {
        Self {
            segment_secs: segment_secs.max(1),
            samples: VecDeque::with_capacity(HISTORY),
            consumed: 0,
            finished: false,
        }
    }

    pub fn record_metrics(&mut self, sample: BufferMetricsSample) {
        if self.samples.len() == HISTORY {
            self.samples.pop_front();
        }
        self.consumed = self.consumed.max(sample.segments_consumed);
        self.samples.push_back(sample);
    }

    /// Convert a progress snapshot into a sample using the current consumption count.
    pub fn record_progress(&mut self, progress: &EncoderProgress) {
        let generated = (progress.out_time.as_secs_f64() / self.segment_secs as f64).floor() as u64;
        self.finished |= progress.finished;
        self.record_metrics(BufferMetricsSample {
            speed: progress.speed,
            fps: progress.fps,
            frames: progress.frame,
            segments_generated: generated,
            segments_consumed: self.consumed,
            timestamp: Utc::now(),
        });
    }

    /// The player fetched segment `index` (relative to the session start).
    pub fn record_consumed(&mut self, index: u32) {
        self.consumed = self.consumed.max(index as u64 + 1);
    }

    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    pub fn status_report(&self) -> BufferStatusReport {
        let Some(latest) = self.samples.back() else {
            return BufferStatusReport {
                health: BufferHealth::Unknown,
                recommendation: Recommendation::Steady,
                buffered_segments: 0,
                segments_generated: 0,
                segments_consumed: self.consumed,
                trend_segments_per_sec: 0.0,
                mean_speed: 0.0,
                latest_fps: 0.0,
                samples: 0,
                encode_finished: self.finished,
            };
        };

        let buffered = latest.segments_generated as i64 - self.consumed as i64;
        let window: Vec<&BufferMetricsSample> =
            self.samples.iter().rev().take(TREND_WINDOW).collect();
        let mean_speed = window.iter().map(|s| s.speed).sum::<f64>() / window.len() as f64;
        let trend = trend(&window);

        let (health, recommendation) = if self.finished {
            (BufferHealth::Healthy, Recommendation::Steady)
        } else if buffered <= 1 && mean_speed < 1.0 {
            (BufferHealth::Critical, Recommendation::PreloadMore)
        } else if buffered < LOW_WATERMARK || (mean_speed < 1.0 && trend < 0.0) {
            (BufferHealth::Low, Recommendation::PreloadMore)
        } else if buffered > HIGH_WATERMARK && mean_speed >= 1.0 {
            (BufferHealth::Surplus, Recommendation::Throttle)
        } else {
            (BufferHealth::Healthy, Recommendation::Steady)
        };

        BufferStatusReport {
            health,
            recommendation,
            buffered_segments: buffered,
            segments_generated: latest.segments_generated,
            segments_consumed: self.consumed,
            trend_segments_per_sec: trend,
            mean_speed,
            latest_fps: latest.fps,
            samples: self.samples.len(),
            encode_finished: self.finished,
        }
    }
}

/// Change in buffered segments per second across the window (newest first).
fn trend(window: &[&BufferMetricsSample]) -> f64 {
    let (Some(newest), Some(oldest)) = (window.first(), window.last()) else {
        return 0.0;
    };
    let elapsed = (newest.timestamp - oldest.timestamp).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return 0.0;
    }
    (newest.buffered() - oldest.buffered()) as f64 / elapsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(speed: f64, generated: u64, consumed: u64, at_secs: i64) -> BufferMetricsSample {
        BufferMetricsSample {
            speed,
            fps: speed * 24.0,
            frames: generated * 48,
            segments_generated: generated,
            segments_consumed: consumed,
            timestamp: DateTime::from_timestamp(at_secs, 0).unwrap(),
        }
    }

    #[test]
    fn unknown_without_samples() {
        let monitor = AdaptiveBufferMonitor::new(2);
        let report = monitor.status_report();
        assert_eq!(report.health, BufferHealth::Unknown);
        assert_eq!(report.samples, 0);
    }

    #[test]
    fn slow_encoder_with_empty_buffer_is_critical() {
        let mut monitor = AdaptiveBufferMonitor::new(2);
        monitor.record_metrics(sample(0.8, 3, 2, 0));
        monitor.record_metrics(sample(0.7, 4, 3, 4));
        let report = monitor.status_report();
        assert_eq!(report.health, BufferHealth::Critical);
        assert_eq!(report.recommendation, Recommendation::PreloadMore);
    }

    #[test]
    fn draining_buffer_is_low() {
        let mut monitor = AdaptiveBufferMonitor::new(2);
        monitor.record_metrics(sample(0.9, 10, 2, 0));
        monitor.record_metrics(sample(0.9, 11, 6, 10));
        let report = monitor.status_report();
        assert_eq!(report.buffered_segments, 5);
        assert!(report.trend_segments_per_sec < 0.0);
        assert_eq!(report.health, BufferHealth::Low);
    }

    #[test]
    fn fast_encoder_far_ahead_is_surplus() {
        let mut monitor = AdaptiveBufferMonitor::new(2);
        monitor.record_metrics(sample(4.0, 10, 1, 0));
        monitor.record_metrics(sample(4.0, 30, 2, 10));
        let report = monitor.status_report();
        assert_eq!(report.health, BufferHealth::Surplus);
        assert_eq!(report.recommendation, Recommendation::Throttle);
    }

    #[test]
    fn progress_and_consumption_feed_the_estimate() {
        let mut monitor = AdaptiveBufferMonitor::new(2);
        monitor.record_consumed(1);
        monitor.record_progress(&EncoderProgress {
            frame: 480,
            fps: 60.0,
            speed: 2.5,
            out_time: std::time::Duration::from_secs(20),
            finished: false,
        });
        let report = monitor.status_report();
        assert_eq!(report.segments_generated, 10);
        assert_eq!(report.segments_consumed, 2);
        assert_eq!(report.buffered_segments, 8);
        assert_eq!(report.health, BufferHealth::Healthy);
    }

    #[test]
    fn history_is_bounded() {
        let mut monitor = AdaptiveBufferMonitor::new(2);
        for i in 0..200 {
            monitor.record_metrics(sample(1.0, i, 0, i as i64));
        }
        assert_eq!(monitor.status_report().samples, HISTORY);
    }
}
