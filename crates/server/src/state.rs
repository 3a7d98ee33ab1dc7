use std::sync::Arc;

use reelcast_transcoder::TranscoderConfig;
use reelcast_transcoder::cache::SegmentCache;
use reelcast_transcoder::gpu::HardwareDetector;
use reelcast_transcoder::pipeline::TranscodePipeline;
use reelcast_transcoder::session::SessionRegistry;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TranscodePipeline>,
    pub registry: SessionRegistry,
    pub cache: Arc<SegmentCache>,
    pub detector: Arc<HardwareDetector>,
}

impl AppState {
    pub fn new(config: TranscoderConfig) -> Self {
        let detector = Arc::new(HardwareDetector::new(
            config.ffmpeg_path.clone(),
            config.hw_accel,
        ));
        Self::with_detector(config, detector)
    }

    /// Build around an existing detector, e.g. one with a fixed profile.
    pub fn with_detector(config: TranscoderConfig, detector: Arc<HardwareDetector>) -> Self {
        let cache = Arc::new(SegmentCache::new(config.cache_dir.clone()));
        let registry = SessionRegistry::new(config);
        let pipeline = Arc::new(TranscodePipeline::new(
            registry.clone(),
            cache.clone(),
            detector.clone(),
        ));
        Self {
            pipeline,
            registry,
            cache,
            detector,
        }
    }
}
