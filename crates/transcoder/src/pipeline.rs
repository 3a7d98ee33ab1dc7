//! Request-level orchestration of manifests, segments, seeks and teardown.
//!
//! The pipeline never touches transcoder processes directly; it asks the
//! [`SessionRegistry`] to start, touch or kill sessions and reads whatever the
//! transcoder has written into the session's output directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::BufferStatusReport;
use crate::cache::{SegmentCache, SegmentCacheKey};
use crate::command::{TranscodeJob, build_hls_args};
use crate::ffprobe::{self, MediaInfo};
use crate::gpu::{HardwareDetector, HardwareProfile};
use crate::session::{
    ExitInfo, ExitWatch, SessionKey, SessionRegistry, SessionTicket, SpawnedSession,
};
use crate::{TranscodeError, TranscoderConfig, hls};

/// Public path segments and manifests are served under.
pub const STREAM_PATH: &str = "/stream/transcode";

/// Selectors of one playback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub source: PathBuf,
    pub audio_track: u32,
    /// Carried through URLs only; subtitles are delivered out of band.
    pub subtitle_track: Option<u32>,
    pub seek_offset: Option<u32>,
}

impl StreamRequest {
    pub fn new(source: impl Into<PathBuf>, audio_track: u32) -> Self {
        Self {
            source: source.into(),
            audio_track,
            subtitle_track: None,
            seek_offset: None,
        }
    }

    pub fn with_subtitle(mut self, track: Option<u32>) -> Self {
        self.subtitle_track = track;
        self
    }

    pub fn with_seek(mut self, offset: Option<u32>) -> Self {
        self.seek_offset = offset;
        self
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.source.clone(), self.audio_track, self.seek_offset)
    }

    fn query(&self) -> String {
        let mut query = format!(
            "path={}&audio={}",
            urlencoding::encode(&self.source.to_string_lossy()),
            self.audio_track
        );
        if let Some(subtitle) = self.subtitle_track {
            query.push_str(&format!("&subtitle={subtitle}"));
        }
        if let Some(seek) = self.seek_offset {
            query.push_str(&format!("&seek={seek}"));
        }
        query
    }

    pub fn manifest_url(&self) -> String {
        format!("{STREAM_PATH}?{}&manifest=true", self.query())
    }

    pub fn segment_url(&self, segment: &str) -> String {
        format!("{STREAM_PATH}?{}&segment={segment}", self.query())
    }
}

#[derive(Debug, Clone)]
pub struct SegmentPayload {
    pub data: Bytes,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeekResponse {
    pub manifest_url: String,
    pub session_id: String,
    pub offset_secs: u32,
}

/// A session the caller should wait on.
struct Pending {
    key: SessionKey,
    instance: Uuid,
    output_dir: PathBuf,
    exit: Option<ExitWatch>,
    budget: Duration,
    joined: bool,
}

enum Begin {
    Ready(String),
    Waiting(Pending),
}

enum Readiness {
    Ready(String),
    Failed(ExitInfo),
    Gone,
    TimedOut,
}

pub struct TranscodePipeline {
    config: TranscoderConfig,
    registry: SessionRegistry,
    cache: Arc<SegmentCache>,
    detector: Arc<HardwareDetector>,
    /// Makes check-then-launch atomic per key on the request path.
    gates: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl TranscodePipeline {
    pub fn new(
        registry: SessionRegistry,
        cache: Arc<SegmentCache>,
        detector: Arc<HardwareDetector>,
    ) -> Self {
        Self {
            config: registry.config().clone(),
            registry,
            cache,
            detector,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    pub fn detector(&self) -> &Arc<HardwareDetector> {
        &self.detector
    }

    /// Validate selectors and snap any seek offset onto a segment boundary.
    pub fn normalize(&self, req: &StreamRequest) -> Result<StreamRequest, TranscodeError> {
        if req.source.as_os_str().is_empty() {
            return Err(TranscodeError::InvalidRequest("path is required".into()));
        }
        if !req.source.is_absolute() {
            return Err(TranscodeError::InvalidRequest(format!(
                "path must be absolute: {}",
                req.source.display()
            )));
        }
        let mut req = req.clone();
        req.seek_offset = req.seek_offset.map(|offset| self.align(offset));
        Ok(req)
    }

    fn align(&self, offset: u32) -> u32 {
        let seg = self.config.segment_secs.max(1);
        offset / seg * seg
    }

    /// Rewritten playlist for `req`, starting a transcode if needed.
    pub async fn manifest(&self, req: &StreamRequest) -> Result<String, TranscodeError> {
        let req = self.normalize(req)?;
        let key = req.key();

        let pending = match self.begin(&req, &key, None, self.config.ready_timeout).await? {
            Begin::Ready(manifest) => return Ok(self.rewrite(&req, &manifest)),
            Begin::Waiting(pending) => pending,
        };
        if !pending.joined {
            return self.finish(&req, pending).await;
        }

        match self.wait_for_manifest(&pending).await {
            Readiness::Ready(manifest) => {
                self.registry.touch(&key);
                Ok(self.rewrite(&req, &manifest))
            }
            Readiness::Failed(info) => Err(exit_error(info)),
            Readiness::Gone | Readiness::TimedOut => {
                info!(key = %key, "in-flight session produced no segments, restarting");
                match self
                    .begin(&req, &key, Some(pending.instance), self.config.ready_timeout)
                    .await?
                {
                    Begin::Ready(manifest) => Ok(self.rewrite(&req, &manifest)),
                    Begin::Waiting(pending) => self.finish(&req, pending).await,
                }
            }
        }
    }

    /// Serve one segment, from the cache when possible.
    pub async fn segment(
        &self,
        req: &StreamRequest,
        segment: &str,
    ) -> Result<SegmentPayload, TranscodeError> {
        let req = self.normalize(req)?;
        let index = hls::parse_segment_name(segment).ok_or_else(|| {
            TranscodeError::InvalidRequest(format!("invalid segment identifier '{segment}'"))
        })?;
        let key = req.key();

        let profile = self.detector.detect().await;
        let cache_key = self.cache_key(&req, index, &profile);
        if let Some(data) = self.cache.get(&cache_key).await {
            debug!(key = %key, segment = index, "segment cache hit");
            if self.registry.touch(&key) {
                self.registry.record_consumed(&key, index);
            }
            return Ok(SegmentPayload {
                data,
                cache_hit: true,
            });
        }

        let Some(output_dir) = self.registry.output_dir(&key) else {
            return Err(TranscodeError::SegmentNotFound(format!("{key} {segment}")));
        };
        self.registry.touch(&key);

        self.wait_for_segment(&output_dir, index).await?;
        let path = output_dir.join(hls::segment_file_name(index));
        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TranscodeError::SegmentNotFound(format!("{key} {segment}")));
            }
            Err(e) => return Err(e.into()),
        };
        self.registry.record_consumed(&key, index);

        let cache = self.cache.clone();
        tokio::spawn(async move {
            // Concurrent misses on the same segment all land here.
            if cache.contains(&cache_key).await {
                return;
            }
            if let Err(e) = cache.set(&cache_key, &path).await {
                warn!(segment = %path.display(), error = %e, "failed to cache segment");
            }
        });

        Ok(SegmentPayload {
            data,
            cache_hit: false,
        })
    }

    /// Restart playback at `offset_secs` in a session of its own.
    pub async fn seek(
        &self,
        source: &Path,
        audio_track: u32,
        offset_secs: u32,
    ) -> Result<SeekResponse, TranscodeError> {
        let req = self.normalize(&StreamRequest::new(source, audio_track).with_seek(Some(offset_secs)))?;
        let key = req.key();

        if self.registry.kill(&key.without_seek()).await {
            debug!(key = %key, "stopped linear session for seek");
        }

        let pending = match self
            .begin(&req, &key, None, self.config.seek_ready_timeout)
            .await?
        {
            Begin::Ready(_) => None,
            Begin::Waiting(pending) => Some(pending),
        };
        if let Some(pending) = pending {
            self.finish(&req, pending).await?;
        }

        let offset_secs = req.seek_offset.unwrap_or_default();
        info!(key = %key, offset_secs, "seek session ready");
        Ok(SeekResponse {
            manifest_url: req.manifest_url(),
            session_id: key.id(),
            offset_secs,
        })
    }

    /// Remove every session directory for `source`, tracked or not.
    pub async fn teardown(&self, source: &Path) -> usize {
        let removed = self.registry.remove_source_dirs(source).await;
        info!(source = %source.display(), removed, "source torn down");
        removed
    }

    pub fn buffer_status(&self, req: &StreamRequest) -> Result<BufferStatusReport, TranscodeError> {
        let req = self.normalize(req)?;
        let key = req.key();
        self.registry
            .buffer_report(&key)
            .ok_or_else(|| TranscodeError::SessionNotFound(key.to_string()))
    }

    pub async fn media_info(&self, source: &Path) -> Result<MediaInfo, TranscodeError> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(TranscodeError::SourceNotFound(source.to_path_buf()));
        }
        ffprobe::probe(&self.config.ffprobe_path, source).await
    }

    fn cache_key(&self, req: &StreamRequest, index: u32, profile: &HardwareProfile) -> SegmentCacheKey {
        let seg = self.config.segment_secs.max(1);
        let absolute = u64::from(req.seek_offset.unwrap_or(0) / seg) + u64::from(index);
        let resolution = match self.config.target_height {
            Some(height) => format!("{height}p"),
            None => "source".to_string(),
        };
        SegmentCacheKey::new(
            req.source.clone(),
            req.audio_track,
            absolute,
            profile.encoder.clone(),
            resolution,
        )
    }

    fn rewrite(&self, req: &StreamRequest, manifest: &str) -> String {
        hls::rewrite_manifest(manifest, |uri| {
            let name = uri.rsplit('/').next().unwrap_or(uri);
            req.segment_url(name)
        })
    }

    fn gate(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.gates.lock().entry(key.clone()).or_default().clone()
    }

    /// Join the live session for `key` or launch one. `stale` names an instance
    /// that already failed to produce segments and must be replaced.
    async fn begin(
        &self,
        req: &StreamRequest,
        key: &SessionKey,
        stale: Option<Uuid>,
        budget: Duration,
    ) -> Result<Begin, TranscodeError> {
        let gate = self.gate(key);
        let result = {
            let _guard = gate.lock().await;
            match self.registry.current_instance(key) {
                Some(instance) if Some(instance) != stale => {
                    Ok(self.join(key, instance, budget).await)
                }
                Some(instance) => {
                    self.registry
                        .kill_instance(key, instance, "no segments produced")
                        .await;
                    self.launch(req, key, budget).await.map(Begin::Waiting)
                }
                None => self.launch(req, key, budget).await.map(Begin::Waiting),
            }
        };
        drop(gate);
        self.gates.lock().retain(|_, g| Arc::strong_count(g) > 1);
        result
    }

    async fn join(&self, key: &SessionKey, instance: Uuid, ceiling: Duration) -> Begin {
        let output_dir = self
            .registry
            .output_dir(key)
            .unwrap_or_else(|| self.registry.output_dir_for(key));
        if let Some(manifest) = read_ready_manifest(&output_dir).await {
            self.registry.touch(key);
            return Begin::Ready(manifest);
        }

        // Never shorter than the low-latency ceiling; a young session keeps the rest
        // of the caller's startup window.
        let age = self.registry.age(key).unwrap_or_default();
        let budget = self
            .config
            .join_ready_timeout
            .max(ceiling.saturating_sub(age));
        debug!(key = %key, budget_ms = budget.as_millis() as u64, "joining in-flight session");
        Begin::Waiting(Pending {
            key: key.clone(),
            instance,
            output_dir,
            exit: self.registry.exit_watch(key),
            budget,
            joined: true,
        })
    }

    async fn launch(
        &self,
        req: &StreamRequest,
        key: &SessionKey,
        budget: Duration,
    ) -> Result<Pending, TranscodeError> {
        if !tokio::fs::try_exists(&req.source).await.unwrap_or(false) {
            return Err(TranscodeError::SourceNotFound(req.source.clone()));
        }

        if self.config.probe_sources {
            match ffprobe::probe(&self.config.ffprobe_path, &req.source).await {
                Ok(info) if !info.has_audio_track(req.audio_track) => {
                    return Err(TranscodeError::InvalidRequest(format!(
                        "audio track {} does not exist ({} available)",
                        req.audio_track,
                        info.audio.len()
                    )));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(source = %req.source.display(), error = %e, "probe failed, starting without validation")
                }
            }
        }

        let profile = self.detector.detect().await;
        let ticket = self.registry.register(key.clone()).await?;
        let args = build_hls_args(&TranscodeJob {
            source: &req.source,
            output_dir: &ticket.output_dir,
            audio_track: req.audio_track,
            seek_offset: key.seek_offset,
            segment_secs: self.config.segment_secs,
            target_height: self.config.target_height,
            profile: &profile,
        });
        let spawned = self.start(&ticket, &args).await?;

        info!(
            session = %ticket.id,
            key = %key,
            pid = spawned.pid,
            encoder = %profile.encoder,
            "transcode started"
        );
        Ok(Pending {
            key: key.clone(),
            instance: ticket.instance,
            output_dir: ticket.output_dir,
            exit: Some(spawned.exit),
            budget,
            joined: false,
        })
    }

    /// Spawn the transcoder for `ticket`. Losing the session to an eviction between
    /// register and spawn is transient, so the client is told to retry.
    async fn start(
        &self,
        ticket: &SessionTicket,
        args: &[String],
    ) -> Result<SpawnedSession, TranscodeError> {
        match self
            .registry
            .spawn(ticket, &self.config.ffmpeg_path, args)
            .await
        {
            Err(TranscodeError::SessionNotFound(key)) => {
                warn!(key = %key, "session evicted before its transcoder started");
                Err(TranscodeError::NotReady {
                    retry_after: self.config.retry_after,
                })
            }
            other => other,
        }
    }

    async fn finish(&self, req: &StreamRequest, pending: Pending) -> Result<String, TranscodeError> {
        match self.wait_for_manifest(&pending).await {
            Readiness::Ready(manifest) => {
                self.registry.touch(&pending.key);
                Ok(self.rewrite(req, &manifest))
            }
            Readiness::Failed(info) => Err(exit_error(info)),
            Readiness::Gone => Err(TranscodeError::NotReady {
                retry_after: self.config.retry_after,
            }),
            Readiness::TimedOut => {
                warn!(
                    key = %pending.key,
                    waited_ms = pending.budget.as_millis() as u64,
                    "transcode not ready in time, killing session"
                );
                self.registry
                    .kill_instance(&pending.key, pending.instance, "readiness timeout")
                    .await;
                Err(TranscodeError::NotReady {
                    retry_after: self.config.retry_after,
                })
            }
        }
    }

    /// Poll the playlist until it lists a segment; the exit watch cuts the wait
    /// short when the transcoder dies.
    async fn wait_for_manifest(&self, pending: &Pending) -> Readiness {
        let deadline = tokio::time::Instant::now() + pending.budget;
        let mut exit = pending.exit.clone();

        loop {
            if let Some(manifest) = read_ready_manifest(&pending.output_dir).await {
                return Readiness::Ready(manifest);
            }

            let exited = exit.as_ref().and_then(|rx| rx.borrow().clone());
            match exited {
                Some(info) if !info.success => return Readiness::Failed(info),
                Some(info) => {
                    return Readiness::Failed(ExitInfo {
                        stderr_excerpt: "transcoder finished without producing segments".into(),
                        ..info
                    });
                }
                None => {}
            }
            if !self.registry.is_current(&pending.key, pending.instance) {
                return Readiness::Gone;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Readiness::TimedOut;
            }
            let nap = self.config.poll_interval.min(deadline - now);
            let closed = match exit.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(nap) => false,
                        changed = rx.changed() => changed.is_err(),
                    }
                }
                None => {
                    tokio::time::sleep(nap).await;
                    false
                }
            };
            if closed {
                exit = None;
            }
        }
    }

    /// Wait until segment `index` is complete on disk.
    async fn wait_for_segment(&self, dir: &Path, index: u32) -> Result<(), TranscodeError> {
        let deadline = tokio::time::Instant::now() + self.config.segment_wait;
        let segment = dir.join(hls::segment_file_name(index));

        loop {
            if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
                return Err(TranscodeError::SegmentNotFound(format!(
                    "session directory {} is gone",
                    dir.display()
                )));
            }
            if let Ok(manifest) = tokio::fs::read_to_string(dir.join(hls::PLAYLIST_NAME)).await {
                if hls::lists_segment(&manifest, index) {
                    return Ok(());
                }
            }
            let complete = tokio::fs::try_exists(dir.join(hls::COMPLETE_MARKER))
                .await
                .unwrap_or(false);
            if complete {
                return if tokio::fs::try_exists(&segment).await.unwrap_or(false) {
                    Ok(())
                } else {
                    Err(TranscodeError::SegmentNotFound(hls::segment_file_name(index)))
                };
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(TranscodeError::NotReady {
                    retry_after: self.config.retry_after,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

async fn read_ready_manifest(dir: &Path) -> Option<String> {
    let manifest = tokio::fs::read_to_string(dir.join(hls::PLAYLIST_NAME))
        .await
        .ok()?;
    (hls::count_segments(&manifest) > 0).then_some(manifest)
}

fn exit_error(info: ExitInfo) -> TranscodeError {
    TranscodeError::ProcessExited {
        code: info.code,
        stderr: info.stderr_excerpt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(root: &Path) -> TranscodePipeline {
        let config = TranscoderConfig {
            transcode_dir: root.join("sessions"),
            cache_dir: root.join("cache"),
            probe_sources: false,
            ..Default::default()
        };
        let cache = Arc::new(SegmentCache::new(config.cache_dir.clone()));
        let detector = Arc::new(HardwareDetector::fixed(HardwareProfile::software()));
        TranscodePipeline::new(SessionRegistry::new(config), cache, detector)
    }

    #[test]
    fn urls_carry_selectors() {
        let req = StreamRequest::new("/media/My Film.mkv", 1)
            .with_subtitle(Some(2))
            .with_seek(Some(60));
        assert_eq!(
            req.segment_url("segment3.ts"),
            "/stream/transcode?path=%2Fmedia%2FMy%20Film.mkv&audio=1&subtitle=2&seek=60&segment=segment3.ts"
        );
        assert!(req.manifest_url().ends_with("&seek=60&manifest=true"));
    }

    #[test]
    fn normalize_aligns_seek_and_rejects_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pipeline(tmp.path());
        let req = p
            .normalize(&StreamRequest::new("/m/a.mkv", 0).with_seek(Some(61)))
            .unwrap();
        assert_eq!(req.seek_offset, Some(60));
        assert!(matches!(
            p.normalize(&StreamRequest::new("relative.mkv", 0)),
            Err(TranscodeError::InvalidRequest(_))
        ));
    }

    #[test]
    fn cache_key_uses_absolute_index() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pipeline(tmp.path());
        let profile = HardwareProfile::software();
        let seeked = StreamRequest::new("/m/a.mkv", 0).with_seek(Some(10));
        let linear = StreamRequest::new("/m/a.mkv", 0);
        assert_eq!(
            p.cache_key(&seeked, 0, &profile),
            p.cache_key(&linear, 5, &profile)
        );
        assert_eq!(p.cache_key(&linear, 5, &profile).resolution, "source");
    }

    #[test]
    fn manifest_lines_are_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pipeline(tmp.path());
        let req = StreamRequest::new("/m/a.mkv", 0);
        let out = p.rewrite(
            &req,
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nsegment0.ts\n",
        );
        assert!(out.starts_with("#EXTM3U\n#EXT-X-TARGETDURATION:2\n"));
        assert!(out.contains("/stream/transcode?path=%2Fm%2Fa.mkv&audio=0&segment=segment0.ts\n"));
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pipeline(tmp.path());
        let req = StreamRequest::new(tmp.path().join("nope.mkv"), 0);
        assert!(matches!(
            p.manifest(&req).await,
            Err(TranscodeError::SourceNotFound(_))
        ));
        assert_eq!(p.registry().stats().active, 0);
    }

    #[tokio::test]
    async fn segment_without_session_or_cache_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pipeline(tmp.path());
        let req = StreamRequest::new("/m/a.mkv", 0);
        assert!(matches!(
            p.segment(&req, "segment0.ts").await,
            Err(TranscodeError::SegmentNotFound(_))
        ));
        assert!(matches!(
            p.segment(&req, "../etc/passwd").await,
            Err(TranscodeError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn evicted_before_spawn_is_retryable() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pipeline(tmp.path());
        let key = SessionKey::new(tmp.path().join("film.mkv"), 0, None);
        let ticket = p.registry().register(key.clone()).await.unwrap();
        assert!(p.registry().kill(&key).await);

        match p.start(&ticket, &[]).await {
            Err(TranscodeError::NotReady { retry_after }) => {
                assert_eq!(retry_after, p.config.retry_after)
            }
            other => panic!("expected NotReady, got {other:?}"),
        }
        assert!(!p.registry().has_active(&key));
    }

    #[tokio::test]
    async fn joining_keeps_the_callers_ceiling() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pipeline(tmp.path());
        let key = SessionKey::new(tmp.path().join("film.mkv"), 0, Some(120));
        p.registry().register(key.clone()).await.unwrap();
        let instance = p.registry().current_instance(&key).unwrap();

        let seek_ceiling = p.config.seek_ready_timeout;
        let Begin::Waiting(pending) = p.join(&key, instance, seek_ceiling).await else {
            panic!("empty session must be waited on");
        };
        assert!(pending.joined);
        assert!(pending.budget <= seek_ceiling);
        assert!(pending.budget >= p.config.join_ready_timeout);

        let Begin::Waiting(pending) = p.join(&key, instance, p.config.ready_timeout).await else {
            panic!("empty session must be waited on");
        };
        assert!(pending.budget > seek_ceiling);

        p.registry().cleanup_all().await;
    }

    #[tokio::test]
    async fn buffer_status_without_session() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pipeline(tmp.path());
        assert!(matches!(
            p.buffer_status(&StreamRequest::new("/m/a.mkv", 0)),
            Err(TranscodeError::SessionNotFound(_))
        ));
    }
}
