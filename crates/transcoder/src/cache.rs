//! Content-addressed segment cache.
//!
//! Segments are stored under `<root>/<aa>/<sha256>.ts`, where the digest covers the
//! logical content (source, audio track, segment index, encoder, resolution) and never
//! the session that produced it, so any later session for the same content reuses it.
//! There is no automatic eviction; `stats()` exposes size for an external policy and
//! `clear()` is the only bulk removal.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::TranscodeError;

const TS_PACKET: usize = 188;
const TS_SYNC: u8 = 0x47;
const PACKETS_CHECKED: usize = 8;

/// Identity of one cached segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SegmentCacheKey {
    pub source: PathBuf,
    pub audio_track: u32,
    pub segment_index: u64,
    pub encoder: String,
    pub resolution: String,
}

impl SegmentCacheKey {
    pub fn new(
        source: impl Into<PathBuf>,
        audio_track: u32,
        segment_index: u64,
        encoder: impl Into<String>,
        resolution: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            audio_track,
            segment_index,
            encoder: encoder.into(),
            resolution: resolution.into(),
        }
    }

    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(self.audio_track.to_string());
        hasher.update([0]);
        hasher.update(self.segment_index.to_string());
        hasher.update([0]);
        hasher.update(self.encoder.as_bytes());
        hasher.update([0]);
        hasher.update(self.resolution.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub total_files: u64,
    pub total_size: u64,
    pub oldest_file: Option<DateTime<Utc>>,
    pub newest_file: Option<DateTime<Utc>>,
}

pub struct SegmentCache {
    root: PathBuf,
}

impl SegmentCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<(), TranscodeError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub fn path_for(&self, key: &SegmentCacheKey) -> PathBuf {
        let digest = key.digest();
        self.root.join(&digest[..2]).join(format!("{digest}.ts"))
    }

    /// Cached bytes for `key`, or `None`. Read failures count as a miss.
    pub async fn get(&self, key: &SegmentCacheKey) -> Option<Bytes> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "segment cache read failed");
                }
                None
            }
        }
    }

    pub async fn contains(&self, key: &SegmentCacheKey) -> bool {
        tokio::fs::try_exists(self.path_for(key))
            .await
            .unwrap_or(false)
    }

    /// Copy `source_file` into the cache under `key`. The payload must look like
    /// MPEG-TS; anything else is refused so truncated output is never cached.
    pub async fn set(
        &self,
        key: &SegmentCacheKey,
        source_file: &Path,
    ) -> Result<CacheEntry, TranscodeError> {
        let data = tokio::fs::read(source_file).await?;
        if !looks_like_mpegts(&data) {
            return Err(TranscodeError::InvalidRequest(format!(
                "{} is not a complete MPEG-TS segment",
                source_file.display()
            )));
        }

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so readers never observe a partial file.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let entry = CacheEntry {
            path,
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        debug!(
            source = %key.source.display(),
            segment = key.segment_index,
            size = entry.size,
            "segment cached"
        );
        Ok(entry)
    }

    /// Remove every cached segment. Returns what was removed.
    pub async fn clear(&self) -> Result<CacheStats, TranscodeError> {
        let removed = self.stats().await?;
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.root).await?;
        info!(
            files = removed.total_files,
            bytes = removed.total_size,
            "segment cache cleared"
        );
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, TranscodeError> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || {
            walk_files(&root, &|p| p.extension().is_some_and(|e| e == "ts"))
        })
        .await
        .map_err(|e| TranscodeError::Io(std::io::Error::other(e)))?;

        Ok(summarize(&files))
    }
}

/// Cheap structural check: sync byte at the start of the first packets.
pub fn looks_like_mpegts(data: &[u8]) -> bool {
    if data.len() < TS_PACKET {
        return false;
    }
    data.chunks(TS_PACKET)
        .filter(|chunk| chunk.len() == TS_PACKET)
        .take(PACKETS_CHECKED)
        .all(|packet| packet[0] == TS_SYNC)
}

/// File discovered during a directory walk.
#[derive(Debug, Clone)]
pub(crate) struct WalkedFile {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Recursively collect regular files under `root` accepted by `filter`.
pub(crate) fn walk_files(root: &Path, filter: &dyn Fn(&Path) -> bool) -> Vec<WalkedFile> {
    let mut files = Vec::new();
    walk_recursive(root, filter, &mut files);
    files
}

fn walk_recursive(dir: &Path, filter: &dyn Fn(&Path) -> bool, files: &mut Vec<WalkedFile>) {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %e, "cannot read directory");
            }
            return;
        }
    };

    for entry in read_dir.flatten() {
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if metadata.is_dir() {
            walk_recursive(&path, filter, files);
        } else if metadata.is_file() && filter(&path) {
            files.push(WalkedFile {
                size: metadata.len(),
                modified: metadata.modified().ok(),
            });
        }
    }
}

pub(crate) fn summarize(files: &[WalkedFile]) -> CacheStats {
    let mut stats = CacheStats::default();
    for file in files {
        stats.total_files += 1;
        stats.total_size += file.size;
        if let Some(modified) = file.modified.map(DateTime::<Utc>::from) {
            stats.oldest_file = Some(stats.oldest_file.map_or(modified, |o| o.min(modified)));
            stats.newest_file = Some(stats.newest_file.map_or(modified, |n| n.max(modified)));
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_payload(packets: usize, fill: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(packets * TS_PACKET);
        for _ in 0..packets {
            data.push(TS_SYNC);
            data.extend(std::iter::repeat_n(fill, TS_PACKET - 1));
        }
        data
    }

    fn key(index: u64) -> SegmentCacheKey {
        SegmentCacheKey::new("/media/movie.mkv", 0, index, "libx264", "source")
    }

    #[test]
    fn key_distinguishes_logical_content() {
        assert_eq!(key(3).digest(), key(3).digest());
        assert_ne!(key(3).digest(), key(4).digest());
        let other_audio = SegmentCacheKey::new("/media/movie.mkv", 1, 3, "libx264", "source");
        assert_ne!(key(3).digest(), other_audio.digest());
        let other_encoder = SegmentCacheKey::new("/media/movie.mkv", 0, 3, "h264_nvenc", "source");
        assert_ne!(key(3).digest(), other_encoder.digest());
    }

    #[test]
    fn mpegts_validation() {
        assert!(looks_like_mpegts(&ts_payload(4, 0xff)));
        assert!(!looks_like_mpegts(b"#EXTM3U"));
        let mut broken = ts_payload(4, 0);
        broken[TS_PACKET * 2] = 0;
        assert!(!looks_like_mpegts(&broken));
    }

    #[tokio::test]
    async fn set_then_get_returns_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SegmentCache::new(dir.path().join("cache"));
        let segment = dir.path().join("segment0.ts");
        let payload = ts_payload(10, 0xab);
        std::fs::write(&segment, &payload).unwrap();

        assert!(cache.get(&key(0)).await.is_none());
        cache.set(&key(0), &segment).await.unwrap();
        let cached = cache.get(&key(0)).await.unwrap();
        assert_eq!(cached.as_ref(), payload.as_slice());
        assert!(cache.contains(&key(0)).await);
    }

    #[tokio::test]
    async fn deleted_backing_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SegmentCache::new(dir.path().join("cache"));
        let segment = dir.path().join("segment1.ts");
        std::fs::write(&segment, ts_payload(2, 1)).unwrap();

        let entry = cache.set(&key(1), &segment).await.unwrap();
        std::fs::remove_file(&entry.path).unwrap();
        assert!(cache.get(&key(1)).await.is_none());
        assert!(!cache.contains(&key(1)).await);
    }

    #[tokio::test]
    async fn refuses_non_ts_payload() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SegmentCache::new(dir.path().join("cache"));
        let bogus = dir.path().join("segment2.ts");
        std::fs::write(&bogus, b"not a transport stream").unwrap();

        assert!(cache.set(&key(2), &bogus).await.is_err());
        assert!(!cache.contains(&key(2)).await);
    }

    #[tokio::test]
    async fn stats_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SegmentCache::new(dir.path().join("cache"));
        cache.ensure_root().await.unwrap();
        assert_eq!(cache.stats().await.unwrap().total_files, 0);

        for i in 0..3 {
            let segment = dir.path().join(format!("segment{i}.ts"));
            std::fs::write(&segment, ts_payload(2, i as u8)).unwrap();
            cache.set(&key(i), &segment).await.unwrap();
        }

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.total_size, 3 * 2 * TS_PACKET as u64);
        assert!(stats.oldest_file.unwrap() <= stats.newest_file.unwrap());

        let removed = cache.clear().await.unwrap();
        assert_eq!(removed.total_files, 3);
        assert_eq!(cache.stats().await.unwrap().total_files, 0);
        assert!(cache.get(&key(0)).await.is_none());
    }
}
