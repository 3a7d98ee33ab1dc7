//! HTTP tests. Transcodes run a stand-in shell script, so these are unix only.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use reelcast_server::routes::build_router;
use reelcast_server::state::AppState;
use reelcast_transcoder::TranscoderConfig;
use reelcast_transcoder::gpu::{HardwareDetector, HardwareProfile};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Stand-in for ffmpeg: writes one valid MPEG-TS segment plus a playlist next to
/// the playlist path (its last argument), reports progress, then idles.
const ONE_SEGMENT: &str = r##"
for last; do :; done
out=$(dirname "$last")
i=0
while [ $i -lt 4 ]; do printf 'G'; head -c 187 /dev/zero; i=$((i+1)); done > "$out/segment0.ts"
printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2.000000,\nsegment0.ts\n' > "$out/index.tmp"
mv "$out/index.tmp" "$out/index.m3u8"
echo "frame=48"
echo "fps=24.0"
echo "speed=2.0x"
echo "out_time_us=2000000"
echo "progress=continue"
exec sleep 30
"##;

const BROKEN_INPUT: &str = r##"
echo "source.mkv: Invalid data found when processing input" >&2
exit 1
"##;

const NEVER_READY: &str = "exec sleep 30\n";

struct Harness {
    server: TestServer,
    state: AppState,
    media: PathBuf,
    _tmp: TempDir,
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-ffmpeg");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn harness_with(script: &str, tune: impl FnOnce(&mut TranscoderConfig)) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let media = tmp.path().join("movie.mkv");
    std::fs::write(&media, b"not really a movie").unwrap();

    let mut config = TranscoderConfig {
        ffmpeg_path: write_script(tmp.path(), script),
        transcode_dir: tmp.path().join("sessions"),
        cache_dir: tmp.path().join("cache"),
        probe_sources: false,
        kill_grace: Duration::from_millis(500),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    tune(&mut config);

    let detector = Arc::new(HardwareDetector::fixed(HardwareProfile::software()));
    let state = AppState::with_detector(config, detector);
    let server = TestServer::new(build_router(state.clone())).unwrap();
    Harness {
        server,
        state,
        media,
        _tmp: tmp,
    }
}

fn harness(script: &str) -> Harness {
    harness_with(script, |_| {})
}

impl Harness {
    fn media_str(&self) -> String {
        self.media.to_string_lossy().into_owned()
    }

    async fn manifest(&self) -> axum_test::TestResponse {
        self.server
            .get("/stream/transcode")
            .add_query_param("path", self.media_str())
            .add_query_param("audio", 0)
            .add_query_param("manifest", "true")
            .await
    }

    async fn shutdown(self) {
        self.state.registry.cleanup_all().await;
    }
}

fn segment_urls(manifest: &str) -> Vec<String> {
    manifest
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let h = harness(NEVER_READY);
    let resp = h.server.get("/health").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn manifest_then_segment_miss_then_hit() {
    let h = harness(ONE_SEGMENT);

    let resp = h.manifest().await;
    resp.assert_status_ok();
    assert_eq!(
        resp.header("content-type").to_str().unwrap(),
        "application/vnd.apple.mpegurl"
    );
    assert_eq!(resp.header("cache-control").to_str().unwrap(), "no-cache");
    let manifest = resp.text();
    assert!(manifest.starts_with("#EXTM3U"));
    let urls = segment_urls(&manifest);
    assert_eq!(urls.len(), 1);
    assert!(urls[0].starts_with("/stream/transcode?path="));
    assert!(urls[0].ends_with("&audio=0&segment=segment0.ts"));

    let first = h.server.get(&urls[0]).await;
    first.assert_status_ok();
    assert_eq!(first.header("x-cache").to_str().unwrap(), "MISS");
    assert_eq!(first.header("content-type").to_str().unwrap(), "video/mp2t");
    assert_eq!(
        first.header("cache-control").to_str().unwrap(),
        "public, max-age=31536000, immutable"
    );
    let bytes = first.as_bytes().clone();
    assert_eq!(bytes.len(), 4 * 188);
    assert_eq!(bytes[0], 0x47);

    // The cache write is fire-and-forget.
    let mut cached = false;
    for _ in 0..50 {
        if h.state.cache.stats().await.unwrap().total_files == 1 {
            cached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    assert!(cached, "segment never reached the cache");

    let second = h.server.get(&urls[0]).await;
    second.assert_status_ok();
    assert_eq!(second.header("x-cache").to_str().unwrap(), "HIT");
    assert_eq!(second.as_bytes(), &bytes);

    h.shutdown().await;
}

#[tokio::test]
async fn repeated_manifest_requests_reuse_the_session() {
    let h = harness(ONE_SEGMENT);
    h.manifest().await.assert_status_ok();
    let state_before = h.state.registry.stats().sessions[0].state;

    h.manifest().await.assert_status_ok();
    let stats = h.state.registry.stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.sessions[0].state, state_before);

    h.shutdown().await;
}

#[tokio::test]
async fn segment_without_session_or_cache_is_404() {
    let h = harness(NEVER_READY);
    let resp = h
        .server
        .get("/stream/transcode")
        .add_query_param("path", h.media_str())
        .add_query_param("segment", "segment3.ts")
        .await;
    resp.assert_status(StatusCode::NOT_FOUND);
    let body: Value = resp.json();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn missing_source_is_404() {
    let h = harness(ONE_SEGMENT);
    let resp = h
        .server
        .get("/stream/transcode")
        .add_query_param("path", "/definitely/not/here.mkv")
        .await;
    resp.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(h.state.registry.stats().active, 0);
}

#[tokio::test]
async fn invalid_selectors_are_400() {
    let h = harness(ONE_SEGMENT);

    let relative = h
        .server
        .get("/stream/transcode")
        .add_query_param("path", "relative/movie.mkv")
        .await;
    relative.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = relative.json();
    assert_eq!(body["error"]["code"], "bad_request");

    let bad_segment = h
        .server
        .get("/stream/transcode")
        .add_query_param("path", h.media_str())
        .add_query_param("segment", "../index.m3u8")
        .await;
    bad_segment.assert_status(StatusCode::BAD_REQUEST);

    let missing_path = h.server.get("/stream/transcode").await;
    missing_path.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn transcoder_failure_is_502_with_stderr() {
    let h = harness(BROKEN_INPUT);
    let resp = h.manifest().await;
    resp.assert_status(StatusCode::BAD_GATEWAY);
    let body: Value = resp.json();
    assert_eq!(body["error"]["code"], "transcoder_failed");
    assert!(
        body["error"]["details"]["stderr"]
            .as_str()
            .unwrap()
            .contains("Invalid data found")
    );

    // The failed session is cleaned up.
    for _ in 0..50 {
        if h.state.registry.stats().active == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.state.registry.stats().active, 0);
}

#[tokio::test]
async fn readiness_timeout_is_503_with_retry_after() {
    let h = harness_with(NEVER_READY, |c| {
        c.ready_timeout = Duration::from_millis(300);
        c.join_ready_timeout = Duration::from_millis(100);
    });
    let resp = h.manifest().await;
    resp.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.header("retry-after").to_str().unwrap(), "5");
    let body: Value = resp.json();
    assert_eq!(body["error"]["code"], "not_ready");
    assert_eq!(h.state.registry.stats().active, 0);
}

#[tokio::test]
async fn seek_starts_an_isolated_session() {
    let h = harness(ONE_SEGMENT);
    h.manifest().await.assert_status_ok();

    let resp = h
        .server
        .post("/stream/transcode/seek")
        .json(&json!({ "path": h.media_str(), "offset_secs": 61.5, "audio": 0 }))
        .await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["offset_secs"], 60);
    let manifest_url = body["manifest_url"].as_str().unwrap().to_string();
    assert!(manifest_url.contains("&seek=60"));

    // The linear session was replaced by the seek-qualified one.
    let stats = h.state.registry.stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.sessions[0].key.seek_offset, Some(60));
    assert_eq!(stats.sessions[0].id, body["session_id"].as_str().unwrap());

    let manifest = h.server.get(&manifest_url).await;
    manifest.assert_status_ok();
    let urls = segment_urls(&manifest.text());
    assert!(urls[0].ends_with("&seek=60&segment=segment0.ts"));

    h.shutdown().await;
}

#[tokio::test]
async fn seek_rejects_negative_offsets() {
    let h = harness(ONE_SEGMENT);
    let resp = h
        .server
        .post("/stream/transcode/seek")
        .json(&json!({ "path": h.media_str(), "offset_secs": -3.0 }))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn buffer_status_follows_session() {
    let h = harness(ONE_SEGMENT);
    let none = h
        .server
        .get("/stream/transcode/status")
        .add_query_param("path", h.media_str())
        .await;
    none.assert_status(StatusCode::NOT_FOUND);

    h.manifest().await.assert_status_ok();
    let resp = h
        .server
        .get("/stream/transcode/status")
        .add_query_param("path", h.media_str())
        .add_query_param("audio", 0)
        .await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert!(body["health"].is_string());
    assert!(body["recommendation"].is_string());

    h.shutdown().await;
}

#[tokio::test]
async fn teardown_removes_source_sessions() {
    let h = harness(ONE_SEGMENT);
    h.manifest().await.assert_status_ok();
    let dir = h.state.registry.stats().sessions[0].output_dir.clone();
    assert!(dir.exists());

    let resp = h
        .server
        .delete("/stream/transcode")
        .add_query_param("path", h.media_str())
        .await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert!(body["removed"].as_u64().unwrap() >= 1);
    assert_eq!(h.state.registry.stats().active, 0);
    assert!(!dir.exists());
}

#[tokio::test]
async fn admin_lists_and_kills_sessions() {
    let h = harness(ONE_SEGMENT);
    h.manifest().await.assert_status_ok();

    let resp = h.server.get("/api/v1/admin/transcode/sessions").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["stats"]["active"], 1);
    assert_eq!(body["stats"]["running"], 1);
    let id = body["stats"]["sessions"][0]["id"].as_str().unwrap().to_string();

    let kill = h
        .server
        .delete(&format!("/api/v1/admin/transcode/sessions/{id}"))
        .await;
    kill.assert_status_ok();
    assert_eq!(h.state.registry.stats().active, 0);

    let again = h
        .server
        .delete(&format!("/api/v1/admin/transcode/sessions/{id}"))
        .await;
    again.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_cleanup_and_teardown() {
    let h = harness(ONE_SEGMENT);
    h.manifest().await.assert_status_ok();

    let sweep = h.server.post("/api/v1/admin/transcode/cleanup").await;
    sweep.assert_status_ok();
    let report: Value = sweep.json();
    assert_eq!(report["idle_killed"], 0);
    assert_eq!(h.state.registry.stats().active, 1);

    let teardown = h.server.post("/api/v1/admin/transcode/teardown").await;
    teardown.assert_status_ok();
    let report: Value = teardown.json();
    assert_eq!(report["sessions_killed"], 1);
    assert_eq!(report["idle_killed"], 0);
    assert_eq!(h.state.registry.stats().active, 0);
    assert!(h.state.registry.root().exists());
}

#[tokio::test]
async fn admin_cache_stats_and_clear() {
    let h = harness(ONE_SEGMENT);
    let manifest = h.manifest().await.text();
    let url = segment_urls(&manifest).remove(0);
    h.server.get(&url).await.assert_status_ok();

    for _ in 0..50 {
        if h.state.cache.stats().await.unwrap().total_files == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    let stats = h.server.get("/api/v1/admin/cache").await;
    stats.assert_status_ok();
    let body: Value = stats.json();
    assert_eq!(body["total_files"], 1);
    assert_eq!(body["total_size"], 4 * 188);

    let cleared = h.server.delete("/api/v1/admin/cache").await;
    cleared.assert_status_ok();
    let body: Value = cleared.json();
    assert_eq!(body["total_files"], 1);
    assert_eq!(h.state.cache.stats().await.unwrap().total_files, 0);

    h.shutdown().await;
}

#[tokio::test]
async fn hardware_profile_endpoint() {
    let h = harness(NEVER_READY);
    let resp = h.server.get("/api/v1/system/hardware").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["encoder"], "libx264");
    assert!(body["accel"].is_null());
}

#[tokio::test]
async fn media_info_for_missing_file_is_404() {
    let h = harness(NEVER_READY);
    let resp = h
        .server
        .get("/api/v1/playback/info")
        .add_query_param("path", "/nope/missing.mkv")
        .await;
    resp.assert_status(StatusCode::NOT_FOUND);
}
