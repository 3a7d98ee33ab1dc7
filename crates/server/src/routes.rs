use axum::extract::{Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use reelcast_core::error::ApiError;
use reelcast_transcoder::ffprobe::MediaInfo;
use reelcast_transcoder::gpu::HardwareProfile;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_router())
        .nest("/stream", stream_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Browser players fetch playlists and segments cross-origin.
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn stream_router() -> Router<AppState> {
    Router::new()
        .route(
            "/transcode",
            get(crate::streaming::transcode).delete(crate::streaming::teardown),
        )
        .route("/transcode/seek", post(crate::streaming::seek))
        .route("/transcode/status", get(crate::streaming::status))
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/admin", admin_router())
        .route("/system/hardware", get(get_hardware))
        .route("/playback/info", get(get_media_info))
}

fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/transcode/sessions", get(crate::admin::list_sessions))
        .route("/transcode/sessions/{id}", delete(crate::admin::kill_session))
        .route("/transcode/cleanup", post(crate::admin::cleanup))
        .route("/transcode/teardown", post(crate::admin::teardown_all))
        .route(
            "/cache",
            get(crate::admin::cache_stats).delete(crate::admin::clear_cache),
        )
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    active_sessions: usize,
    sweeper_running: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.registry.stats().active,
        sweeper_running: state.registry.sweeper_running(),
    })
}

// ---------------------------------------------------------------------------
// Hardware
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct HardwareQuery {
    #[serde(default)]
    redetect: bool,
}

async fn get_hardware(
    State(state): State<AppState>,
    Query(query): Query<HardwareQuery>,
) -> Json<HardwareProfile> {
    let profile = if query.redetect {
        state.detector.redetect().await
    } else {
        state.detector.detect().await
    };
    Json(profile.as_ref().clone())
}

// ---------------------------------------------------------------------------
// Media info (ffprobe)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct MediaInfoQuery {
    path: String,
}

async fn get_media_info(
    State(state): State<AppState>,
    Query(query): Query<MediaInfoQuery>,
) -> Result<Json<MediaInfo>, AppError> {
    if query.path.is_empty() {
        return Err(ApiError::BadRequest("path is required".into()).into());
    }
    let info = state
        .pipeline
        .media_info(&PathBuf::from(&query.path))
        .await?;
    Ok(Json(info))
}
