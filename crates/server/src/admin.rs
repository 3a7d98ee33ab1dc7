//! Operator endpoints under `/api/v1/admin`.

use axum::Json;
use axum::extract::{Path, State};
use reelcast_core::error::ApiError;
use reelcast_transcoder::cache::CacheStats;
use reelcast_transcoder::session::{HealthReport, SweepReport};
use serde::Serialize;
use tracing::info;

use crate::error::AppError;
use crate::state::AppState;

/// Registry stats plus a reconciliation against the OS and disk.
pub async fn list_sessions(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.registry.health_check().await)
}

#[derive(Serialize)]
pub struct KillResponse {
    pub id: String,
    pub killed: bool,
}

pub async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KillResponse>, AppError> {
    if !state.registry.kill_by_id(&id).await {
        return Err(ApiError::NotFound(format!("session {id} not found")).into());
    }
    info!(session = %id, "session killed by operator");
    Ok(Json(KillResponse { id, killed: true }))
}

pub async fn cleanup(State(state): State<AppState>) -> Json<SweepReport> {
    Json(state.registry.cleanup_orphans().await)
}

pub async fn teardown_all(State(state): State<AppState>) -> Json<SweepReport> {
    Json(state.registry.cleanup_all().await)
}

pub async fn cache_stats(State(state): State<AppState>) -> Result<Json<CacheStats>, AppError> {
    Ok(Json(state.cache.stats().await?))
}

pub async fn clear_cache(State(state): State<AppState>) -> Result<Json<CacheStats>, AppError> {
    Ok(Json(state.cache.clear().await?))
}
