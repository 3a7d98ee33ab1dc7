//! Playback endpoints under `/stream`.

use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderName, header};
use axum::response::{IntoResponse, Response};
use reelcast_core::error::ApiError;
use reelcast_transcoder::buffer::BufferStatusReport;
use reelcast_transcoder::hls;
use reelcast_transcoder::pipeline::{SeekResponse, StreamRequest};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::AppError;
use crate::state::AppState;

const SEGMENT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

#[derive(Debug, Deserialize)]
pub struct TranscodeQuery {
    pub path: Option<String>,
    #[serde(default)]
    pub audio: u32,
    pub subtitle: Option<u32>,
    pub seek: Option<u32>,
    pub manifest: Option<String>,
    pub segment: Option<String>,
}

impl TranscodeQuery {
    fn stream_request(&self) -> Result<StreamRequest, ApiError> {
        let path = self
            .path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ApiError::BadRequest("path is required".into()))?;
        Ok(StreamRequest::new(PathBuf::from(path), self.audio)
            .with_subtitle(self.subtitle)
            .with_seek(self.seek))
    }
}

/// `GET /stream/transcode`: the playlist, or one segment when `segment` is given.
pub async fn transcode(
    State(state): State<AppState>,
    Query(query): Query<TranscodeQuery>,
) -> Result<Response, AppError> {
    let req = query.stream_request()?;

    if let Some(segment) = query.segment.as_deref() {
        let payload = state.pipeline.segment(&req, segment).await?;
        let cache_status = if payload.cache_hit { "HIT" } else { "MISS" };
        return Ok((
            [
                (header::CONTENT_TYPE, hls::SEGMENT_CONTENT_TYPE_TS),
                (header::CACHE_CONTROL, SEGMENT_CACHE_CONTROL),
                (X_CACHE, cache_status),
            ],
            Body::from(payload.data),
        )
            .into_response());
    }

    // `manifest` is accepted for clarity but a request without a segment is always
    // a playlist request.
    let manifest = state.pipeline.manifest(&req).await?;
    Ok((
        [
            (header::CONTENT_TYPE, hls::PLAYLIST_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        manifest,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct SeekRequest {
    pub path: String,
    pub offset_secs: f64,
    #[serde(default)]
    pub audio: u32,
}

/// `POST /stream/transcode/seek`
pub async fn seek(
    State(state): State<AppState>,
    Json(body): Json<SeekRequest>,
) -> Result<Json<SeekResponse>, AppError> {
    if body.path.is_empty() {
        return Err(ApiError::BadRequest("path is required".into()).into());
    }
    if !body.offset_secs.is_finite() || body.offset_secs < 0.0 {
        return Err(ApiError::BadRequest("offset_secs must be a non-negative number".into()).into());
    }
    let offset = body.offset_secs.min(f64::from(u32::MAX)).floor() as u32;

    let response = state
        .pipeline
        .seek(&PathBuf::from(&body.path), body.audio, offset)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct TeardownQuery {
    pub path: String,
}

#[derive(Serialize)]
pub struct TeardownResponse {
    pub removed: usize,
}

/// `DELETE /stream/transcode?path=`
pub async fn teardown(
    State(state): State<AppState>,
    Query(query): Query<TeardownQuery>,
) -> Result<Json<TeardownResponse>, AppError> {
    if query.path.is_empty() {
        return Err(ApiError::BadRequest("path is required".into()).into());
    }
    let removed = state.pipeline.teardown(&PathBuf::from(&query.path)).await;
    Ok(Json(TeardownResponse { removed }))
}

/// `GET /stream/transcode/status`
pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<TranscodeQuery>,
) -> Result<Json<BufferStatusReport>, AppError> {
    let req = query.stream_request()?;
    Ok(Json(state.pipeline.buffer_status(&req)?))
}
