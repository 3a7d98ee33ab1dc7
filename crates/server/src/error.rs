use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use reelcast_core::error::{ApiError, ErrorEnvelope};
use reelcast_transcoder::TranscodeError;

/// Newtype wrapper so we can implement `IntoResponse` in this crate.
pub struct AppError(pub ApiError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let envelope = ErrorEnvelope::from(&self.0);
        let mut response = (status, Json(envelope)).into_response();
        if let Some(secs) = self.0.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        Self(e)
    }
}

impl From<TranscodeError> for AppError {
    fn from(e: TranscodeError) -> Self {
        let api = match e {
            TranscodeError::SourceNotFound(path) => {
                ApiError::NotFound(format!("source not found: {}", path.display()))
            }
            TranscodeError::SessionNotFound(key) => {
                ApiError::NotFound(format!("no active session for {key}"))
            }
            TranscodeError::SegmentNotFound(segment) => {
                ApiError::NotFound(format!("segment not found: {segment}"))
            }
            TranscodeError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            TranscodeError::ProcessExited { code, stderr } => ApiError::BadGateway {
                message: match code {
                    Some(code) => format!("transcoder exited with status {code}"),
                    None => "transcoder was terminated".to_string(),
                },
                stderr,
            },
            TranscodeError::NotReady { retry_after } => ApiError::ServiceUnavailable {
                message: "stream is not ready yet".to_string(),
                retry_after_secs: retry_after.as_secs().max(1),
            },
            TranscodeError::SpawnFailed(msg) => {
                ApiError::Internal(format!("failed to start transcoder: {msg}"))
            }
            TranscodeError::ProbeFailed(msg) => ApiError::Internal(format!("ffprobe error: {msg}")),
            TranscodeError::Io(e) => ApiError::Internal(format!("io error: {e}")),
        };
        Self(api)
    }
}
