use serde::Serialize;
use thiserror::Error;

/// Unified API error type.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// The transcoder died; carries its diagnostic excerpt.
    #[error("bad gateway: {message}")]
    BadGateway { message: String, stderr: String },

    /// Retryable; the HTTP layer adds `Retry-After`.
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, retry_after_secs: u64 },
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
            Self::BadGateway { .. } => "transcoder_failed",
            Self::ServiceUnavailable { .. } => "not_ready",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Internal(_) => 500,
            Self::BadGateway { .. } => 502,
            Self::ServiceUnavailable { .. } => 503,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::ServiceUnavailable {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            Self::BadGateway { stderr, .. } => serde_json::json!({ "stderr": stderr }),
            Self::ServiceUnavailable {
                retry_after_secs, ..
            } => serde_json::json!({ "retry_after_secs": retry_after_secs }),
            _ => serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// JSON error envelope: `{ "error": { "code": "…", "message": "…", "details": {} } }`
#[derive(Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl From<&ApiError> for ErrorEnvelope {
    fn from(e: &ApiError) -> Self {
        Self {
            error: ErrorBody {
                code: e.code().to_string(),
                message: e.to_string(),
                details: e.details(),
            },
        }
    }
}
