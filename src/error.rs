use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Mirrors the error kinds surfaced to API callers: `{success: false, error: kind, detail}`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Index inconsistency: {0}")]
    Inconsistency(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    /// The stable `error` discriminant used in API responses; distinct from the
    /// human-readable `detail` string so clients can match on it.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::InvalidPath(_) => "invalid_path",
            AppError::Io(_) => "io_error",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::QuotaExhausted(_) => "quota_exhausted",
            AppError::Inconsistency(_) => "inconsistency",
            AppError::Cancelled => "cancelled",
            AppError::Serde(_) => "bad_request",
            AppError::Config(_) => "config_error",
            AppError::Internal(_) => "internal",
            AppError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidPath(_) => StatusCode::FORBIDDEN,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::QuotaExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Inconsistency(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Cancelled => StatusCode::CONFLICT,
            AppError::Serde(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };

        let detail = match &self {
            AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        let body = json!({
            "success": false,
            "error": self.kind(),
            "detail": detail,
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
