use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type. Unlike a typical status-always-200 API,
/// streaming/HLS clients branch on the actual HTTP status code, so every
/// variant maps to a real one below.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("evicted: {0}")]
    Evicted(String),

    #[error("consumer gone: {0}")]
    ConsumerGone(String),

    #[error("decode failure: {0}")]
    DecodeFailure(String),

    #[error("resource limit: {0}")]
    ResourceLimit(String),

    #[error("not available in MJPEG source mode")]
    MjpegModeUnavailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::MjpegModeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Evicted(_) => StatusCode::NOT_FOUND,
            AppError::ConsumerGone(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::DecodeFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ResourceLimit(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.to_string(),
        };

        tracing::warn!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.error,
            status = status.as_u16(),
            "request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_maps_to_503() {
        let err = AppError::NotReady("waiting for keyframe".into());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn evicted_maps_to_404() {
        let err = AppError::Evicted("segment 10 no longer in window".into());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
