//! Crate-wide error type and its mapping onto the HTTP and WebSocket surfaces.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json as AxumJson, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Structured error kinds shared by the realtime broker and the download endpoint.
///
/// Every variant maps to a stable string in `AppError::code`, which is what
/// callers see in WebSocket acks and what `IntoResponse` turns into an HTTP
/// status for the download endpoint.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    #[error("event references a session the caller hasn't joined")]
    NotInSession,

    #[error("session not found")]
    SessionNotFound,

    #[error("fingerprint does not match this session")]
    InvalidPassphrase,

    #[error("authentication required")]
    AuthRequired,

    #[error("session token is invalid")]
    InvalidToken,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("content not found")]
    ContentNotFound,

    #[error("content was removed")]
    Gone,

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Catch-all for unexpected errors, logged with correlation info and
    /// reported to the client only as an opaque `INTERNAL_ERROR`.
    #[error("internal error")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotInSession => "NOT_IN_SESSION",
            AppError::SessionNotFound => "SESSION_NOT_FOUND",
            AppError::InvalidPassphrase => "INVALID_PASSPHRASE",
            AppError::AuthRequired => "AUTH_REQUIRED",
            AppError::InvalidToken => "INVALID_TOKEN",
            AppError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            AppError::ContentNotFound => "CONTENT_NOT_FOUND",
            AppError::Gone => "GONE",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!(error = %err, "internal error");
        AppError::Internal(err.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::internal(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::internal(err)
    }
}

/// Shape of the `ack` object every WebSocket event handler replies with.
#[derive(Serialize)]
pub struct ErrorAck {
    pub success: bool,
    pub error: String,
}

impl From<&AppError> for ErrorAck {
    fn from(err: &AppError) -> Self {
        ErrorAck {
            success: false,
            error: err.code().to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotInSession | AppError::SessionNotFound => StatusCode::NOT_FOUND,
            AppError::InvalidPassphrase => StatusCode::UNAUTHORIZED,
            AppError::AuthRequired | AppError::InvalidToken => StatusCode::FORBIDDEN,
            AppError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ContentNotFound => StatusCode::NOT_FOUND,
            AppError::Gone => StatusCode::GONE,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = AxumJson(json!({
            "error": {
                "type": self.code(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}
