//! Crate-wide error type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("voice provider error: {0}")]
    Provider(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("user {user} has insufficient credits ({balance}) for this call")]
    InsufficientCredits { user: String, balance: i64 },

    #[error("user {0} has a non-positive concurrent call limit")]
    NonPositiveLimit(String),

    #[error("request timed out")]
    Timeout,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps admission-level errors to the HTTP status codes spec.md §7 assigns to
/// direct-call callers. Store/transient failures surface as 503 rather than
/// leaking internal detail.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, reason) = match &self {
            Error::UnknownAgent(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::UnknownUser(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::InsufficientCredits { .. } => (StatusCode::PAYMENT_REQUIRED, self.to_string()),
            Error::NonPositiveLimit(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Timeout => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Error::Database(_) | Error::Provider(_) | Error::Internal(_) | Error::Config(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "transient store failure".to_string())
            }
        };
        (status, axum::Json(json!({ "error": reason }))).into_response()
    }
}
