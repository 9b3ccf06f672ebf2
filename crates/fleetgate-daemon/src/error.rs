//! Handler error type mapped onto the HTTP error taxonomy.
//!
//! Not-found hides existence (validation failures on path parameters also
//! land here), conflicts are duplicate rollouts or duplicate `name`
//! labels, and anything unexpected is logged server-side and surfaced as
//! a bare 500 so internals never leak into responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fleetgate_core::store::StoreError;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("Not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Logs the underlying error and returns an opaque 500 carrying only
    /// the short, user-safe message.
    pub fn internal(err: impl std::fmt::Display, message: &str) -> Self {
        error!(error = %err, "{message}");
        Self::Internal(message.to_string())
    }

    /// Maps a storage failure for read paths: missing files become 404,
    /// unique violations become conflicts.
    pub fn from_store(err: StoreError, message: &str) -> Self {
        if err.is_not_found() {
            Self::NotFound
        } else if err.is_unique_violation() {
            Self::Conflict(message.to_string())
        } else {
            Self::internal(err, message)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        let cases = [
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ApiError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (ApiError::NotFound, StatusCode::NOT_FOUND),
            (ApiError::Conflict("x".into()), StatusCode::CONFLICT),
            (ApiError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
