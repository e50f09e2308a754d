// SPDX-License-Identifier: MIT

//! Application error type shared by the store, the Strava client, the worker
//! and the HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Client-visible bad request (malformed parameters, unknown credential set).
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// OAuth state nonce was unknown, expired or already consumed.
    #[error("invalid or expired authorization state")]
    BadState,

    /// The Strava token endpoint rejected a code exchange or refresh.
    #[error("token exchange failed: {0}")]
    BadCredentials(String),

    /// 401 from Strava, or a missing/invalid internal API key.
    #[error("unauthorized")]
    Unauthorized,

    /// 403 from Strava (insufficient scope).
    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    /// 429 from Strava.
    #[error("rate limited (429)")]
    RateLimited,

    /// 5xx from Strava.
    #[error("strava server error ({status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("cancelled")]
    Cancelled,
}

impl AppError {
    /// Whether a queue item that failed with this error should be released
    /// for retry. Terminal classes complete without retry instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::RateLimited
                | AppError::ServerError { .. }
                | AppError::Network(_)
                | AppError::Decode(_)
        )
    }

    /// Terminal Strava errors: the referenced object is gone or the athlete
    /// has revoked access, so retrying cannot help.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppError::NotFound(_) | AppError::Unauthorized)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AppError::RateLimited)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Text bodies throughout: the webhook and events endpoints are
        // machine-to-machine and the OAuth callback renders its own HTML.
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::BadState => (
                StatusCode::BAD_REQUEST,
                "Invalid or expired authorization request. Please try again.".to_string(),
            ),
            AppError::BadCredentials(_) => {
                tracing::error!(error = %self, "Token exchange failed");
                (
                    StatusCode::BAD_REQUEST,
                    "Failed to complete authorization".to_string(),
                )
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::RateLimited
            | AppError::ServerError { .. }
            | AppError::Network(_)
            | AppError::Decode(_) => {
                tracing::error!(error = %self, "Upstream error");
                (StatusCode::BAD_GATEWAY, "Upstream error".to_string())
            }
            AppError::Store(err) => {
                tracing::error!(error = %err, "Store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Cancelled => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        (status, message).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(AppError::RateLimited.is_retryable());
        assert!(AppError::ServerError {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!AppError::Unauthorized.is_retryable());
        assert!(!AppError::NotFound("activity 1".into()).is_retryable());
    }

    #[test]
    fn terminal_classification() {
        assert!(AppError::NotFound("x".into()).is_terminal());
        assert!(AppError::Unauthorized.is_terminal());
        assert!(!AppError::RateLimited.is_terminal());
        assert!(!AppError::Forbidden.is_terminal());
    }
}
