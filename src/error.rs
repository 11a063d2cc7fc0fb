//! Gateway error taxonomy and its HTTP mapping.
//!
//! Internal plumbing uses `anyhow`; everything that can cross the ingress
//! boundary is classified here so handlers map failures to status codes in
//! one place. Messages sent to clients carry the kind and a short
//! description only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("admin role required")]
    Forbidden,

    #[error("No available servers")]
    NoAvailableServers,

    #[error("server {0} is not accepting tasks")]
    ServerUnavailable(String),

    #[error("server {0} is at capacity")]
    AtCapacity(String),

    #[error("backend request failed: {0}")]
    Backend(String),

    #[error("{0}")]
    IllegalTransition(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::IllegalTransition(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NoAvailableServers
            | ApiError::ServerUnavailable(_)
            | ApiError::AtCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Backend(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal failures are logged with full detail but never leak
        // their cause chain to the client.
        let message = match &self {
            ApiError::Internal(err) => {
                tracing::error!("internal error: {:#}", err);
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
