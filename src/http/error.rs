//! HTTP error handling and response types.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::manager::RoutingError;

/// API error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, ApiError::new("UNAUTHORIZED", msg)),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, ApiError::new("FORBIDDEN", msg)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ApiError::new("NOT_FOUND", msg)),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ApiError::new("BAD_REQUEST", msg)),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, ApiError::new("CONFLICT", msg)),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::new("INTERNAL_ERROR", msg),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl From<RoutingError> for AppError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::NotFound(_) => AppError::NotFound(err.to_string()),
            RoutingError::Invalid(msg) => AppError::BadRequest(msg),
            RoutingError::Conflict(msg) => AppError::Conflict(msg),
            RoutingError::AlreadyRunning => AppError::Conflict(err.to_string()),
            RoutingError::Database(_) | RoutingError::Internal(_) => {
                error!(?err, "request failed");
                AppError::Internal("internal server error".to_string())
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_errors_map_to_status() {
        let cases = [
            (RoutingError::NotFound("route rt_1".into()), StatusCode::NOT_FOUND),
            (RoutingError::Invalid("bad".into()), StatusCode::BAD_REQUEST),
            (RoutingError::Conflict("taken".into()), StatusCode::CONFLICT),
            (RoutingError::AlreadyRunning, StatusCode::CONFLICT),
            (
                RoutingError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }
}
