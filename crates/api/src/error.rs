//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use engine::EngineError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// No caller identity on the request.
    Unauthorized(String),
    /// Bad request from the client before it reaches the engine.
    BadRequest(String),
    /// Checkout rate limit exceeded for this caller.
    RateLimited,
    /// Error surfaced by the reservation engine.
    Engine(EngineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "too many checkout requests".to_string(),
            ),
            ApiError::Engine(err) => engine_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn engine_error_to_response(err: EngineError) -> (StatusCode, String) {
    match &err {
        EngineError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        // A cart naming a nonexistent product is a bad request, not a 404:
        // the resource the caller addressed (the checkout) exists.
        EngineError::UnknownProduct { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
        EngineError::Forbidden(_) => (StatusCode::FORBIDDEN, err.to_string()),
        EngineError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        EngineError::Insufficient { .. } => (StatusCode::CONFLICT, err.to_string()),
        EngineError::IdempotencyMismatch => (StatusCode::CONFLICT, err.to_string()),
        EngineError::Gone(_) => (StatusCode::GONE, err.to_string()),
        // Storage and internal failures are opaque to callers; the detail
        // goes to the log only.
        EngineError::Storage(_) | EngineError::Internal(_) => {
            tracing::error!(error = %err, "internal server error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}
