//! Shared error handling for API endpoints.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// API error type with automatic response conversion.
///
/// Session failures do not go through here: they are answered by the
/// session gate's callbacks.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Validate a user id from a login request.
pub fn validate_user_id(user_id: &str) -> Result<(), ApiError> {
    if user_id.trim().is_empty() {
        return Err(ApiError::bad_request("userId cannot be empty"));
    }
    if user_id.len() > 256 {
        return Err(ApiError::bad_request("userId is too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("u1").is_ok());
        assert!(validate_user_id("   ").is_err());
        assert!(validate_user_id(&"x".repeat(257)).is_err());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::bad_request("x").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::not_found("x").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::internal("x").into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
