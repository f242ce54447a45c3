//! Structured error envelope.
//!
//! Every error leaves the API as `{"error":{"code":...,"message":...}}` with
//! the taxonomy code token. Internal errors are redacted in the response;
//! the full chain goes to the log with the request id.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use smelter_core::SmelterError;

use crate::request_id;

pub struct ApiError(pub SmelterError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<SmelterError> for ApiError {
    fn from(e: SmelterError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            SmelterError::Internal(chain) => {
                tracing::error!(
                    request_id = request_id::current().as_deref().unwrap_or("-"),
                    error = ?chain,
                    "internal error"
                );
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = json!({ "error": { "code": self.0.code(), "message": message } });
        (status, Json(body)).into_response()
    }
}

/// Shorthand for handlers that bail on validation.
pub fn invalid(msg: impl Into<String>) -> ApiError {
    ApiError(SmelterError::InvalidArgument(msg.into()))
}

pub fn not_found(msg: impl Into<String>) -> ApiError {
    ApiError(SmelterError::NotFound(msg.into()))
}
