//! JSON error responses for the HTTP API.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use tg_core::GovernError;

/// API error with status code and message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    /// Seconds for the `Retry-After` header.
    pub retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into(), retry_after: None }
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }
    pub fn gone(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::GONE, "gone", msg)
    }
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "feature_disabled", msg)
    }
    pub fn too_many(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, code, msg)
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<GovernError> for ApiError {
    fn from(err: GovernError) -> Self {
        let message = err.to_string();
        match &err {
            GovernError::QuotaExceeded { .. } => ApiError::too_many("quota_exceeded", message),
            GovernError::RateLimited { retry_after } => {
                let mut api = ApiError::too_many("rate_limited", message);
                // whole seconds, rounded up
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                api.retry_after = Some(secs.max(1));
                api
            }
            GovernError::ConcurrencyExceeded { .. } => {
                let mut api = ApiError::too_many("concurrency_exceeded", message);
                api.retry_after = Some(1);
                api
            }
            GovernError::SessionNotFound { .. } | GovernError::StreamNotFound { .. } => ApiError::not_found(message),
            GovernError::SessionExpired { .. } | GovernError::StreamTerminated { .. } => ApiError::gone(message),
            GovernError::FeatureDisabled { .. } => ApiError::forbidden(message),
            GovernError::DimensionNotMetered { .. } | GovernError::Memory(_) => ApiError::bad_request(message),
            GovernError::StreamTimeout(_) => ApiError::new(StatusCode::GATEWAY_TIMEOUT, "timeout", message),
            _ => ApiError::internal(message),
        }
    }
}
