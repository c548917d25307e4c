//! JSON error responses for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mg_types::GatewayError;
use serde::Serialize;

/// Error payload returned by every non-2xx JSON response.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    /// Short error category, e.g. "Not found".
    pub error: String,
    /// Human-readable detail.
    pub message: String,
    /// Seconds until a rate-limited caller may retry. Only set on 429.
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug)]
pub struct ApiErrorResponse {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiErrorResponse {
    fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.to_string(),
                message: message.into(),
                retry_after: None,
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Bad request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "Forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found", message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_secs: u64) -> Self {
        let mut response = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded",
            message,
        );
        response.body.retry_after = Some(retry_after_secs);
        response
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "Upstream unavailable", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            message,
        )
    }
}

impl From<&GatewayError> for ApiErrorResponse {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::Validation(msg) => Self::bad_request(msg.clone()),
            GatewayError::Unauthorized(msg) => Self::unauthorized(msg.clone()),
            GatewayError::Forbidden(msg) => Self::forbidden(msg.clone()),
            GatewayError::NotFound(what) => Self::not_found(what.clone()),
            GatewayError::RateLimited { retry_after_secs } => {
                Self::rate_limited("Too many requests, please try again later", *retry_after_secs)
            }
            GatewayError::UpstreamUnavailable(msg) => Self::bad_gateway(msg.clone()),
            other => Self::internal_error(other.to_string()),
        }
    }
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(&self.body)).into_response();
        if let Some(retry_after) = self.body.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}
