use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Gateway error taxonomy
// ---------------------------------------------------------------------------

/// Failure kinds of the realtime gateway.
///
/// `AuthFailed`, `Banned` and a connection-level `RateLimited` end a
/// connection attempt before it becomes active. Every other kind is turned
/// into an `error` event for the originating connection only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("account is banned")]
    Banned,
    #[error("rate limited, retry after {}ms", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },
    #[error("{0}")]
    ValidationFailed(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AuthFailed(_) => "AUTH_FAILED",
            GatewayError::Banned => "BANNED",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::ValidationFailed(_) => "VALIDATION_FAILED",
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Upstream(_) => "UPSTREAM_FAILURE",
        }
    }

    /// Payload of the scoped `error` event.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "errorCode": self.code(),
            "message": self.client_message(),
        });
        if let GatewayError::RateLimited { retry_after } = self {
            payload["retryAfterMs"] = json!(retry_after.as_millis() as u64);
        }
        payload
    }

    /// Message safe to show to a client. Upstream details stay in the logs.
    fn client_message(&self) -> String {
        match self {
            GatewayError::Upstream(_) => "A dependent service is unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        tracing::error!(?err, "redis error");
        Self::upstream("shared store unavailable")
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        tracing::error!(?err, "upstream http error");
        Self::upstream("upstream service request failed")
    }
}

// ---------------------------------------------------------------------------
// HTTP error body
// ---------------------------------------------------------------------------

/// Structured API error returned to HTTP clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub retry_after_ms: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND".to_string(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED".to_string(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "CONFLICT".to_string(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GONE,
            code: "GONE".to_string(),
            message: message.into(),
            retry_after_ms: None,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Banned => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        let retry_after_ms = match &err {
            GatewayError::RateLimited { retry_after } => Some(retry_after.as_millis() as u64),
            _ => None,
        };
        Self {
            status,
            code: err.code().to_string(),
            message: err.client_message(),
            retry_after_ms,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
                retry_after_ms: self.retry_after_ms,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
