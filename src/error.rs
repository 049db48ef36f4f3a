use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::webhook::WebhookError;

/// Stable error codes exposed to gateway clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    TokenExpired,
    RateLimitExceeded,
    ValidationError,
    BatchNotFound,
    NotFound,
    ServiceUnavailable,
    GatewayTimeout,
    MissingWebhookHeaders,
    InvalidWebhookSignature,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::BatchNotFound => "BATCH_NOT_FOUND",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
            ErrorCode::MissingWebhookHeaders => "MISSING_WEBHOOK_HEADERS",
            ErrorCode::InvalidWebhookSignature => "INVALID_WEBHOOK_SIGNATURE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Code for a backend status that carried no code of its own.
    pub fn from_status(status: StatusCode, not_found: ErrorCode) -> Self {
        match status.as_u16() {
            400 | 422 => ErrorCode::ValidationError,
            401 => ErrorCode::Unauthorized,
            404 => not_found,
            429 => ErrorCode::RateLimitExceeded,
            503 => ErrorCode::ServiceUnavailable,
            504 => ErrorCode::GatewayTimeout,
            _ => ErrorCode::InternalError,
        }
    }
}

/// JSON body of every gateway error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
            timestamp: Some(now_rfc3339()),
        }
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Backend request timed out")]
    GatewayTimeout,

    #[error("Backend service unavailable")]
    ServiceUnavailable,

    #[error("{0}")]
    Validation(String),

    #[error("Webhook verification is not configured")]
    WebhookNotConfigured,

    #[error("{0}")]
    Webhook(#[from] WebhookError),

    /// A translated backend error response.
    #[error("{}", .body.error)]
    Backend { status: StatusCode, body: ErrorBody },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::ServiceUnavailable | ApiError::WebhookNotConfigured => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Webhook { .. } => StatusCode::BAD_REQUEST,
            ApiError::Backend { status, .. } => *status,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::Unauthorized => ErrorCode::Unauthorized,
            ApiError::Validation(_) => ErrorCode::ValidationError,
            ApiError::GatewayTimeout => ErrorCode::GatewayTimeout,
            ApiError::ServiceUnavailable | ApiError::WebhookNotConfigured => {
                ErrorCode::ServiceUnavailable
            }
            ApiError::Webhook(WebhookError::MissingHeaders) => ErrorCode::MissingWebhookHeaders,
            ApiError::Webhook(WebhookError::InvalidSignature) => ErrorCode::InvalidWebhookSignature,
            ApiError::Backend { .. } => ErrorCode::InternalError,
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            ApiError::Backend { body, .. } => body.clone(),
            other => ErrorBody::new(other.to_string(), other.code().as_str()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
