//! Error types, stable error codes, and HTTP response conversion
//!
//! Every failure the gateway can surface to a consumer maps to exactly one
//! variant here, each with a stable code and a fixed HTTP status. Responses
//! use the JSON envelope:
//!
//! ```json
//! { "success": false,
//!   "error": { "code": "RATE_LIMITED", "message": "..." },
//!   "meta": { "requestId": "...", "traceId": "..." } }
//! ```

use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
///
/// The `RateLimited` variant carries the policy headers (`X-RateLimit-*`,
/// `Retry-After`) computed by the policy engine so the response builder can
/// attach them to the 429.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid credential
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// No connector/endpoint matched, or the connector is not visible to
    /// the principal (authorization failures are deliberately
    /// indistinguishable from missing routes)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Principal is authenticated but not permitted (endpoint scoping,
    /// IP allowlist)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request body exceeds the effective size cap
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Rate limit or quota exceeded; carries the policy headers
    #[error("Rate limit exceeded")]
    RateLimited { headers: Vec<(String, String)> },

    /// Request failed header/body validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Upstream host is not in the connector's allowlist
    #[error("Blocked host: {0}")]
    BlockedHost(String),

    /// Upstream attempt exceeded its per-attempt timeout
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Could not reach the upstream (DNS, connect, TLS)
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Upstream transport failed mid-exchange, or an unclassified proxy
    /// failure
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream answered with a 4xx/5xx that is passed through verbatim
    #[error("Upstream returned status {status}")]
    UpstreamBadStatus { status: u16, message: String },

    /// Configuration error (boot-time validation, figment extraction)
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Invalid connector or endpoint definition caught at boot
    #[error("Invalid gateway definition: {0}")]
    Definition(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything unexpected; never leaks internals to the consumer
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error code for the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::BlockedHost(_) => "BLOCKED_HOST",
            Error::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            Error::UpstreamUnreachable(_) => "UPSTREAM_UNREACHABLE",
            Error::Upstream(_) => "UPSTREAM_ERROR",
            Error::UpstreamBadStatus { .. } => "UPSTREAM_BAD_STATUS",
            Error::Config(_) | Error::Definition(_) | Error::Io(_) | Error::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Fixed HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Validation(_) | Error::BlockedHost(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::UpstreamUnreachable(_) | Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::UpstreamBadStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::Config(_) | Error::Definition(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show to the consumer
    ///
    /// Internal variants collapse to a generic message so configuration
    /// details and I/O paths never leave the process.
    pub fn consumer_message(&self) -> String {
        match self {
            Error::Config(_) | Error::Definition(_) | Error::Io(_) | Error::Internal(_) => {
                "internal server error".to_string()
            }
            Error::RateLimited { .. } => "rate limit exceeded".to_string(),
            Error::UpstreamBadStatus { status, .. } => {
                format!("upstream returned status {}", status)
            }
            other => other.to_string(),
        }
    }

    /// Extra response headers this error carries (policy headers on 429)
    pub fn extra_headers(&self) -> &[(String, String)] {
        match self {
            Error::RateLimited { headers } => headers,
            _ => &[],
        }
    }

    /// Render the consumer-facing response envelope with correlation IDs
    pub fn into_envelope(self, request_id: &str, trace_id: &str) -> Response {
        let status = self.status();

        if matches!(
            self,
            Error::Config(_) | Error::Definition(_) | Error::Io(_) | Error::Internal(_)
        ) {
            tracing::error!(code = self.code(), error = %self, "gateway internal error");
        }

        let body = ErrorEnvelope::new(self.code(), self.consumer_message(), request_id, trace_id);

        let mut response = (status, Json(body)).into_response();
        for (name, value) in self.extra_headers() {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Fallback path without correlation IDs; the pipeline always goes
        // through `into_envelope` instead.
        self.into_envelope("unknown", "unknown")
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

/// Error response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorDetail,
    pub meta: ResponseMeta,
}

/// Code and message inside the envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Correlation IDs attached to every envelope
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub request_id: String,
    pub trace_id: String,
}

impl ErrorEnvelope {
    /// Create a new envelope
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        request_id: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
            meta: ResponseMeta {
                request_id: request_id.into(),
                trace_id: trace_id.into(),
            },
        }
    }
}
