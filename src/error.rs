//! Crate-wide error taxonomy.
//!
//! Every component reports through [`ProxyError`] so the HTTP edge maps
//! exactly one status code per error kind (spec section 7), and so that
//! an event can always carry the error classification in its metadata.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to the reverse-proxy edge.
///
/// `status_code` is the single place mapping an error kind to a wire
/// status; no other module should construct a raw `StatusCode` for a
/// request-processing failure.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed request: bad method/path, missing required header,
    /// disallowed origin, param-whitelist violation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid bearer token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Valid token, but the project (or the operation) is not permitted.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Path does not match any configured endpoint.
    #[error("not found: {0}")]
    NotFound(String),

    /// Method not in `allowed_methods` for the matched endpoint.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Token has no remaining request budget.
    #[error("rate limited: {0}")]
    RateLimited {
        /// Human-readable detail.
        detail: String,
        /// Seconds until the caller may retry.
        retry_after: u64,
    },

    /// Inbound body exceeds the configured cap.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Upstream connection could not be established or was reset.
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// Upstream did not respond within the configured timeout.
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Token store or project store is unreachable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Event bus (durable variant) is unreachable.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// Any other internal failure that should not leak detail to the client.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// The deterministic status mapping from spec section 4.4 / 7.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) | ProxyError::PayloadTooLarge(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::StoreUnavailable(_) | ProxyError::BusUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A short, machine-stable error code, independent of the detail message.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::Unauthorized(_) => "unauthorized",
            ProxyError::Forbidden(_) => "forbidden",
            ProxyError::NotFound(_) => "not_found",
            ProxyError::MethodNotAllowed(_) => "method_not_allowed",
            ProxyError::RateLimited { .. } => "rate_limited",
            ProxyError::PayloadTooLarge(_) => "payload_too_large",
            ProxyError::UpstreamTransport(_) => "upstream_transport",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
            ProxyError::StoreUnavailable(_) => "store_unavailable",
            ProxyError::BusUnavailable(_) => "bus_unavailable",
            ProxyError::Internal(_) => "internal",
        }
    }
}

/// JSON body returned to the client for any [`ProxyError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Nested so clients can pattern-match on `error.code` alone.
    pub error: ErrorDetail,
    /// Echoes the request id so the client can correlate with logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// When the error was generated.
    pub timestamp: DateTime<Utc>,
}

/// The nested error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-stable identifier, e.g. `"rate_limited"`.
    pub code: String,
    /// Human-readable detail message.
    pub message: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if matches!(self, ProxyError::Internal(_) | ProxyError::StoreUnavailable(_)) {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let mut response = (
            self.status_code(),
            Json(ErrorBody {
                error: ErrorDetail {
                    code: self.code().to_string(),
                    message: self.to_string(),
                },
                request_id: None,
                timestamp: Utc::now(),
            }),
        )
            .into_response();

        if let ProxyError::RateLimited { retry_after, .. } = &self {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}
