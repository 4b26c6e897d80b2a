//! User-visible dispatcher errors.
//!
//! Every rejection the gateway produces itself (as opposed to relaying an upstream
//! answer) is a `GatewayError`. It renders as `{"error": "...", "details": "..."}` with
//! `details` omitted when empty, plus any status-specific headers.
use axum::{
    body::Body as AxumBody,
    http::{HeaderValue, Response, StatusCode, header},
    response::IntoResponse,
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    core::failure::FailureKind,
    ports::{access::AccessDecision, http_client::HttpClientError},
};

pub const CIRCUIT_BREAKER_HEADER: &str = "x-circuit-breaker";
/// Seconds suggested to a client rejected by the concurrency limiter.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Not Found")]
    RouteNotFound { path: String },

    #[error("Unauthorized")]
    Unauthenticated,

    #[error("Forbidden")]
    Forbidden,

    #[error("WebSocket Not Supported")]
    UpgradeNotSupported,

    #[error("Service Unavailable")]
    CircuitOpen,

    #[error("Too Many Requests")]
    ConcurrencyLimited { retry_after_secs: u64 },

    #[error("Bad Gateway")]
    BadGateway { details: String },

    #[error("Gateway Timeout")]
    GatewayTimeout { details: String },
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    details: &'a str,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::UpgradeNotSupported => StatusCode::NOT_IMPLEMENTED,
            Self::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConcurrencyLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn details(&self) -> &str {
        match self {
            Self::RouteNotFound { .. } => "no active proxy matches this path",
            Self::UpgradeNotSupported => "protocol upgrades are not proxied by the gateway",
            Self::CircuitOpen => "upstream circuit breaker is open",
            Self::ConcurrencyLimited { .. } => "route concurrency limit reached",
            Self::BadGateway { details } | Self::GatewayTimeout { details } => details,
            Self::Unauthenticated | Self::Forbidden => "",
        }
    }

    /// Map a failed upstream call to 504 (timeout) or 502 (everything else).
    pub fn from_upstream(err: &HttpClientError) -> Self {
        let details = err.to_string();
        match err.failure_kind() {
            FailureKind::Timeout => Self::GatewayTimeout { details },
            FailureKind::Connection | FailureKind::Other => Self::BadGateway { details },
        }
    }

    /// Error for a denied access decision; `None` when access is allowed.
    pub fn from_access(decision: AccessDecision) -> Option<Self> {
        if decision.is_allowed() {
            return None;
        }
        Some(match decision {
            AccessDecision::Unauthenticated => Self::Unauthenticated,
            _ => Self::Forbidden,
        })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<AxumBody> {
        let body = ErrorBody {
            error: self.to_string(),
            details: self.details(),
        };
        let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

        let mut response = Response::new(AxumBody::from(payload));
        *response.status_mut() = self.status();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        match &self {
            Self::CircuitOpen => {
                headers.insert(CIRCUIT_BREAKER_HEADER, HeaderValue::from_static("open"));
            }
            Self::ConcurrencyLimited { retry_after_secs } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            }
            _ => {}
        }

        response
    }
}
