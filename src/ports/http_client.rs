use std::{pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use futures_util::Stream;
use http::{HeaderMap, Method};
use thiserror::Error;

use crate::{
    config::models::TimeoutConfig,
    core::failure::{self, FailureKind},
};

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream fails (DNS, dial, reset)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the upstream does not answer in time
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Any other transport failure, kept for source-chain inspection
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl HttpClientError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::ConnectionError(_) => FailureKind::Connection,
            Self::InvalidRequest(_) => FailureKind::Other,
            Self::Transport(source) => failure::classify(source.as_ref()),
        }
    }
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Streamed upstream response body.
pub type UpstreamBody = Pin<Box<dyn Stream<Item = HttpClientResult<Bytes>> + Send + 'static>>;

/// Outbound request, already rewritten by the dispatcher.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: AxumBody,
    /// Deadline for receiving the response head; the body is bounded by the caller.
    pub timeout: Duration,
}

/// Upstream response head plus its body stream.
///
/// `status` is the raw code as reported by the transport and may lie outside the
/// valid HTTP range; callers must normalise it before relaying.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<UpstreamBody>,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(|_| "<stream>"))
            .finish()
    }
}

/// HttpClient defines the port (interface) for sending requests to upstreams
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request and return as soon as the response head has arrived.
    ///
    /// # Arguments
    /// * `req` - The rewritten outbound request
    ///
    /// # Returns
    /// A future that resolves to the upstream's response head and streaming body, or an error
    async fn send_request(&self, req: UpstreamRequest) -> HttpClientResult<UpstreamResponse>;
}

/// Builds dedicated clients for routes that override transport timeouts.
pub trait HttpClientFactory: Send + Sync + 'static {
    fn with_timeouts(&self, timeouts: &TimeoutConfig) -> HttpClientResult<Arc<dyn HttpClient>>;
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            HttpClientError::Timeout(Duration::from_secs(1)).failure_kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            HttpClientError::ConnectionError("refused".into()).failure_kind(),
            FailureKind::Connection
        );
        assert_eq!(
            HttpClientError::InvalidRequest("bad url".into()).failure_kind(),
            FailureKind::Other
        );

        let nested = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(
            HttpClientError::Transport(Box::new(nested)).failure_kind(),
            FailureKind::Connection
        );
    }

    #[test]
    fn test_client_error_classified_through_io_payload() {
        let err = io::Error::other(HttpClientError::Timeout(Duration::from_millis(5)));
        let outer = HttpClientError::Transport(Box::new(err));
        assert_eq!(failure::classify(&outer), FailureKind::Timeout);
    }
}
