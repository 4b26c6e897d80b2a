//! Classification of upstream delivery failures.
//!
//! Transport errors arrive wrapped in several layers (reqwest -> hyper -> io). The
//! classifier walks the whole `source()` chain and reports the first link that is
//! recognisably a timeout or a connection-level failure.
use std::{error::Error as StdError, io};

use http::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The upstream did not answer in time.
    Timeout,
    /// DNS, dial, reset or other connection-level failures.
    Connection,
    Other,
}

impl FailureKind {
    pub fn status(self) -> StatusCode {
        match self {
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Connection | Self::Other => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Classify an error by inspecting it and every error in its source chain.
pub fn classify(err: &(dyn StdError + 'static)) -> FailureKind {
    let mut saw_connection = false;
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);

    while let Some(e) = current {
        match classify_link(e) {
            FailureKind::Timeout => return FailureKind::Timeout,
            FailureKind::Connection => saw_connection = true,
            FailureKind::Other => {}
        }
        current = e.source();
    }

    if saw_connection {
        FailureKind::Connection
    } else {
        FailureKind::Other
    }
}

fn classify_link(e: &(dyn StdError + 'static)) -> FailureKind {
    if e.is::<tokio::time::error::Elapsed>() {
        return FailureKind::Timeout;
    }

    if let Some(req) = e.downcast_ref::<reqwest::Error>() {
        if req.is_timeout() {
            return FailureKind::Timeout;
        }
        if req.is_connect() {
            return FailureKind::Connection;
        }
        return FailureKind::Other;
    }

    if let Some(io_err) = e.downcast_ref::<io::Error>() {
        return match io_err.kind() {
            io::ErrorKind::TimedOut => FailureKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::UnexpectedEof => FailureKind::Connection,
            // Custom io errors hide their payload from `source()`.
            _ => io_err.get_ref().map_or(FailureKind::Other, |inner| classify(inner)),
        };
    }

    if let Some(client) = e.downcast_ref::<crate::ports::http_client::HttpClientError>() {
        return client.failure_kind();
    }

    FailureKind::Other
}

/// Coerce an upstream status into the valid HTTP range; anything outside
/// `100..=599` (including the degenerate `0`) becomes 502.
pub fn normalize_status(raw: u16) -> StatusCode {
    if (100..=599).contains(&raw) {
        StatusCode::from_u16(raw).unwrap_or(StatusCode::BAD_GATEWAY)
    } else {
        StatusCode::BAD_GATEWAY
    }
}
