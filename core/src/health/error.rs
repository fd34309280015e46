//! Error types for health check operations

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during a single health check attempt
///
/// None of these are fatal: during startup an unreachable target is the
/// expected state, and the readiness loop simply retries.
#[derive(Error, Debug)]
pub enum HealthError {
    /// The health check timed out
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// TCP connection failed
    #[error("tcp connection failed: {0}")]
    Tcp(#[from] std::io::Error),

    /// HTTP request failed at the transport level
    #[error("http request failed: {0}")]
    Http(#[from] hyper::Error),

    /// The configured URL could not be parsed
    #[error("invalid url: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    /// The request could not be built
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    /// The endpoint answered with a non-2xx status
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
}
