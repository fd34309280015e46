//! Health checking and readiness probing
//!
//! This module provides the TCP and HTTP check primitives and the bounded
//! readiness loop the supervisor runs after launching each service.
//!
//! ## Types
//!
//! - [`Probe`]: The trait for a single check attempt
//! - [`TcpProbe`]: TCP connection-based checking
//! - [`HttpProbe`]: HTTP GET checking, 2xx means healthy
//! - [`ReadinessProbe`]: Retry loop over a [`schema::ReadinessSpec`]
//! - [`HealthError`]: Why a single attempt failed

pub mod error;
pub mod http;
pub mod readiness;
pub mod tcp;
pub mod types;

pub use error::HealthError;
pub use http::HttpProbe;
pub use readiness::{ReadinessOutcome, ReadinessProbe};
pub use tcp::TcpProbe;
pub use types::Probe;

use schema::ReadinessSpec;
use std::time::Duration;

/// Create a probe from a readiness declaration
///
/// Fixed-delay declarations have no health signal and yield `None`.
pub fn create_probe(spec: &ReadinessSpec) -> Option<Box<dyn Probe + Send + Sync>> {
    match spec {
        ReadinessSpec::FixedDelay { .. } => None,
        ReadinessSpec::TcpConnect {
            host,
            port,
            timeout_ms,
            ..
        } => Some(Box::new(TcpProbe::new(
            host.clone(),
            *port,
            Duration::from_millis(*timeout_ms),
        ))),
        ReadinessSpec::HttpHealth {
            url, timeout_ms, ..
        } => Some(Box::new(HttpProbe::new(
            url.clone(),
            Duration::from_millis(*timeout_ms),
        ))),
    }
}
