//! Core types and traits for health checking

use super::HealthError;
use async_trait::async_trait;

/// Trait for health check implementations
///
/// This trait is implemented by specific probe types (TCP, HTTP)
/// to provide a uniform interface for a single check attempt.
#[async_trait]
pub trait Probe {
    /// Execute the health check once
    ///
    /// Returns `Ok(())` if the check passes, or an error describing what went wrong.
    /// The implementation should respect the configured timeout.
    async fn check(&self) -> Result<(), HealthError>;

    /// Human-readable description of the probed target
    fn target(&self) -> String;
}
