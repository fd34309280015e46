//! Readiness gating with bounded retries
//!
//! A [`ReadinessProbe`] turns a [`ReadinessSpec`] into a bounded polling loop.
//! Polling probes make one initial attempt plus `max_retries` retries,
//! pausing `retry_interval_ms` between attempts. A refused or unreachable
//! target is the normal state of a server that is still loading, so failed
//! attempts are logged at debug level and never surface as errors; only
//! exhausting the budget yields [`ReadinessOutcome::TimedOut`].
//!
//! Every wait inside the loop races against a cancellation token, so a stop
//! issued mid-start interrupts probing immediately.

use super::{create_probe, Probe};
use schema::ReadinessSpec;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of waiting for a service to become ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The probe succeeded (or the fixed delay elapsed)
    Ready {
        /// Attempts made, including the successful one
        attempts: u32,
    },
    /// Every attempt failed
    TimedOut {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: Option<String>,
    },
    /// The wait was interrupted by cancellation
    Cancelled,
}

impl ReadinessOutcome {
    /// Whether the outcome is `Ready`
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Polls a service's readiness condition
pub struct ReadinessProbe {
    spec: ReadinessSpec,
    probe: Option<Box<dyn Probe + Send + Sync>>,
}

impl std::fmt::Debug for ReadinessProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessProbe")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl ReadinessProbe {
    /// Create a probe for the given readiness declaration
    pub fn new(spec: ReadinessSpec) -> Self {
        let probe = create_probe(&spec);
        Self { spec, probe }
    }

    /// The readiness declaration this probe polls
    pub fn spec(&self) -> &ReadinessSpec {
        &self.spec
    }

    /// Wait until ready, the retry budget is exhausted, or `cancel` fires
    pub async fn await_ready(&self, cancel: &CancellationToken) -> ReadinessOutcome {
        let (probe, max_retries, retry_interval) = match (&self.spec, &self.probe) {
            (ReadinessSpec::FixedDelay { delay_ms }, _) => {
                debug!("Fixed-delay readiness: waiting {}ms", delay_ms);
                return tokio::select! {
                    _ = cancel.cancelled() => ReadinessOutcome::Cancelled,
                    _ = sleep(Duration::from_millis(*delay_ms)) => ReadinessOutcome::Ready { attempts: 1 },
                };
            }
            (
                ReadinessSpec::TcpConnect {
                    max_retries,
                    retry_interval_ms,
                    ..
                }
                | ReadinessSpec::HttpHealth {
                    max_retries,
                    retry_interval_ms,
                    ..
                },
                Some(probe),
            ) => (probe, *max_retries, Duration::from_millis(*retry_interval_ms)),
            (_, None) => {
                return ReadinessOutcome::TimedOut {
                    attempts: 0,
                    last_error: Some("no probe for readiness declaration".to_string()),
                }
            }
        };

        let budget = max_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 1..=budget {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ReadinessOutcome::Cancelled,
                result = probe.check() => result,
            };

            match result {
                Ok(()) => {
                    debug!("{} ready on attempt {}/{}", probe.target(), attempt, budget);
                    return ReadinessOutcome::Ready { attempts: attempt };
                }
                Err(e) => {
                    debug!(
                        "{} not ready on attempt {}/{}: {}",
                        probe.target(),
                        attempt,
                        budget,
                        e
                    );
                    last_error = Some(e.to_string());
                }
            }

            if attempt < budget {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ReadinessOutcome::Cancelled,
                    _ = sleep(retry_interval) => {}
                }
            }
        }

        ReadinessOutcome::TimedOut {
            attempts: budget,
            last_error,
        }
    }

    /// Run a single check with no retries
    ///
    /// Returns `None` for fixed-delay declarations, which carry no health signal.
    pub async fn check_once(&self) -> Option<bool> {
        match &self.probe {
            Some(probe) => Some(probe.check().await.is_ok()),
            None => None,
        }
    }
}
