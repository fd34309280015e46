//! Status reconciliation
//!
//! The tracked state is what the supervisor last observed; the process may
//! have exited or its endpoint closed since. External evidence always wins:
//!
//! | tracked               | process   | endpoint | reported  |
//! |-----------------------|-----------|----------|-----------|
//! | Starting/Ready/Degr.  | dead      | open     | Unknown   |
//! | Starting/Ready/Degr.  | dead      | closed/? | Stopped   |
//! | Starting/Ready/Degr.  | alive/?   | open     | Ready     |
//! | Ready                 | alive/?   | closed   | Unknown   |
//! | Starting/Degraded     | alive/?   | closed   | unchanged |
//! | Failed/Stopped/Pending| -         | -        | unchanged |
//! | untracked             | alive     | any      | Unknown   |
//! | untracked             | any       | open     | Unknown   |
//! | untracked             | not alive | closed   | Stopped   |
//!
//! A fixed-delay service has no endpoint signal, so only liveness applies.
//! A detached process counts as alive while anything in its process group
//! is, so a start script that forked its server and exited is still alive.

use crate::handle::ProcessHandle;
use crate::health::ReadinessProbe;
use crate::launcher::{Launcher, LivenessTarget};
use schema::{Service, ServiceState, ServiceStatus};
use tracing::debug;

pub(super) async fn reconcile(
    launcher: &dyn Launcher,
    service: &Service,
    handle: Option<&ProcessHandle>,
) -> ServiceStatus {
    let probe = ReadinessProbe::new(service.readiness.clone());

    let Some(handle) = handle else {
        let alive = match pattern_of(service) {
            Some(pattern) => {
                launcher
                    .is_alive(&LivenessTarget::Pattern(pattern.to_string()))
                    .await
            }
            None => false,
        };
        let answering = probe.check_once().await == Some(true);
        let state = if alive || answering {
            ServiceState::Unknown
        } else {
            ServiceState::Stopped
        };
        return ServiceStatus {
            id: service.id.clone(),
            name: service.label().to_string(),
            state,
            tracked_state: None,
            pid: None,
            failure: None,
        };
    };

    if !handle.state.is_running() {
        return handle.to_status(service.label(), handle.state);
    }

    let alive = match handle.liveness_target(pattern_of(service)) {
        Some(target) => Some(launcher.is_alive(&target).await),
        None => None,
    };
    let endpoint = probe.check_once().await;
    let state = reported_state(handle.state, alive, endpoint);
    if state != handle.state {
        debug!(
            "'{}' tracked as {} but reported {} (alive: {:?}, endpoint: {:?})",
            service.id, handle.state, state, alive, endpoint
        );
    }
    handle.to_status(service.label(), state)
}

fn pattern_of(service: &Service) -> Option<&str> {
    service
        .match_pattern
        .as_deref()
        .filter(|p| !p.trim().is_empty())
}

/// Combine a running tracked state with external evidence
pub(super) fn reported_state(
    tracked: ServiceState,
    alive: Option<bool>,
    endpoint: Option<bool>,
) -> ServiceState {
    match (alive, endpoint) {
        // Something answers, but not a process we can attribute to the service
        (Some(false), Some(true)) => ServiceState::Unknown,
        (Some(false), _) => ServiceState::Stopped,
        (_, Some(true)) => ServiceState::Ready,
        (_, Some(false)) if tracked == ServiceState::Ready => ServiceState::Unknown,
        _ => tracked,
    }
}
