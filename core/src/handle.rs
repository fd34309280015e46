//! Per-service process records
//!
//! A [`ProcessHandle`] is created for every catalogue service when a session
//! starts and is mutated only by the supervisor as launches and probes
//! resolve. Transitions are checked: readiness is monotonic within a session,
//! so a handle that reached `Ready` never goes back to `Starting`.

use crate::launcher::{LaunchId, LaunchedProcess, LivenessTarget};
use schema::{FailureReason, LaunchMode, Service, ServiceState, ServiceStatus};
use std::path::PathBuf;
use std::time::SystemTime;

/// One spawned (or never-spawned) service process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Service this handle belongs to
    pub service_id: String,
    /// Launcher-assigned identity, set once the launch is confirmed
    pub launch_id: Option<LaunchId>,
    /// OS process ID; only known for detached launches
    pub pid: Option<u32>,
    /// When the launch was confirmed
    pub started_at: Option<SystemTime>,
    /// Last state recorded by the supervisor
    pub state: ServiceState,
    /// Why the service failed, when `state` is `Failed`
    pub failure: Option<FailureReason>,
    /// How the process is attached
    pub launched_via: LaunchMode,
    /// Command line the process was launched with
    pub command: Vec<String>,
    /// Working directory the process was launched in
    pub working_directory: Option<PathBuf>,
}

impl ProcessHandle {
    /// A fresh handle for a service that has not been launched yet
    pub fn pending(service: &Service) -> Self {
        Self {
            service_id: service.id.clone(),
            launch_id: None,
            pid: None,
            started_at: None,
            state: ServiceState::Pending,
            failure: None,
            launched_via: service.launch_mode,
            command: service.launch_command.clone(),
            working_directory: service.working_directory.clone(),
        }
    }

    /// Whether a process was created for this handle
    ///
    /// Handles restored from a session file keep only the PID.
    pub fn is_launched(&self) -> bool {
        self.launch_id.is_some() || self.pid.is_some()
    }

    /// Whether `from -> to` is a legal tracked transition
    pub fn can_transition(from: ServiceState, to: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (from, to),
            (Pending, Starting | Failed)
                | (Starting, Ready | Degraded | Stopped | Failed)
                | (Ready | Degraded, Stopped)
        )
    }

    /// Move to `to`, returning the previous state
    ///
    /// Returns `None` and leaves the handle untouched for illegal transitions.
    pub fn transition(&mut self, to: ServiceState) -> Option<ServiceState> {
        let from = self.state;
        if !Self::can_transition(from, to) {
            return None;
        }
        self.state = to;
        Some(from)
    }

    /// Record a confirmed launch and move to `Starting`
    pub fn record_launch(&mut self, process: &LaunchedProcess) -> Option<ServiceState> {
        let from = self.transition(ServiceState::Starting)?;
        self.launch_id = Some(process.launch_id);
        self.pid = process.pid;
        self.started_at = Some(SystemTime::now());
        Some(from)
    }

    /// Mark the service failed, before launch or while it is starting
    pub fn fail(&mut self, reason: FailureReason) -> Option<ServiceState> {
        let from = self.transition(ServiceState::Failed)?;
        self.failure = Some(reason);
        Some(from)
    }

    /// What to ask the launcher when checking whether this process lives
    ///
    /// A known PID wins; otherwise the service's match pattern is used.
    pub fn liveness_target(&self, match_pattern: Option<&str>) -> Option<LivenessTarget> {
        match (self.pid, match_pattern) {
            (Some(pid), _) => Some(LivenessTarget::Pid(pid)),
            (None, Some(pattern)) if !pattern.trim().is_empty() => {
                Some(LivenessTarget::Pattern(pattern.to_string()))
            }
            _ => None,
        }
    }

    /// Status entry reporting `state` as the reconciled state
    pub fn to_status(&self, name: &str, state: ServiceState) -> ServiceStatus {
        ServiceStatus {
            id: self.service_id.clone(),
            name: name.to_string(),
            state,
            tracked_state: Some(self.state),
            pid: self.pid,
            failure: self.failure.clone(),
        }
    }
}
