//! Event system for the Kindling supervisor
//!
//! Every state transition and every failure the supervisor observes is
//! emitted as a [`SupervisorEvent`]. Events are serializable and carry the
//! service id, a kind and a human-readable detail, so any notification sink
//! (log, terminal, editor popup) can render them without inspecting logs.

use crate::service::{FailureReason, LaunchMode, ServiceState, SessionState};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Events emitted by the supervisor
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum SupervisorEvent {
    /// The session moved between states
    #[serde(rename_all = "camelCase")]
    SessionChanged {
        /// Previous state
        from_state: SessionState,
        /// New state
        to_state: SessionState,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A service handle changed state
    #[serde(rename_all = "camelCase")]
    StateChanged {
        /// Service identifier
        service_id: String,
        /// Previous state
        from_state: ServiceState,
        /// New state
        to_state: ServiceState,
        /// Event timestamp in RFC3339 format
        timestamp: String,
        /// Optional reason for the state change
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// The launcher created a process for a service
    #[serde(rename_all = "camelCase")]
    ProcessLaunched {
        /// Service identifier
        service_id: String,
        /// Process ID, absent for interactive launches
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        /// How the process was launched
        mode: LaunchMode,
        /// Full command line
        command: Vec<String>,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A launched process exited while its service was still starting
    #[serde(rename_all = "camelCase")]
    ProcessExited {
        /// Service identifier
        service_id: String,
        /// Exit code, absent when killed by a signal
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        /// Signal that killed the process
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A service never became ready
    #[serde(rename_all = "camelCase")]
    ServiceFailed {
        /// Service identifier
        service_id: String,
        /// Why it failed
        reason: FailureReason,
        /// Whether the service is optional, which lowers severity
        optional: bool,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// Readiness probing finished for a service
    #[serde(rename_all = "camelCase")]
    ReadinessResult {
        /// Service identifier
        service_id: String,
        /// Whether the probe reported ready
        ready: bool,
        /// Attempts made
        attempts: u32,
        /// Probe target description
        target: String,
        /// Last error observed when not ready
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Time spent probing in milliseconds
        duration_ms: u64,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A tracked process was terminated during stop
    #[serde(rename_all = "camelCase")]
    ProcessTerminated {
        /// Service identifier
        service_id: String,
        /// Process ID if known
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        /// False when the process was already gone
        found: bool,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A pattern sweep finished during stop
    #[serde(rename_all = "camelCase")]
    SweepCompleted {
        /// Service identifier
        service_id: String,
        /// Pattern that was matched against command lines
        pattern: String,
        /// Number of processes terminated
        terminated: usize,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A warning condition has occurred
    #[serde(rename_all = "camelCase")]
    Warning {
        /// Service identifier, absent for session-wide warnings
        #[serde(skip_serializing_if = "Option::is_none")]
        service_id: Option<String>,
        /// Warning message
        message: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
        /// Optional warning code for categorization
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// An error condition has occurred
    #[serde(rename_all = "camelCase")]
    Error {
        /// Service identifier, absent for session-wide errors
        #[serde(skip_serializing_if = "Option::is_none")]
        service_id: Option<String>,
        /// Phase in which the error happened (config, launch, stop, ...)
        phase: String,
        /// Error message
        message: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
        /// Optional error code for categorization
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

/// Event severity level for filtering and alerting
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "camelCase")]
pub enum EventSeverity {
    /// Debug information
    Debug,
    /// Informational events
    Info,
    /// Warning conditions
    Warning,
    /// Error conditions
    Error,
}

impl SupervisorEvent {
    /// Get the service ID for this event, if it concerns one service
    #[must_use]
    pub fn service_id(&self) -> Option<&str> {
        match self {
            Self::SessionChanged { .. } => None,
            Self::StateChanged { service_id, .. }
            | Self::ProcessLaunched { service_id, .. }
            | Self::ProcessExited { service_id, .. }
            | Self::ServiceFailed { service_id, .. }
            | Self::ReadinessResult { service_id, .. }
            | Self::ProcessTerminated { service_id, .. }
            | Self::SweepCompleted { service_id, .. } => Some(service_id),
            Self::Warning { service_id, .. } | Self::Error { service_id, .. } => {
                service_id.as_deref()
            }
        }
    }

    /// Get the timestamp for this event
    #[must_use]
    pub fn timestamp(&self) -> &str {
        match self {
            Self::SessionChanged { timestamp, .. }
            | Self::StateChanged { timestamp, .. }
            | Self::ProcessLaunched { timestamp, .. }
            | Self::ProcessExited { timestamp, .. }
            | Self::ServiceFailed { timestamp, .. }
            | Self::ReadinessResult { timestamp, .. }
            | Self::ProcessTerminated { timestamp, .. }
            | Self::SweepCompleted { timestamp, .. }
            | Self::Warning { timestamp, .. }
            | Self::Error { timestamp, .. } => timestamp,
        }
    }

    /// Stable name of the event kind, matching the serialized tag
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionChanged { .. } => "sessionChanged",
            Self::StateChanged { .. } => "stateChanged",
            Self::ProcessLaunched { .. } => "processLaunched",
            Self::ProcessExited { .. } => "processExited",
            Self::ServiceFailed { .. } => "serviceFailed",
            Self::ReadinessResult { .. } => "readinessResult",
            Self::ProcessTerminated { .. } => "processTerminated",
            Self::SweepCompleted { .. } => "sweepCompleted",
            Self::Warning { .. } => "warning",
            Self::Error { .. } => "error",
        }
    }

    /// Get the severity level for this event
    #[must_use]
    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::SessionChanged { .. }
            | Self::StateChanged { .. }
            | Self::ProcessLaunched { .. }
            | Self::ProcessTerminated { .. } => EventSeverity::Info,
            Self::ProcessExited { code: Some(0), .. } => EventSeverity::Info,
            Self::ProcessExited { .. } => EventSeverity::Warning,
            Self::SweepCompleted { terminated, .. } => {
                if *terminated == 0 {
                    EventSeverity::Debug
                } else {
                    EventSeverity::Info
                }
            }
            Self::ReadinessResult { ready, .. } => {
                if *ready {
                    EventSeverity::Info
                } else {
                    EventSeverity::Warning
                }
            }
            Self::ServiceFailed { optional, .. } => {
                if *optional {
                    EventSeverity::Warning
                } else {
                    EventSeverity::Error
                }
            }
            Self::Warning { .. } => EventSeverity::Warning,
            Self::Error { .. } => EventSeverity::Error,
        }
    }

    /// One-line human-readable description of the event
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::SessionChanged {
                from_state,
                to_state,
                ..
            } => format!("session {from_state} -> {to_state}"),
            Self::StateChanged {
                from_state,
                to_state,
                reason,
                ..
            } => match reason {
                Some(r) => format!("{from_state} -> {to_state} ({r})"),
                None => format!("{from_state} -> {to_state}"),
            },
            Self::ProcessLaunched { pid, command, .. } => match pid {
                Some(pid) => format!("launched pid {pid}: {}", command.join(" ")),
                None => format!("launched in terminal: {}", command.join(" ")),
            },
            Self::ProcessExited { code, signal, .. } => match (code, signal) {
                (Some(code), _) => format!("launched process exited with code {code}"),
                (None, Some(signal)) => format!("launched process killed by signal {signal}"),
                (None, None) => "launched process exited".to_string(),
            },
            Self::ServiceFailed { reason, .. } => reason.to_string(),
            Self::ReadinessResult {
                ready,
                attempts,
                target,
                error,
                duration_ms,
                ..
            } => {
                if *ready {
                    format!("{target} ready after {attempts} attempt(s) in {duration_ms}ms")
                } else {
                    format!(
                        "{target} not ready after {attempts} attempt(s) in {duration_ms}ms: {}",
                        error.as_deref().unwrap_or("no response")
                    )
                }
            }
            Self::ProcessTerminated { pid, found, .. } => match (pid, found) {
                (Some(pid), true) => format!("terminated pid {pid}"),
                (None, true) => "terminated".to_string(),
                (_, false) => "already exited".to_string(),
            },
            Self::SweepCompleted {
                pattern,
                terminated,
                ..
            } => format!("swept {terminated} process(es) matching '{pattern}'"),
            Self::Warning { message, .. } => message.clone(),
            Self::Error { phase, message, .. } => format!("{phase}: {message}"),
        }
    }

    /// Create a current timestamp string in RFC3339 format
    #[must_use]
    pub fn current_timestamp() -> String {
        humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
    }

    /// Create a session changed event
    #[must_use]
    pub fn session_changed(from_state: SessionState, to_state: SessionState) -> Self {
        Self::SessionChanged {
            from_state,
            to_state,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a state changed event
    #[must_use]
    pub fn state_changed(
        service_id: String,
        from_state: ServiceState,
        to_state: ServiceState,
        reason: Option<String>,
    ) -> Self {
        Self::StateChanged {
            service_id,
            from_state,
            to_state,
            timestamp: Self::current_timestamp(),
            reason,
        }
    }

    /// Create a process launched event
    #[must_use]
    pub fn process_launched(
        service_id: String,
        pid: Option<u32>,
        mode: LaunchMode,
        command: Vec<String>,
    ) -> Self {
        Self::ProcessLaunched {
            service_id,
            pid,
            mode,
            command,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a process exited event
    #[must_use]
    pub fn process_exited(service_id: String, code: Option<i32>, signal: Option<i32>) -> Self {
        Self::ProcessExited {
            service_id,
            code,
            signal,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a service failed event
    #[must_use]
    pub fn service_failed(service_id: String, reason: FailureReason, optional: bool) -> Self {
        Self::ServiceFailed {
            service_id,
            reason,
            optional,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a readiness result event
    #[must_use]
    pub fn readiness_result(
        service_id: String,
        ready: bool,
        attempts: u32,
        target: String,
        error: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self::ReadinessResult {
            service_id,
            ready,
            attempts,
            target,
            error,
            duration_ms,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a process terminated event
    #[must_use]
    pub fn process_terminated(service_id: String, pid: Option<u32>, found: bool) -> Self {
        Self::ProcessTerminated {
            service_id,
            pid,
            found,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a sweep completed event
    #[must_use]
    pub fn sweep_completed(service_id: String, pattern: String, terminated: usize) -> Self {
        Self::SweepCompleted {
            service_id,
            pattern,
            terminated,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a warning event
    #[must_use]
    pub fn warning(service_id: Option<String>, message: String, code: Option<String>) -> Self {
        Self::Warning {
            service_id,
            message,
            timestamp: Self::current_timestamp(),
            code,
        }
    }

    /// Create an error event
    #[must_use]
    pub fn error(
        service_id: Option<String>,
        phase: &str,
        message: String,
        code: Option<String>,
    ) -> Self {
        Self::Error {
            service_id,
            phase: phase.to_string(),
            message,
            timestamp: Self::current_timestamp(),
            code,
        }
    }
}

/// Event filter for subscribing to specific events
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Filter by service IDs (empty means all services)
    #[serde(default)]
    pub service_ids: Vec<String>,

    /// Filter by minimum severity level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<EventSeverity>,
}

impl EventFilter {
    /// Create a filter that matches all events
    #[must_use]
    pub const fn all() -> Self {
        Self {
            service_ids: Vec::new(),
            min_severity: None,
        }
    }

    /// Create a filter for events with minimum severity
    #[must_use]
    pub const fn with_min_severity(severity: EventSeverity) -> Self {
        Self {
            service_ids: Vec::new(),
            min_severity: Some(severity),
        }
    }

    /// Check if this filter matches the given event
    ///
    /// Session-wide events pass any service filter.
    #[must_use]
    pub fn matches(&self, event: &SupervisorEvent) -> bool {
        if !self.service_ids.is_empty() {
            if let Some(id) = event.service_id() {
                if !self.service_ids.iter().any(|s| s == id) {
                    return false;
                }
            }
        }

        if let Some(min_severity) = self.min_severity {
            if event.severity() < min_severity {
                return false;
            }
        }

        true
    }
}
