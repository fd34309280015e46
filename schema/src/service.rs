//! Service definitions and lifecycle state for the Kindling supervisor
//!
//! This module contains the data structures used to declare the services the
//! supervisor manages, how their readiness is detected, and the states a
//! service and a whole session move through.
//!
//! ## Service Lifecycle
//!
//! A service handle progresses through the following states:
//! - `Pending`: Declared for this session, waiting on its dependencies
//! - `Starting`: Launched, readiness not yet confirmed
//! - `Ready`: Readiness probe succeeded
//! - `Degraded`: Launched, but the readiness probe exhausted its retries
//! - `Stopped`: Terminated, or found dead by an external liveness check
//! - `Failed`: Never launched, or the launch itself failed
//!
//! `Unknown` is only ever reported by status queries, when external liveness
//! contradicts what the supervisor last observed.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Complete declaration of a managed service
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Unique identifier for this service
    pub id: String,

    /// Human-readable name, defaults to the id
    #[serde(default)]
    pub display_name: String,

    /// Program followed by its arguments
    pub launch_command: Vec<String>,

    /// Working directory for the process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,

    /// Ids of services that must be ready before this one is launched
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// How readiness is detected after launch
    #[serde(default)]
    pub readiness: ReadinessSpec,

    /// Failure of an optional service never blocks its dependents
    #[serde(default)]
    pub optional: bool,

    /// Whether the process is attached to a terminal or detached
    #[serde(default)]
    pub launch_mode: LaunchMode,

    /// Command-line substring identifying instances of this service in the
    /// process table, used for sweep termination and PID-less liveness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_pattern: Option<String>,

    /// Additional paths that must exist before launching (start scripts, models)
    #[serde(default)]
    pub requires: Vec<PathBuf>,

    /// Environment variables to set for the process
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl Service {
    /// Create a service with defaults for everything but id and command
    pub fn new<I, S>(id: impl Into<String>, launch_command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            launch_command: launch_command.into_iter().map(Into::into).collect(),
            working_directory: None,
            depends_on: Vec::new(),
            readiness: ReadinessSpec::default(),
            optional: false,
            launch_mode: LaunchMode::default(),
            match_pattern: None,
            requires: Vec::new(),
            environment: HashMap::new(),
        }
    }

    /// Builder-style dependency declaration
    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Builder-style readiness declaration
    #[must_use]
    pub fn with_readiness(mut self, readiness: ReadinessSpec) -> Self {
        self.readiness = readiness;
        self
    }

    /// Builder-style working directory
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Builder-style prerequisite path
    #[must_use]
    pub fn requiring(mut self, path: impl Into<PathBuf>) -> Self {
        self.requires.push(path.into());
        self
    }

    /// Builder-style process-table match pattern
    #[must_use]
    pub fn with_match_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.match_pattern = Some(pattern.into());
        self
    }

    /// Builder-style launch mode
    #[must_use]
    pub fn with_launch_mode(mut self, mode: LaunchMode) -> Self {
        self.launch_mode = mode;
        self
    }

    /// Mark the service optional
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Name used in messages: the display name, or the id when unset
    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }

    /// The program token of the launch command
    pub fn program(&self) -> Option<&str> {
        self.launch_command.first().map(String::as_str)
    }

    /// Arguments following the program token
    pub fn args(&self) -> &[String] {
        self.launch_command.get(1..).unwrap_or_default()
    }
}

/// How a process is attached to the launcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum LaunchMode {
    /// Attached to the caller's terminal; PID is not exposed
    Interactive,
    /// Own session and process group; PID is exposed
    #[default]
    Detached,
}

/// Readiness detection strategy attached to a service
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReadinessSpec {
    /// Wait a fixed time then assume ready; no real health signal
    #[serde(rename_all = "camelCase")]
    FixedDelay {
        /// Delay in milliseconds
        #[serde(default)]
        delay_ms: u64,
    },
    /// Ready once a TCP connection to host:port succeeds
    #[serde(rename_all = "camelCase")]
    TcpConnect {
        /// Host to connect to
        #[serde(default = "default_probe_host")]
        host: String,
        /// Port to connect to
        port: u16,
        /// Per-attempt connect timeout in milliseconds
        #[serde(default = "default_probe_timeout_ms")]
        timeout_ms: u64,
        /// Retries after the first attempt
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        /// Pause between attempts in milliseconds
        #[serde(default = "default_retry_interval_ms")]
        retry_interval_ms: u64,
    },
    /// Ready once an HTTP GET to the URL answers with a 2xx status
    #[serde(rename_all = "camelCase")]
    HttpHealth {
        /// Full URL to request
        url: String,
        /// Per-attempt request timeout in milliseconds
        #[serde(default = "default_probe_timeout_ms")]
        timeout_ms: u64,
        /// Retries after the first attempt
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        /// Pause between attempts in milliseconds
        #[serde(default = "default_retry_interval_ms")]
        retry_interval_ms: u64,
    },
}

impl Default for ReadinessSpec {
    fn default() -> Self {
        Self::FixedDelay { delay_ms: 0 }
    }
}

impl ReadinessSpec {
    /// TCP readiness on 127.0.0.1 with default timing
    pub fn tcp(port: u16) -> Self {
        Self::TcpConnect {
            host: default_probe_host(),
            port,
            timeout_ms: default_probe_timeout_ms(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }

    /// HTTP readiness with default timing
    pub fn http(url: impl Into<String>) -> Self {
        Self::HttpHealth {
            url: url.into(),
            timeout_ms: default_probe_timeout_ms(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }

    /// Fixed-delay readiness
    pub fn delay(delay: Duration) -> Self {
        Self::FixedDelay {
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Override the retry budget of a polling probe; no-op for fixed delays
    #[must_use]
    pub fn with_retries(mut self, retries: u32, interval: Duration) -> Self {
        let interval = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        match &mut self {
            Self::FixedDelay { .. } => {}
            Self::TcpConnect {
                max_retries,
                retry_interval_ms,
                ..
            }
            | Self::HttpHealth {
                max_retries,
                retry_interval_ms,
                ..
            } => {
                *max_retries = retries;
                *retry_interval_ms = interval;
            }
        }
        self
    }

    /// Whether this probe observes a real health signal
    pub fn is_polling(&self) -> bool {
        !matches!(self, Self::FixedDelay { .. })
    }

    /// Per-attempt timeout, if the probe polls
    pub fn attempt_timeout(&self) -> Option<Duration> {
        match self {
            Self::FixedDelay { .. } => None,
            Self::TcpConnect { timeout_ms, .. } | Self::HttpHealth { timeout_ms, .. } => {
                Some(Duration::from_millis(*timeout_ms))
            }
        }
    }

    /// Short description of the probe target for messages
    pub fn target(&self) -> String {
        match self {
            Self::FixedDelay { delay_ms } => format!("fixed delay {delay_ms}ms"),
            Self::TcpConnect { host, port, .. } => format!("tcp://{host}:{port}"),
            Self::HttpHealth { url, .. } => url.clone(),
        }
    }
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_probe_timeout_ms() -> u64 {
    1_000
}

const fn default_max_retries() -> u32 {
    30
}

const fn default_retry_interval_ms() -> u64 {
    1_000
}

/// State of a single service, as tracked or as reported by status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ServiceState {
    /// Waiting on dependencies
    Pending,
    /// Launched, readiness pending
    Starting,
    /// Readiness confirmed
    Ready,
    /// Launched, readiness timed out
    Degraded,
    /// Not running
    Stopped,
    /// Not launched or launch failed
    Failed,
    /// Liveness could not be reconciled with the last known state
    Unknown,
}

impl ServiceState {
    /// Whether the service is believed to have a live process
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Degraded)
    }

    /// Whether the state will not change without a new session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded | Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Why a service ended up `Failed`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureReason {
    /// A declared path (working directory, script, program) does not exist
    MissingPrerequisite {
        /// The missing path
        path: PathBuf,
    },
    /// The launcher could not create the process
    LaunchFailed {
        /// Underlying cause
        cause: String,
    },
    /// A dependency failed, so this service was never launched
    DependencyFailed {
        /// Id of the dependency that failed
        dependency: String,
    },
    /// Start was interrupted by stop before this service launched
    Interrupted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPrerequisite { path } => {
                write!(f, "missing prerequisite {}", path.display())
            }
            Self::LaunchFailed { cause } => write!(f, "launch failed: {cause}"),
            Self::DependencyFailed { dependency } => {
                write!(f, "dependency '{dependency}' failed")
            }
            Self::Interrupted => f.write_str("interrupted by stop"),
        }
    }
}

/// How many services of a running session reached `Ready`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Coverage {
    /// Every service is ready
    Full,
    /// At least one service is degraded or failed
    Partial,
}

/// State of a supervisor session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// No session
    Idle,
    /// Start sequence in progress
    Starting,
    /// Start sequence finished
    Running(Coverage),
    /// Teardown in progress
    Stopping,
}

impl SessionState {
    /// Whether the session is idle
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Starting => f.write_str("starting"),
            Self::Running(Coverage::Full) => f.write_str("running (full)"),
            Self::Running(Coverage::Partial) => f.write_str("running (partial)"),
            Self::Stopping => f.write_str("stopping"),
        }
    }
}

/// What dependents do when a dependency's readiness probe times out
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum DegradedPolicy {
    /// Launch dependents anyway
    #[default]
    Proceed,
    /// Fail dependents with `DependencyFailed`
    Block,
}

/// Session-wide tuning for the supervisor
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorOptions {
    /// Handling of dependents whose dependency is degraded
    #[serde(default)]
    pub degraded_policy: DegradedPolicy,

    /// Upper bound on waiting for the launcher to confirm a launch
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,

    /// Pause between a launch and its first readiness attempt
    #[serde(default)]
    pub pacing_ms: u64,

    /// Time allowed for graceful termination before forcing
    #[serde(default = "default_graceful_stop_timeout_ms")]
    pub graceful_stop_timeout_ms: u64,
}

impl SupervisorOptions {
    /// Launch timeout as a Duration
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    /// Pacing delay as a Duration
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    /// Graceful stop timeout as a Duration
    pub fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_stop_timeout_ms)
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            degraded_policy: DegradedPolicy::default(),
            launch_timeout_ms: default_launch_timeout_ms(),
            pacing_ms: 0,
            graceful_stop_timeout_ms: default_graceful_stop_timeout_ms(),
        }
    }
}

const fn default_launch_timeout_ms() -> u64 {
    10_000
}

const fn default_graceful_stop_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_defaults_from_json() {
        let json = r#"{ "id": "llama", "launchCommand": ["sh", "start.sh"] }"#;
        let svc: Service = serde_json::from_str(json).expect("should parse");
        assert_eq!(svc.id, "llama");
        assert_eq!(svc.label(), "llama");
        assert_eq!(svc.program(), Some("sh"));
        assert_eq!(svc.args(), &["start.sh".to_string()]);
        assert_eq!(svc.launch_mode, LaunchMode::Detached);
        assert_eq!(svc.readiness, ReadinessSpec::FixedDelay { delay_ms: 0 });
        assert!(!svc.optional);
        assert!(svc.depends_on.is_empty());
    }

    #[test]
    fn test_tcp_readiness_defaults() {
        let json = r#"{ "type": "tcpConnect", "port": 8080 }"#;
        let spec: ReadinessSpec = serde_json::from_str(json).expect("should parse");
        assert_eq!(spec, ReadinessSpec::tcp(8080));
        assert_eq!(spec.target(), "tcp://127.0.0.1:8080");
        assert_eq!(spec.attempt_timeout(), Some(Duration::from_millis(1_000)));
        assert!(spec.is_polling());
    }

    #[test]
    fn test_http_readiness_camel_case_fields() {
        let json = r#"{ "type": "httpHealth", "url": "http://127.0.0.1:8001/health",
                        "timeoutMs": 250, "maxRetries": 3, "retryIntervalMs": 100 }"#;
        let spec: ReadinessSpec = serde_json::from_str(json).expect("should parse");
        assert_eq!(
            spec,
            ReadinessSpec::HttpHealth {
                url: "http://127.0.0.1:8001/health".to_string(),
                timeout_ms: 250,
                max_retries: 3,
                retry_interval_ms: 100,
            }
        );
    }

    #[test]
    fn test_with_retries_leaves_fixed_delay_alone() {
        let spec = ReadinessSpec::delay(Duration::from_millis(40))
            .with_retries(2, Duration::from_millis(5));
        assert_eq!(spec, ReadinessSpec::FixedDelay { delay_ms: 40 });
        assert!(!spec.is_polling());

        let tcp = ReadinessSpec::tcp(9000).with_retries(2, Duration::from_millis(5));
        match tcp {
            ReadinessSpec::TcpConnect {
                max_retries,
                retry_interval_ms,
                ..
            } => {
                assert_eq!(max_retries, 2);
                assert_eq!(retry_interval_ms, 5);
            }
            other => panic!("expected TcpConnect, got {other:?}"),
        }
    }

    #[test]
    fn test_service_state_predicates() {
        assert!(ServiceState::Ready.is_running());
        assert!(ServiceState::Degraded.is_running());
        assert!(!ServiceState::Failed.is_running());
        assert!(!ServiceState::Pending.is_terminal());
        assert!(ServiceState::Stopped.is_terminal());
        assert_eq!(ServiceState::Degraded.to_string(), "degraded");
    }

    #[test]
    fn test_failure_reason_display() {
        let reason = FailureReason::DependencyFailed {
            dependency: "embedding".to_string(),
        };
        assert_eq!(reason.to_string(), "dependency 'embedding' failed");
        let json = serde_json::to_string(&reason).expect("serialize");
        assert!(json.contains("\"kind\":\"dependencyFailed\""));
    }

    #[test]
    fn test_supervisor_options_defaults() {
        let opts: SupervisorOptions = serde_json::from_str("{}").expect("should parse");
        assert_eq!(opts, SupervisorOptions::default());
        assert_eq!(opts.degraded_policy, DegradedPolicy::Proceed);
        assert_eq!(opts.launch_timeout(), Duration::from_secs(10));
        assert_eq!(opts.pacing(), Duration::ZERO);
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Running(Coverage::Partial).to_string(), "running (partial)");
        assert!(SessionState::Idle.is_idle());
    }
}
