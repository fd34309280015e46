//! The launcher seam between the supervisor and the operating system
//!
//! The supervisor never spawns, signals or inspects processes itself. It asks
//! a [`Launcher`] to create a process, to terminate one by handle or by
//! command-line pattern, whether a PID or pattern is still alive, and whether
//! a launched process has already exited.
//!
//! - [`SystemLauncher`]: Unix process groups plus process-table sweeps
//! - [`MockLauncher`]: scriptable in-memory launcher for tests

use crate::error::LaunchError;
use crate::handle::ProcessHandle;
use crate::Result;
use async_trait::async_trait;
use schema::{LaunchMode, Service};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub mod mock;
#[cfg(unix)]
pub mod system;

pub use mock::MockLauncher;
#[cfg(unix)]
pub use system::SystemLauncher;

/// Launcher-assigned identity of a launched process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaunchId(pub u64);

impl fmt::Display for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "launch#{}", self.0)
    }
}

/// Everything the launcher needs to create a service process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub service_id: String,
    pub command: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub mode: LaunchMode,
}

impl LaunchRequest {
    /// Build the request for a declared service
    pub fn for_service(service: &Service) -> Self {
        Self {
            service_id: service.id.clone(),
            command: service.launch_command.clone(),
            working_directory: service.working_directory.clone(),
            environment: service.environment.clone(),
            mode: service.launch_mode,
        }
    }

    /// The program token
    pub fn program(&self) -> std::result::Result<&str, LaunchError> {
        self.command
            .first()
            .map(String::as_str)
            .filter(|p| !p.trim().is_empty())
            .ok_or(LaunchError::EmptyCommand)
    }

    /// Arguments after the program token
    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    /// Space-joined command line
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// A process the launcher reports as created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchedProcess {
    pub launch_id: LaunchId,
    /// Absent for interactive launches
    pub pid: Option<u32>,
}

/// Outcome of terminating a tracked handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was running and has been terminated
    Terminated,
    /// Nothing was running for this handle
    NotFound,
}

/// How a launched process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited normally with this code
    Code(i32),
    /// Killed by this signal
    Signal(i32),
}

impl ProcessExit {
    /// Exit code 0
    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exited with code {code}"),
            Self::Signal(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// What to check in a liveness query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LivenessTarget {
    /// A specific process
    Pid(u32),
    /// Any process whose name or command line contains the pattern
    Pattern(String),
}

impl fmt::Display for LivenessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pid(pid) => write!(f, "pid {pid}"),
            Self::Pattern(pattern) => write!(f, "pattern '{pattern}'"),
        }
    }
}

/// OS-level process management used by the supervisor
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Create a process; interactive launches do not expose a PID
    async fn launch(&self, request: &LaunchRequest)
        -> std::result::Result<LaunchedProcess, LaunchError>;

    /// Terminate the process behind a handle, gracefully then forcibly
    async fn terminate_by_handle(
        &self,
        handle: &ProcessHandle,
        grace: Duration,
    ) -> Result<Termination>;

    /// Terminate every process matching `pattern`, returning how many were hit
    async fn terminate_by_pattern(&self, pattern: &str, grace: Duration) -> Result<usize>;

    /// Whether the target is alive
    ///
    /// For a detached launch the PID is also its process group, which stays
    /// alive while any member does.
    async fn is_alive(&self, target: &LivenessTarget) -> bool;

    /// How the launched process ended, or `None` while it runs
    ///
    /// Only the launched process itself counts; anything it forked may still
    /// be running. Untracked launches report `None`.
    async fn exit_status(&self, launch_id: LaunchId) -> Option<ProcessExit>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_for_service() {
        let service = Service::new("rag", ["python", "-m", "rag.server"])
            .with_working_directory("/srv/rag")
            .with_launch_mode(LaunchMode::Interactive);
        let request = LaunchRequest::for_service(&service);
        assert_eq!(request.program(), Ok("python"));
        assert_eq!(request.args(), &["-m".to_string(), "rag.server".to_string()]);
        assert_eq!(request.command_line(), "python -m rag.server");
        assert_eq!(request.working_directory, Some(PathBuf::from("/srv/rag")));
        assert_eq!(request.mode, LaunchMode::Interactive);
    }

    #[test]
    fn test_empty_command_has_no_program() {
        let request = LaunchRequest::for_service(&Service::new("x", Vec::<String>::new()));
        assert_eq!(request.program(), Err(LaunchError::EmptyCommand));
        assert!(request.args().is_empty());

        let blank = LaunchRequest::for_service(&Service::new("y", [" "]));
        assert_eq!(blank.program(), Err(LaunchError::EmptyCommand));
    }

    #[test]
    fn test_display() {
        assert_eq!(LaunchId(3).to_string(), "launch#3");
        assert_eq!(LivenessTarget::Pid(12).to_string(), "pid 12");
        assert_eq!(ProcessExit::Code(3).to_string(), "exited with code 3");
        assert_eq!(ProcessExit::Signal(9).to_string(), "killed by signal 9");
        assert!(ProcessExit::Code(0).success());
        assert!(!ProcessExit::Signal(15).success());
        assert_eq!(
            LivenessTarget::Pattern("llama".to_string()).to_string(),
            "pattern 'llama'"
        );
    }
}
