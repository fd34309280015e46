//! Scriptable in-memory launcher
//!
//! Nothing is spawned. Each launch records a fake process with a synthetic
//! PID (hidden for interactive launches) and the joined command line, which
//! pattern sweeps and liveness queries match against. Tests script behaviour
//! per service id:
//!
//! - [`MockLauncher::fail_launch`]: the launch is rejected
//! - [`MockLauncher::delay_launch`]: the launch takes a while to confirm
//! - [`MockLauncher::serve_on_launch`]: a loopback port starts listening on
//!   launch and closes on termination, so real readiness probes can run
//! - [`MockLauncher::fail_termination`]: terminating the handle errors
//! - [`MockLauncher::crash`]: the process dies behind the supervisor's back
//! - [`MockLauncher::exit_on_launch`]: the launched process exits right away
//!
//! Processes that exist outside any session can be planted with
//! [`MockLauncher::add_orphan`].

use super::{
    LaunchId, LaunchRequest, LaunchedProcess, Launcher, LivenessTarget, ProcessExit, Termination,
};
use crate::error::LaunchError;
use crate::handle::ProcessHandle;
use crate::{CoreError, Result};
use async_trait::async_trait;
use schema::LaunchMode;
use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const FIRST_MOCK_PID: u32 = 50_000;

#[derive(Debug)]
struct MockProcess {
    service_id: Option<String>,
    pid: u32,
    command_line: String,
    _listener: Option<TcpListener>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    next_pid: u32,
    launch_failures: HashMap<String, String>,
    launch_delays: HashMap<String, Duration>,
    ports: HashMap<String, u16>,
    termination_failures: HashSet<String>,
    scripted_exits: HashMap<String, ProcessExit>,
    exited: HashMap<LaunchId, ProcessExit>,
    live: HashMap<LaunchId, MockProcess>,
    orphans: Vec<MockProcess>,
    launches: Vec<LaunchRequest>,
    terminations: Vec<String>,
    sweeps: Vec<String>,
}

impl MockState {
    fn allocate_pid(&mut self) -> u32 {
        if self.next_pid == 0 {
            self.next_pid = FIRST_MOCK_PID;
        }
        self.next_pid += 1;
        self.next_pid
    }

    fn matches(process: &MockProcess, pattern: &str) -> bool {
        let pattern = pattern.trim();
        !pattern.is_empty() && process.command_line.contains(pattern)
    }
}

/// In-memory [`Launcher`] for tests
#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
}

impl MockLauncher {
    /// Create a launcher where every launch succeeds immediately
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject launches of `service_id` with `cause`
    pub fn fail_launch(&self, service_id: &str, cause: &str) {
        self.state()
            .launch_failures
            .insert(service_id.to_string(), cause.to_string());
    }

    /// Confirm launches of `service_id` only after `delay`
    pub fn delay_launch(&self, service_id: &str, delay: Duration) {
        self.state()
            .launch_delays
            .insert(service_id.to_string(), delay);
    }

    /// Listen on 127.0.0.1:`port` while `service_id` is running
    pub fn serve_on_launch(&self, service_id: &str, port: u16) {
        self.state().ports.insert(service_id.to_string(), port);
    }

    /// Make terminating `service_id`'s handle fail
    pub fn fail_termination(&self, service_id: &str) {
        self.state()
            .termination_failures
            .insert(service_id.to_string());
    }

    /// Have `service_id`'s launched process exit immediately with `exit`
    ///
    /// A successful exit leaves a live stand-in behind (and its port, if
    /// served), like a start script that forks its server and returns.
    pub fn exit_on_launch(&self, service_id: &str, exit: ProcessExit) {
        self.state()
            .scripted_exits
            .insert(service_id.to_string(), exit);
    }

    /// Plant a process that no session launched, returning its PID
    pub fn add_orphan(&self, command_line: &str) -> u32 {
        let mut state = self.state();
        let pid = state.allocate_pid();
        state.orphans.push(MockProcess {
            service_id: None,
            pid,
            command_line: command_line.to_string(),
            _listener: None,
        });
        pid
    }

    /// Kill `service_id`'s process without going through the launcher
    ///
    /// Returns whether a live process was found.
    pub fn crash(&self, service_id: &str) -> bool {
        let mut state = self.state();
        let before = state.live.len();
        state
            .live
            .retain(|_, p| p.service_id.as_deref() != Some(service_id));
        before != state.live.len()
    }

    /// Service ids in launch order
    pub fn launched(&self) -> Vec<String> {
        self.state()
            .launches
            .iter()
            .map(|r| r.service_id.clone())
            .collect()
    }

    /// How many times `service_id` was launched
    pub fn launch_count(&self, service_id: &str) -> usize {
        self.state()
            .launches
            .iter()
            .filter(|r| r.service_id == service_id)
            .count()
    }

    /// Service ids whose handles were terminated, in order
    pub fn terminated(&self) -> Vec<String> {
        self.state().terminations.clone()
    }

    /// Patterns swept, in order
    pub fn sweeps(&self) -> Vec<String> {
        self.state().sweeps.clone()
    }

    /// Whether `service_id` has a live process
    pub fn is_running(&self, service_id: &str) -> bool {
        self.state()
            .live
            .values()
            .any(|p| p.service_id.as_deref() == Some(service_id))
    }

    /// Number of live processes, orphans included
    pub fn live_count(&self) -> usize {
        let state = self.state();
        state.live.len() + state.orphans.len()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
    ) -> std::result::Result<LaunchedProcess, LaunchError> {
        let delay = self.state().launch_delays.get(&request.service_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.launches.push(request.clone());
        let program = request.program()?.to_string();
        if let Some(cause) = state.launch_failures.get(&request.service_id) {
            return Err(LaunchError::Spawn {
                program,
                cause: cause.clone(),
            });
        }

        state.next_id += 1;
        let launch_id = LaunchId(state.next_id);
        let pid = state.allocate_pid();
        let launched = LaunchedProcess {
            launch_id,
            pid: (request.mode == LaunchMode::Detached).then_some(pid),
        };
        if let Some(exit) = state.scripted_exits.get(&request.service_id).copied() {
            debug!("Mock '{}' {}", request.service_id, exit);
            state.exited.insert(launch_id, exit);
            if !exit.success() {
                return Ok(launched);
            }
        }

        let listener = match state.ports.get(&request.service_id) {
            Some(port) => Some(
                TcpListener::bind(("127.0.0.1", *port))
                    .map_err(|e| LaunchError::Rejected(format!("port {port}: {e}")))?,
            ),
            None => None,
        };

        state.live.insert(
            launch_id,
            MockProcess {
                service_id: Some(request.service_id.clone()),
                pid,
                command_line: request.command_line(),
                _listener: listener,
            },
        );
        debug!("Mock launched '{}' as {}", request.service_id, launch_id);

        Ok(launched)
    }

    async fn terminate_by_handle(
        &self,
        handle: &ProcessHandle,
        _grace: Duration,
    ) -> Result<Termination> {
        let mut state = self.state();
        if state.termination_failures.contains(&handle.service_id) {
            return Err(CoreError::Termination {
                target: handle.service_id.clone(),
                cause: "operation not permitted".to_string(),
            });
        }
        state.terminations.push(handle.service_id.clone());
        let key = match (handle.launch_id, handle.pid) {
            (Some(id), _) => Some(id),
            // Restored from an earlier session: only the PID is known
            (None, Some(pid)) => state
                .live
                .iter()
                .find(|(_, p)| p.pid == pid)
                .map(|(id, _)| *id),
            (None, None) => None,
        };
        let removed = key.and_then(|id| state.live.remove(&id));
        Ok(match removed {
            Some(_) => Termination::Terminated,
            None => Termination::NotFound,
        })
    }

    async fn terminate_by_pattern(&self, pattern: &str, _grace: Duration) -> Result<usize> {
        let mut state = self.state();
        state.sweeps.push(pattern.to_string());
        let before = state.live.len() + state.orphans.len();
        state.live.retain(|_, p| !MockState::matches(p, pattern));
        state.orphans.retain(|p| !MockState::matches(p, pattern));
        Ok(before - state.live.len() - state.orphans.len())
    }

    async fn is_alive(&self, target: &LivenessTarget) -> bool {
        let state = self.state();
        let mut processes = state.live.values().chain(state.orphans.iter());
        match target {
            LivenessTarget::Pid(pid) => processes.any(|p| p.pid == *pid),
            LivenessTarget::Pattern(pattern) => processes.any(|p| MockState::matches(p, pattern)),
        }
    }

    async fn exit_status(&self, launch_id: LaunchId) -> Option<ProcessExit> {
        self.state().exited.get(&launch_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::Service;

    fn request(id: &str) -> LaunchRequest {
        LaunchRequest::for_service(&Service::new(id, ["sh", &format!("start_{id}.sh")]))
    }

    #[tokio::test]
    async fn test_launch_and_terminate() {
        let launcher = MockLauncher::new();
        let launched = launcher.launch(&request("llama")).await.expect("launch");
        let pid = launched.pid.expect("detached launch exposes pid");
        assert!(launcher.is_alive(&LivenessTarget::Pid(pid)).await);
        assert!(
            launcher
                .is_alive(&LivenessTarget::Pattern("start_llama".to_string()))
                .await
        );

        let mut handle = ProcessHandle::pending(&Service::new("llama", ["sh"]));
        handle.record_launch(&launched);
        let result = launcher
            .terminate_by_handle(&handle, Duration::ZERO)
            .await
            .expect("terminate");
        assert_eq!(result, Termination::Terminated);
        assert!(!launcher.is_alive(&LivenessTarget::Pid(pid)).await);

        let again = launcher
            .terminate_by_handle(&handle, Duration::ZERO)
            .await
            .expect("terminate");
        assert_eq!(again, Termination::NotFound);
    }

    #[tokio::test]
    async fn test_interactive_launch_hides_pid() {
        let launcher = MockLauncher::new();
        let mut req = request("rag");
        req.mode = LaunchMode::Interactive;
        let launched = launcher.launch(&req).await.expect("launch");
        assert_eq!(launched.pid, None);
        assert!(launcher.is_running("rag"));
    }

    #[tokio::test]
    async fn test_scripted_launch_failure() {
        let launcher = MockLauncher::new();
        launcher.fail_launch("embedding", "no such file");
        let err = launcher
            .launch(&request("embedding"))
            .await
            .expect_err("scripted failure");
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(launcher.launch_count("embedding"), 1);
        assert!(!launcher.is_running("embedding"));
    }

    #[tokio::test]
    async fn test_scripted_exit() {
        let launcher = MockLauncher::new();
        launcher.exit_on_launch("llama", ProcessExit::Code(3));
        launcher.exit_on_launch("rag", ProcessExit::Code(0));

        let failed = launcher.launch(&request("llama")).await.expect("launch");
        assert_eq!(
            launcher.exit_status(failed.launch_id).await,
            Some(ProcessExit::Code(3))
        );
        assert!(!launcher.is_running("llama"));

        let forked = launcher.launch(&request("rag")).await.expect("launch");
        assert_eq!(
            launcher.exit_status(forked.launch_id).await,
            Some(ProcessExit::Code(0))
        );
        assert!(launcher.is_running("rag"));

        let plain = launcher.launch(&request("embedding")).await.expect("launch");
        assert_eq!(launcher.exit_status(plain.launch_id).await, None);
    }

    #[tokio::test]
    async fn test_sweep_hits_orphans() {
        let launcher = MockLauncher::new();
        launcher.add_orphan("llama-server --port 8080");
        launcher.add_orphan("unrelated");
        let swept = launcher
            .terminate_by_pattern("llama-server", Duration::ZERO)
            .await
            .expect("sweep");
        assert_eq!(swept, 1);
        assert_eq!(launcher.live_count(), 1);
        assert_eq!(launcher.sweeps(), vec!["llama-server".to_string()]);

        let empty = launcher
            .terminate_by_pattern("", Duration::ZERO)
            .await
            .expect("sweep");
        assert_eq!(empty, 0);
    }

    #[tokio::test]
    async fn test_serve_on_launch_opens_and_closes_port() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("bind")
            .local_addr()
            .expect("addr")
            .port();
        let launcher = MockLauncher::new();
        launcher.serve_on_launch("llama", port);

        launcher.launch(&request("llama")).await.expect("launch");
        assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_ok());

        assert!(launcher.crash("llama"));
        assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_err());
    }
}
