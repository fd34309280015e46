//! Launcher backed by real Unix processes
//!
//! Detached launches get their own session so termination reaches the whole
//! tree a start script forks, even after the script itself has exited.
//! Children are kept in a table keyed by [`LaunchId`] so they can be reaped;
//! interactive launches are tracked the same way but never expose their PID
//! to the supervisor. A child enters the table in the same poll that spawned
//! it, so a dropped launch future never leaves an untracked process.
//!
//! Pattern sweeps and PID-less liveness read the process table on a blocking
//! thread.

use super::{
    LaunchId, LaunchRequest, LaunchedProcess, Launcher, LivenessTarget, ProcessExit, Termination,
};
use crate::error::LaunchError;
use crate::handle::ProcessHandle;
use crate::process::unix::{self, ChildProcess, SpawnOptions};
use crate::process::ProcessTable;
use crate::{CoreError, Result};
use async_trait::async_trait;
use schema::LaunchMode;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Launches services as local OS processes
#[derive(Debug, Default)]
pub struct SystemLauncher {
    children: Mutex<HashMap<LaunchId, ChildProcess>>,
    next_id: AtomicU64,
}

impl SystemLauncher {
    /// Create a launcher with no tracked children
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of children still tracked
    pub fn tracked(&self) -> usize {
        self.children().len()
    }

    fn children(&self) -> MutexGuard<'_, HashMap<LaunchId, ChildProcess>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn snapshot() -> Result<ProcessTable> {
        tokio::task::spawn_blocking(ProcessTable::snapshot)
            .await
            .map_err(|e| CoreError::Internal(format!("process table snapshot failed: {e}")))
    }
}

#[async_trait]
impl Launcher for SystemLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
    ) -> std::result::Result<LaunchedProcess, LaunchError> {
        let program = request.program()?;
        let options = SpawnOptions {
            working_directory: request.working_directory.clone(),
            environment: request.environment.clone(),
            detached: request.mode == LaunchMode::Detached,
        };

        let child = unix::spawn(program, request.args(), &options).map_err(|e| {
            LaunchError::Spawn {
                program: program.to_string(),
                cause: e.to_string(),
            }
        })?;

        let launch_id = LaunchId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let pid = match request.mode {
            LaunchMode::Detached => Some(child.pid()),
            LaunchMode::Interactive => None,
        };
        info!(
            "Launched '{}' as {} (pid: {})",
            request.service_id,
            launch_id,
            child.pid()
        );
        self.children().insert(launch_id, child);

        Ok(LaunchedProcess { launch_id, pid })
    }

    async fn terminate_by_handle(
        &self,
        handle: &ProcessHandle,
        grace: Duration,
    ) -> Result<Termination> {
        let tracked = handle.launch_id.and_then(|id| self.children().remove(&id));

        let result = match (tracked, handle.pid) {
            (Some(mut child), _) => unix::terminate_with_timeout(&mut child, grace).await,
            // Launched by an earlier session; a detached PID names its group
            (None, Some(pid)) if handle.launched_via == LaunchMode::Detached => {
                unix::terminate_group_with_timeout(pid, grace).await
            }
            (None, Some(pid)) => unix::terminate_pid_with_timeout(pid, grace).await,
            (None, None) => Ok(false),
        };

        match result {
            Ok(true) => {
                debug!("'{}' terminated", handle.service_id);
                Ok(Termination::Terminated)
            }
            Ok(false) => Ok(Termination::NotFound),
            Err(e) => Err(CoreError::Termination {
                target: handle.service_id.clone(),
                cause: e.to_string(),
            }),
        }
    }

    async fn terminate_by_pattern(&self, pattern: &str, grace: Duration) -> Result<usize> {
        let matches = Self::snapshot().await?.matching(pattern);
        if matches.is_empty() {
            return Ok(0);
        }

        let results = futures::future::join_all(
            matches
                .iter()
                .map(|m| unix::terminate_pid_with_timeout(m.pid, grace)),
        )
        .await;

        let mut terminated = 0;
        let mut failures = Vec::new();
        for (found, result) in matches.iter().zip(results) {
            match result {
                Ok(true) => {
                    debug!("Swept pid {} ({})", found.pid, found.command_line);
                    terminated += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to sweep pid {}: {}", found.pid, e);
                    failures.push(format!("pid {}: {}", found.pid, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(terminated)
        } else {
            Err(CoreError::Termination {
                target: format!("pattern '{pattern}'"),
                cause: format!(
                    "{} of {} match(es) could not be terminated: {}",
                    failures.len(),
                    matches.len(),
                    failures.join("; ")
                ),
            })
        }
    }

    async fn is_alive(&self, target: &LivenessTarget) -> bool {
        match target {
            LivenessTarget::Pid(pid) => {
                let tracked = self
                    .children()
                    .values_mut()
                    .find(|c| c.pid() == *pid)
                    .map(|child| {
                        // Reap an exited leader so it does not count as a member
                        let running = child.is_running();
                        running || (child.is_group_leader() && unix::group_exists(*pid))
                    });
                if let Some(alive) = tracked {
                    return alive;
                }
                // Untracked detached PIDs come from earlier sessions and lead a group
                unix::group_exists(*pid)
                    || (unix::pid_exists(*pid)
                        && Self::snapshot()
                            .await
                            .is_ok_and(|table| table.contains_pid(*pid)))
            }
            LivenessTarget::Pattern(pattern) => match Self::snapshot().await {
                Ok(table) => !table.matching(pattern).is_empty(),
                Err(e) => {
                    warn!("Liveness check for {} failed: {}", target, e);
                    false
                }
            },
        }
    }

    async fn exit_status(&self, launch_id: LaunchId) -> Option<ProcessExit> {
        let mut children = self.children();
        let child = children.get_mut(&launch_id)?;
        match child.try_wait() {
            Ok(status) => status.map(process_exit),
            Err(e) => {
                warn!("Exit check for {} failed: {}", launch_id, e);
                None
            }
        }
    }
}

fn process_exit(status: ExitStatus) -> ProcessExit {
    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessExit::Code(code),
        (None, Some(signal)) => ProcessExit::Signal(signal),
        (None, None) => ProcessExit::Code(-1),
    }
}
