//! Unix process spawning and signalling
//!
//! Detached processes are placed in their own session and process group via
//! `setsid()`, so a single signal to the negative PID reaches the whole tree
//! a start script may fork (a shell wrapper plus the actual server, say).
//! Interactive processes stay in the caller's process group and inherit its
//! terminal; they are signalled individually, never by group, since their
//! group is the caller's own.
//!
//! `ESRCH` from any signal is treated as "already exited", not as an error.

// setsid() must be called through libc inside pre_exec
#![allow(unsafe_code)]

use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// How a process should be spawned
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Working directory, inherited when `None`
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables
    pub environment: HashMap<String, String>,
    /// Own session and process group, stdio detached
    pub detached: bool,
}

/// A spawned child process
#[derive(Debug)]
pub struct ChildProcess {
    /// The process ID of the spawned process
    pid: Pid,
    /// Whether the process leads its own process group
    group_leader: bool,
    /// The underlying Child handle for waiting and status checking
    child: Child,
}

impl ChildProcess {
    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid.as_raw().unsigned_abs()
    }

    /// Whether signals go to the whole process group
    pub fn is_group_leader(&self) -> bool {
        self.group_leader
    }

    /// Wait for the process to exit and return its exit status
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.map_err(|e| {
            CoreError::ProcessWait(format!("Failed to wait for process {}: {}", self.pid, e))
        })
    }

    /// Try to reap the process without blocking
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().map_err(|e| {
            CoreError::ProcessWait(format!(
                "Failed to try_wait for process {}: {}",
                self.pid, e
            ))
        })
    }

    /// Whether the process is still running; reaps it if it has exited
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }
}

/// Spawn a process
///
/// With `options.detached`, the child calls `setsid()` before `exec()` and
/// its stdio is redirected to `/dev/null`; otherwise it inherits the caller's
/// terminal.
///
/// ## Example
///
/// ```rust,no_run
/// use kindling_core::process::unix::{spawn, SpawnOptions};
///
/// # async fn example() -> kindling_core::Result<()> {
/// let options = SpawnOptions { detached: true, ..Default::default() };
/// let child = spawn("sleep", &["30".to_string()], &options)?;
/// println!("Spawned process with PID: {}", child.pid());
/// # Ok(())
/// # }
/// ```
pub fn spawn(program: &str, args: &[String], options: &SpawnOptions) -> Result<ChildProcess> {
    debug!("Spawning process: {} {:?} (detached: {})", program, args, options.detached);

    let mut command = Command::new(program);
    command.args(args).envs(&options.environment);
    if let Some(dir) = &options.working_directory {
        command.current_dir(dir);
    }

    if options.detached {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Safety: setsid() is async-signal-safe and appropriate for use in pre_exec
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = command.spawn().map_err(|e| {
        error!("Failed to spawn process '{}': {}", program, e);
        CoreError::ProcessSpawn(format!("Failed to spawn '{}': {}", program, e))
    })?;

    let raw_pid = child
        .id()
        .ok_or_else(|| CoreError::ProcessSpawn("Spawned child did not have a PID".to_string()))?;
    let raw_pid = i32::try_from(raw_pid)
        .map_err(|_| CoreError::ProcessSpawn(format!("PID {raw_pid} out of range")))?;
    let pid = Pid::from_raw(raw_pid);
    debug!("Spawned process {} (group leader: {})", pid, options.detached);

    Ok(ChildProcess {
        pid,
        group_leader: options.detached,
        child,
    })
}

/// Send a signal to a tracked child, by group when it leads one
///
/// Returns `Ok(false)` when the target no longer exists.
pub fn signal_child(child: &ChildProcess, signal: Signal) -> Result<bool> {
    let result = if child.group_leader {
        killpg(child.pid, signal)
    } else {
        kill(child.pid, signal)
    };
    interpret_signal_result(child.pid, signal, result)
}

/// Send a signal to an arbitrary PID
///
/// Returns `Ok(false)` when the process no longer exists.
pub fn signal_pid(pid: u32, signal: Signal) -> Result<bool> {
    let pid = to_pid(pid)?;
    interpret_signal_result(pid, signal, kill(pid, signal))
}

/// Whether a process with this PID exists
///
/// `EPERM` means the process exists but belongs to someone else.
pub fn pid_exists(pid: u32) -> bool {
    match to_pid(pid) {
        Ok(pid) => !matches!(kill(pid, None), Err(Errno::ESRCH)),
        Err(_) => false,
    }
}

fn to_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| CoreError::ProcessSignal(format!("PID {pid} out of range")))
}

fn interpret_signal_result(
    pid: Pid,
    signal: Signal,
    result: nix::Result<()>,
) -> Result<bool> {
    match result {
        Ok(()) => {
            debug!("Sent {} to {}", signal, pid);
            Ok(true)
        }
        Err(Errno::ESRCH) => {
            debug!("Process {} already exited", pid);
            Ok(false)
        }
        Err(e) => {
            error!("Failed to send {} to {}: {}", signal, pid, e);
            Err(CoreError::ProcessSignal(format!(
                "Failed to send {} to {}: {}",
                signal, pid, e
            )))
        }
    }
}

/// Terminate gracefully, escalating to SIGKILL after `grace`
///
/// A group leader is handled as its whole process group: the group is
/// signalled even when the leader itself has already exited, and the call
/// waits until no member is left. Returns `Ok(false)` when nothing was
/// running.
pub async fn terminate_with_timeout(child: &mut ChildProcess, grace: Duration) -> Result<bool> {
    if child.group_leader {
        return terminate_group(child, grace).await;
    }

    if let Some(status) = child.try_wait()? {
        debug!("Process {} had already exited with {}", child.pid, status);
        return Ok(false);
    }

    signal_child(child, Signal::SIGTERM)?;
    if let Some(status) = wait_for_exit(child, grace).await? {
        debug!("Process {} exited gracefully with status: {}", child.pid, status);
        return Ok(true);
    }

    warn!(
        "Process {} did not exit gracefully within {:?}, using SIGKILL",
        child.pid, grace
    );
    signal_child(child, Signal::SIGKILL)?;
    if let Some(status) = wait_for_exit(child, KILL_WAIT).await? {
        debug!(
            "Process {} exited after SIGKILL (signal: {:?})",
            child.pid,
            status.signal()
        );
        return Ok(true);
    }

    Err(CoreError::ProcessWait(format!(
        "Process {} did not exit even after SIGKILL within {:?}",
        child.pid, KILL_WAIT
    )))
}

async fn terminate_group(child: &mut ChildProcess, grace: Duration) -> Result<bool> {
    if let Some(status) = child.try_wait()? {
        debug!("Group leader {} had already exited with {}", child.pid, status);
    }
    if !signal_child(child, Signal::SIGTERM)? {
        return Ok(false);
    }
    if wait_for_group_exit(child, grace).await? {
        debug!("Process group {} exited gracefully", child.pid);
        return Ok(true);
    }

    warn!(
        "Process group {} did not exit gracefully within {:?}, using SIGKILL",
        child.pid, grace
    );
    signal_child(child, Signal::SIGKILL)?;
    if wait_for_group_exit(child, KILL_WAIT).await? {
        return Ok(true);
    }

    if child.try_wait()?.is_none() {
        return Err(CoreError::ProcessWait(format!(
            "Process {} did not exit even after SIGKILL within {:?}",
            child.pid, KILL_WAIT
        )));
    }
    // Killed members nobody has reaped yet still count as group members
    warn!("Process group {} still has unreaped members", child.pid);
    Ok(true)
}

/// Whether any process is left in the group led by `pgid`
///
/// The leader may have exited; the group lives on while members remain.
pub fn group_exists(pgid: u32) -> bool {
    match to_pid(pgid) {
        Ok(pgid) => !matches!(killpg(pgid, None), Err(Errno::ESRCH)),
        Err(_) => false,
    }
}

/// Terminate a process group this process did not spawn
///
/// Used for groups recorded by an earlier session. Returns `Ok(false)` when
/// the group no longer exists.
pub async fn terminate_group_with_timeout(pgid: u32, grace: Duration) -> Result<bool> {
    let group = to_pid(pgid)?;
    if !interpret_signal_result(group, Signal::SIGTERM, killpg(group, Signal::SIGTERM))? {
        return Ok(false);
    }
    if wait_for_group(pgid, grace).await {
        return Ok(true);
    }

    warn!("Process group {} ignored SIGTERM for {:?}, using SIGKILL", pgid, grace);
    interpret_signal_result(group, Signal::SIGKILL, killpg(group, Signal::SIGKILL))?;
    Ok(true)
}

/// Terminate an untracked PID gracefully, escalating to SIGKILL after `grace`
///
/// Returns `Ok(false)` when the process did not exist.
pub async fn terminate_pid_with_timeout(pid: u32, grace: Duration) -> Result<bool> {
    if !signal_pid(pid, Signal::SIGTERM)? {
        return Ok(false);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pid_exists(pid) {
            return Ok(true);
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }

    warn!("Process {} ignored SIGTERM for {:?}, using SIGKILL", pid, grace);
    signal_pid(pid, Signal::SIGKILL)?;
    Ok(true)
}

async fn wait_for_group_exit(child: &mut ChildProcess, limit: Duration) -> Result<bool> {
    let deadline = Instant::now() + limit;
    loop {
        // A zombie leader keeps the group alive until it is reaped
        child.try_wait()?;
        if !group_exists(child.pid()) {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
}

async fn wait_for_group(pgid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !group_exists(pgid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
}

async fn wait_for_exit(child: &mut ChildProcess, limit: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
}
