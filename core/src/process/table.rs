//! Process-table lookups by command-line pattern
//!
//! Sweep termination and PID-less liveness both need to find processes the
//! supervisor did not spawn itself (a server left over from a crashed session,
//! or one started by hand). Matching is a plain substring test against the
//! process name and the space-joined command line. The calling process is
//! never matched, and zombies are treated as dead.

use std::ffi::OsStr;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

/// A process found in the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMatch {
    /// Process ID
    pub pid: u32,
    /// Executable name
    pub name: String,
    /// Space-joined command line
    pub command_line: String,
}

/// Snapshot of the OS process table
pub struct ProcessTable {
    system: System,
    own_pid: Option<Pid>,
}

impl std::fmt::Debug for ProcessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTable")
            .field("processes", &self.system.processes().len())
            .finish()
    }
}

impl ProcessTable {
    /// Take a fresh snapshot including command lines
    pub fn snapshot() -> Self {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
        );
        Self {
            system,
            own_pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Live processes whose name or command line contains `pattern`
    ///
    /// An empty or whitespace-only pattern matches nothing.
    pub fn matching(&self, pattern: &str) -> Vec<ProcessMatch> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Vec::new();
        }

        let mut matches: Vec<ProcessMatch> = self
            .system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != self.own_pid)
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            .filter_map(|(pid, process)| {
                let name = OsStr::new(process.name()).to_string_lossy().into_owned();
                let command_line = process
                    .cmd()
                    .iter()
                    .map(|part| OsStr::new(part).to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                (name.contains(pattern) || command_line.contains(pattern)).then(|| ProcessMatch {
                    pid: pid.as_u32(),
                    name,
                    command_line,
                })
            })
            .collect();
        matches.sort_by_key(|m| m.pid);

        debug!("Pattern '{}' matched {} process(es)", pattern, matches.len());
        matches
    }

    /// Whether a live (non-zombie) process with this PID is in the snapshot
    pub fn contains_pid(&self, pid: u32) -> bool {
        self.system
            .process(Pid::from_u32(pid))
            .is_some_and(|p| p.status() != ProcessStatus::Zombie)
    }
}
