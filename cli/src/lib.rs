//! Command-line front end for the Kindling supervisor
//!
//! The binary is a thin shell around [`kindling_core::Supervisor`]: load a
//! services file, build a supervisor over the system launcher, run one
//! operation and render its report. Rendering lives here so it can be tested
//! without spawning anything.
//!
//! Each invocation is a separate process, so `start` records the session in
//! a file next to the services file and `stop`/`status` restore it.

pub mod error;

pub use error::{CliError, Result};

use kindling_core::config::{load_services_from_toml_path, ServicesFile};
use kindling_core::persistence::{self, SessionSnapshot};
use kindling_core::{ServiceGraph, StartReport, StatusReport, StopReport, Supervisor};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Default services file, relative to the working directory
pub const DEFAULT_CONFIG: &str = "kindling.toml";

/// Load and validate a services file
pub fn load_config(path: &Path) -> Result<ServicesFile> {
    Ok(load_services_from_toml_path(path)?)
}

/// Build a supervisor that launches real processes
#[cfg(unix)]
pub fn system_supervisor(config: ServicesFile) -> Result<Supervisor> {
    let launcher = std::sync::Arc::new(kindling_core::SystemLauncher::new());
    Ok(Supervisor::new(config.services, launcher, config.supervisor))
}

/// Build a supervisor that launches real processes
#[cfg(not(unix))]
pub fn system_supervisor(_config: ServicesFile) -> Result<Supervisor> {
    Err(CliError::Unsupported(
        "process launching is only implemented for Unix",
    ))
}

/// Session file kept next to the services file
pub fn session_file(config_path: &Path) -> PathBuf {
    persistence::session_path_for(config_path)
}

/// Adopt the session recorded at `path`, if there is one
pub async fn restore_session(
    supervisor: &Supervisor,
    path: &Path,
) -> Result<Option<SessionSnapshot>> {
    let Some(snapshot) = persistence::load_snapshot(path)? else {
        return Ok(None);
    };
    supervisor.restore(&snapshot).await?;
    Ok(Some(snapshot))
}

/// Record the running session at `path`, or clear it when none runs
pub async fn save_session(supervisor: &Supervisor, path: &Path) -> Result<()> {
    match supervisor.snapshot().await? {
        Some(snapshot) => persistence::write_snapshot_atomic(path, &snapshot)?,
        None => persistence::remove_snapshot(path)?,
    }
    Ok(())
}

/// Delete the session file after a clean stop
pub fn clear_session(path: &Path) -> Result<()> {
    Ok(persistence::remove_snapshot(path)?)
}

/// Services a stop has no way to reach
///
/// A service is reachable through its match pattern or through a PID in the
/// session file. Without a session file every service lacking a pattern is
/// listed; with one, only services recorded as running without a PID.
pub fn unreachable_services(config: &ServicesFile, session: Option<&SessionSnapshot>) -> Vec<String> {
    config
        .services
        .iter()
        .filter(|s| !s.match_pattern.as_deref().is_some_and(|p| !p.trim().is_empty()))
        .filter(|s| match session {
            None => true,
            Some(snapshot) => snapshot
                .get(&s.id)
                .is_some_and(|h| h.pid.is_none() && h.state.is_running()),
        })
        .map(|s| s.id.clone())
        .collect()
}

/// Start order and preflight findings, as printed by `kindling check`
pub fn render_check(config: &ServicesFile, supervisor: &Supervisor) -> Result<String> {
    let graph = ServiceGraph::build(config.services.clone()).map_err(kindling_core::CoreError::from)?;
    let mut out = String::new();
    let _ = writeln!(out, "Start order:");
    for (i, service) in graph.start_order().enumerate() {
        let deps = if service.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (after {})", service.depends_on.join(", "))
        };
        let _ = writeln!(
            out,
            "  {}. {} [{}]{}",
            i + 1,
            service.id,
            service.readiness.target(),
            deps
        );
    }

    let missing = supervisor.preflight();
    if missing.is_empty() {
        let _ = writeln!(out, "All prerequisites present");
    } else {
        let _ = writeln!(out, "Missing prerequisites:");
        for (id, path) in missing {
            let _ = writeln!(out, "  {}: {}", id, path.display());
        }
    }
    Ok(out)
}

/// One line per service plus a coverage summary
pub fn render_start(report: &StartReport) -> String {
    let mut out = String::new();
    for (id, state) in &report.states {
        match report.failure_of(id) {
            Some(reason) => {
                let _ = writeln!(out, "{id}\t{state}\t{reason}");
            }
            None => {
                let _ = writeln!(out, "{id}\t{state}");
            }
        }
    }
    if report.interrupted {
        let _ = writeln!(out, "Start interrupted");
    } else {
        let _ = writeln!(out, "Session running ({})", coverage_label(report));
    }
    out
}

fn coverage_label(report: &StartReport) -> &'static str {
    match report.coverage {
        kindling_core::Coverage::Full => "all services ready",
        kindling_core::Coverage::Partial => "partial",
    }
}

/// Tab-separated status table
pub fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Session: {}", report.session);
    for status in &report.services {
        let mut extras: Vec<String> = Vec::new();
        if let Some(pid) = status.pid {
            extras.push(format!("PID:{pid}"));
        }
        if let Some(tracked) = status.tracked_state.filter(|t| *t != status.state) {
            extras.push(format!("TRACKED:{tracked}"));
        }
        if let Some(reason) = &status.failure {
            extras.push(reason.to_string());
        }
        if extras.is_empty() {
            let _ = writeln!(out, "{}\t{}\t{}", status.id, status.name, status.state);
        } else {
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}",
                status.id,
                status.name,
                status.state,
                extras.join(" ")
            );
        }
    }
    out
}

/// Status report as pretty JSON
pub fn render_status_json(report: &StatusReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Summary of a stop
pub fn render_stop(report: &StopReport) -> String {
    let mut out = String::new();
    if !report.terminated.is_empty() {
        let _ = writeln!(out, "Terminated: {}", report.terminated.join(", "));
    }
    if !report.not_found.is_empty() {
        let _ = writeln!(out, "Already gone: {}", report.not_found.join(", "));
    }
    let _ = writeln!(out, "Swept {} leftover process(es)", report.swept);
    for (id, cause) in &report.failures {
        let _ = writeln!(out, "Failed to stop {id}: {cause}");
    }
    out
}
