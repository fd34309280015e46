//! Session files: versioned JSON snapshots of launched handles
//!
//! `kindling start` exits while its detached services keep running, so the
//! handles it launched are written next to the services file. A later
//! `kindling stop` or `kindling status` restores them into a fresh
//! [`Supervisor`](crate::Supervisor) and can reach those processes by PID.
//!
//! Writes go to a temp file in the same directory which is then renamed over
//! the destination, so readers never see a half-written snapshot.

use crate::handle::ProcessHandle;
use crate::{CoreError, Result};
use schema::{Coverage, FailureReason, LaunchMode, ServiceState, SupervisorEvent};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Session file format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Launched handles of one session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Format version
    pub version: u32,
    /// RFC3339 timestamp when this snapshot was produced
    pub timestamp: String,
    /// Coverage the session reached
    pub coverage: Coverage,
    /// Per-service entries, in start order
    pub services: Vec<HandleSnapshot>,
}

/// What a later invocation needs to find one service's process again
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandleSnapshot {
    /// Service identifier
    pub id: String,
    /// Last tracked state
    pub state: ServiceState,
    /// Process ID, which is also the process group for detached launches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// How the process was launched
    pub launch_mode: LaunchMode,
    /// Failure reason for failed services
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl HandleSnapshot {
    /// Record a handle
    pub fn of(handle: &ProcessHandle) -> Self {
        Self {
            id: handle.service_id.clone(),
            state: handle.state,
            pid: handle.pid,
            launch_mode: handle.launched_via,
            failure: handle.failure.clone(),
        }
    }
}

impl SessionSnapshot {
    /// Snapshot of `handles` taken now
    pub fn new(coverage: Coverage, services: Vec<HandleSnapshot>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            timestamp: SupervisorEvent::current_timestamp(),
            coverage,
            services,
        }
    }

    /// Entry for a service
    pub fn get(&self, id: &str) -> Option<&HandleSnapshot> {
        self.services.iter().find(|s| s.id == id)
    }
}

/// Session file that belongs to a services file
///
/// `stack/kindling.toml` keeps its session in `stack/kindling.session.json`.
pub fn session_path_for(config: &Path) -> PathBuf {
    config.with_extension("session.json")
}

/// Load a session snapshot
///
/// Returns `Ok(None)` when there is no session file.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Option<SessionSnapshot>> {
    let path = path.as_ref();
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(persistence(path, format!("read failed: {e}"))),
    };

    let snapshot: SessionSnapshot = serde_json::from_str(&data)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(persistence(
            path,
            format!(
                "unsupported version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            ),
        ));
    }
    Ok(Some(snapshot))
}

/// Atomically replace the session file with `snapshot`
pub fn write_snapshot_atomic(path: impl AsRef<Path>, snapshot: &SessionSnapshot) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| persistence(parent, format!("create dir failed: {e}")))?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(snapshot)?;
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| persistence(&tmp_path, format!("open failed: {e}")))?;
        file.write_all(&json)
            .map_err(|e| persistence(&tmp_path, format!("write failed: {e}")))?;
        let _ = file.sync_all();
    }

    fs::rename(&tmp_path, path)
        .map_err(|e| persistence(path, format!("replace failed: {e}")))?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Delete the session file; a missing file is fine
pub fn remove_snapshot(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(persistence(path, format!("remove failed: {e}"))),
    }
}

fn persistence(path: &Path, cause: String) -> CoreError {
    CoreError::Persistence {
        path: path.to_path_buf(),
        cause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_snapshot() -> SessionSnapshot {
        SessionSnapshot::new(
            Coverage::Partial,
            vec![
                HandleSnapshot {
                    id: "llama".to_string(),
                    state: ServiceState::Ready,
                    pid: Some(4242),
                    launch_mode: LaunchMode::Detached,
                    failure: None,
                },
                HandleSnapshot {
                    id: "embedding".to_string(),
                    state: ServiceState::Failed,
                    pid: None,
                    launch_mode: LaunchMode::Detached,
                    failure: Some(FailureReason::LaunchFailed {
                        cause: "exited with code 1".to_string(),
                    }),
                },
            ],
        )
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("kindling.session.json");
        let snapshot = make_snapshot();

        write_snapshot_atomic(&path, &snapshot).expect("write");
        assert!(!path.with_extension("json.tmp").exists());
        let loaded = load_snapshot(&path).expect("load").expect("present");
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.get("llama").and_then(|h| h.pid), Some(4242));
    }

    #[test]
    fn test_missing_file_is_no_session() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("kindling.session.json");
        assert_eq!(load_snapshot(&path).expect("load"), None);
        remove_snapshot(&path).expect("removing a missing file is fine");
    }

    #[test]
    fn test_rejects_other_versions() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("kindling.session.json");
        let mut snapshot = make_snapshot();
        snapshot.version = SNAPSHOT_VERSION + 1;
        write_snapshot_atomic(&path, &snapshot).expect("write");

        match load_snapshot(&path) {
            Err(e @ CoreError::Persistence { .. }) => assert_eq!(e.code(), "CORE011"),
            other => panic!("expected a version error, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("kindling.session.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            load_snapshot(&path),
            Err(CoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_session_path_sits_next_to_config() {
        assert_eq!(
            session_path_for(Path::new("/srv/stack/kindling.toml")),
            PathBuf::from("/srv/stack/kindling.session.json")
        );
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let json = serde_json::to_value(make_snapshot()).expect("serialize");
        assert_eq!(json["services"][0]["launchMode"], "detached");
        assert!(json["services"][1].get("pid").is_none());
    }
}
