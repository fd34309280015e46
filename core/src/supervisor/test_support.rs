//! Shared fixtures for supervisor tests

use super::Supervisor;
use crate::launcher::MockLauncher;
use schema::{ReadinessSpec, Service, SupervisorEvent, SupervisorOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A loopback port nothing is listening on
pub(super) fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind")
        .local_addr()
        .expect("addr")
        .port()
}

/// TCP readiness with short timings
pub(super) fn tcp(port: u16, retries: u32) -> ReadinessSpec {
    ReadinessSpec::TcpConnect {
        host: "127.0.0.1".to_string(),
        port,
        timeout_ms: 200,
        max_retries: retries,
        retry_interval_ms: 20,
    }
}

/// Create an empty start script and return its path
pub(super) fn script(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "#!/bin/sh\n").expect("write script");
    path
}

/// A service launched as `sh <script>` that requires the script to exist
pub(super) fn scripted(id: &str, script: &Path) -> Service {
    let script = script.to_string_lossy().into_owned();
    Service::new(id, ["sh".to_string(), script.clone()]).requiring(script)
}

pub(super) fn fast_options() -> SupervisorOptions {
    SupervisorOptions {
        launch_timeout_ms: 2_000,
        graceful_stop_timeout_ms: 100,
        ..SupervisorOptions::default()
    }
}

pub(super) fn supervisor(services: Vec<Service>, launcher: &MockLauncher) -> Supervisor {
    supervisor_with(services, launcher, fast_options())
}

pub(super) fn supervisor_with(
    services: Vec<Service>,
    launcher: &MockLauncher,
    options: SupervisorOptions,
) -> Supervisor {
    Supervisor::new(services, Arc::new(launcher.clone()), options)
}

/// Everything already broadcast on `rx`
pub(super) fn drain(rx: &mut broadcast::Receiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `condition` until it holds or two seconds pass
pub(super) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
