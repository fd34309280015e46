//! Session supervisor
//!
//! A [`Supervisor`] owns one catalogue of services and drives one session at
//! a time through
//!
//! ```text
//! Idle → Starting → Running(Full | Partial) → Stopping → Idle
//! ```
//!
//! ## Operations
//!
//! - [`Supervisor::start`]: validates the catalogue, checks prerequisites,
//!   then launches every service once its dependencies have resolved and
//!   gates it on its readiness probe
//! - [`Supervisor::stop`]: cancels an in-flight start, terminates every
//!   tracked handle in stop order, then sweeps match patterns. Never fails.
//! - [`Supervisor::status`]: reconciles tracked state with external liveness
//! - [`Supervisor::snapshot`] / [`Supervisor::restore`]: carry a session's
//!   handles over to another supervisor, such as a later CLI invocation
//!
//! Operations are serialised by a single lock. `start` and `status` are
//! rejected with [`CoreError::Busy`] while another operation holds it; `stop`
//! cancels any start in progress and then queues for the lock.
//!
//! Every transition and failure is broadcast as a [`SupervisorEvent`]; see
//! [`Supervisor::subscribe`].

use crate::error::{CoreError, Result};
use crate::graph::ServiceGraph;
use crate::handle::ProcessHandle;
use crate::launcher::{Launcher, Termination};
use crate::persistence::{HandleSnapshot, SessionSnapshot};
use schema::{
    Coverage, FailureReason, Service, ServiceState, SessionState, StatusReport, SupervisorEvent,
    SupervisorOptions,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod start;
mod status;

#[cfg(test)]
mod start_tests;
#[cfg(test)]
mod test_support;

const EVENT_CAPACITY: usize = 256;

/// Mutable state of one session, guarded by the operation lock
#[derive(Debug, Default)]
pub struct SupervisorState {
    /// Handle per catalogue service for the current session
    pub handles: HashMap<String, ProcessHandle>,
    /// Whether a session has been started and not yet stopped
    pub started: bool,
    /// Start order of the current session
    pub last_order: Vec<String>,
}

/// Result of a `start` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    /// Whether every service reached `Ready`
    pub coverage: Coverage,
    /// Final tracked state per service, in start order
    pub states: Vec<(String, ServiceState)>,
    /// Failure reasons for services that ended `Failed`
    pub failures: Vec<(String, FailureReason)>,
    /// Whether a `stop` interrupted the sequence
    pub interrupted: bool,
}

impl StartReport {
    /// Tracked state of a service
    pub fn state_of(&self, id: &str) -> Option<ServiceState> {
        self.states.iter().find(|(s, _)| s == id).map(|(_, st)| *st)
    }

    /// Failure reason of a service
    pub fn failure_of(&self, id: &str) -> Option<&FailureReason> {
        self.failures.iter().find(|(s, _)| s == id).map(|(_, r)| r)
    }
}

/// Result of a `stop` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Services whose tracked process was terminated
    pub terminated: Vec<String>,
    /// Services whose tracked process was already gone
    pub not_found: Vec<String>,
    /// Processes terminated by pattern sweeps
    pub swept: usize,
    /// Termination attempts that failed, with their cause
    pub failures: Vec<(String, String)>,
}

/// Supervises one catalogue of services
pub struct Supervisor {
    catalogue: Vec<Service>,
    launcher: Arc<dyn Launcher>,
    options: SupervisorOptions,
    state: Mutex<SupervisorState>,
    start_cancel: std::sync::Mutex<Option<CancellationToken>>,
    stop_requests: AtomicU64,
    session: watch::Sender<SessionState>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("services", &self.catalogue.len())
            .field("session", &self.session())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create a supervisor for `catalogue`
    ///
    /// The catalogue is validated on every `start`, not here.
    pub fn new(
        catalogue: Vec<Service>,
        launcher: Arc<dyn Launcher>,
        options: SupervisorOptions,
    ) -> Self {
        let (session, _) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            catalogue,
            launcher,
            options,
            state: Mutex::new(SupervisorState::default()),
            start_cancel: std::sync::Mutex::new(None),
            stop_requests: AtomicU64::new(0),
            session,
            events,
        }
    }

    /// Declared services, in declaration order
    pub fn catalogue(&self) -> &[Service] {
        &self.catalogue
    }

    /// Session-wide options
    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Services whose declared paths are missing, with the first missing path
    pub fn preflight(&self) -> Vec<(String, PathBuf)> {
        self.catalogue
            .iter()
            .filter_map(|s| start::missing_prerequisite(s).map(|path| (s.id.clone(), path)))
            .collect()
    }

    /// Current session state
    pub fn session(&self) -> SessionState {
        *self.session.borrow()
    }

    /// Watch session state changes
    pub fn watch_session(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    /// Subscribe to supervisor events
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Start a session
    ///
    /// Returns [`CoreError::Busy`] while another operation is in flight,
    /// [`CoreError::AlreadyRunning`] if a session exists, and
    /// [`CoreError::Config`] if the catalogue is invalid (nothing is launched).
    /// Launch failures and readiness timeouts are not errors; they show up in
    /// the returned [`StartReport`].
    pub async fn start(&self) -> Result<StartReport> {
        let stops_seen = self.stop_requests.load(Ordering::SeqCst);
        let Ok(mut state) = self.state.try_lock() else {
            self.reject("start", CoreError::Busy);
            return Err(CoreError::Busy);
        };
        if state.started {
            self.reject("start", CoreError::AlreadyRunning);
            return Err(CoreError::AlreadyRunning);
        }

        let graph = match ServiceGraph::build(self.catalogue.clone()) {
            Ok(graph) => graph,
            Err(e) => {
                let err = CoreError::from(e);
                error!("Refusing to start: {}", err);
                self.emit(SupervisorEvent::error(
                    None,
                    "config",
                    err.to_string(),
                    Some(err.code().to_string()),
                ));
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        self.install_cancel(&cancel, stops_seen);
        state.started = true;
        state.last_order = graph.start_ids();
        self.set_session(SessionState::Starting);
        info!("Starting {} service(s): {}", graph.len(), state.last_order.join(" → "));

        let result = start::StartRun::new(self, &graph, &cancel)
            .run(&mut state)
            .await;
        self.cancel_slot().take();

        match result {
            Ok(report) if report.interrupted => {
                info!("Start interrupted; handing over to stop");
                Ok(report)
            }
            Ok(report) => {
                self.set_session(SessionState::Running(report.coverage));
                Ok(report)
            }
            Err(e) => {
                error!("Start aborted by internal fault: {}", e);
                self.emit(SupervisorEvent::error(
                    None,
                    "start",
                    e.to_string(),
                    Some(e.code().to_string()),
                ));
                self.teardown(&mut state).await;
                Err(e)
            }
        }
    }

    /// Stop the session and sweep leftovers
    ///
    /// Allowed from any state and idempotent. Without a session only the
    /// pattern sweeps run.
    pub async fn stop(&self) -> StopReport {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = self.cancel_slot().as_ref() {
            info!("Stop requested during start; cancelling");
            cancel.cancel();
        }
        let mut state = self.state.lock().await;
        self.teardown(&mut state).await
    }

    /// Report every catalogue service, reconciled against external liveness
    pub async fn status(&self) -> Result<StatusReport> {
        let Ok(state) = self.state.try_lock() else {
            return Err(CoreError::Busy);
        };
        let session = self.session();
        let mut services = Vec::with_capacity(self.catalogue.len());
        for service in self.ordered_catalogue() {
            let handle = state.handles.get(&service.id);
            services.push(status::reconcile(self.launcher.as_ref(), service, handle).await);
        }
        Ok(StatusReport { session, services })
    }

    /// Handles of the current session, for a later [`Supervisor::restore`]
    ///
    /// Returns `None` when no session is running.
    pub async fn snapshot(&self) -> Result<Option<SessionSnapshot>> {
        let Ok(state) = self.state.try_lock() else {
            return Err(CoreError::Busy);
        };
        let coverage = match self.session() {
            SessionState::Running(coverage) => coverage,
            _ if state.started => Coverage::Partial,
            _ => return Ok(None),
        };
        let services = state
            .last_order
            .iter()
            .filter_map(|id| state.handles.get(id))
            .map(HandleSnapshot::of)
            .collect();
        Ok(Some(SessionSnapshot::new(coverage, services)))
    }

    /// Adopt the handles of a session started by another supervisor
    ///
    /// Restored handles carry a PID but no launch identity, so stop reaches
    /// them by PID (by process group for detached launches). Entries for
    /// services no longer in the catalogue are skipped. Returns how many
    /// handles were restored.
    pub async fn restore(&self, snapshot: &SessionSnapshot) -> Result<usize> {
        let Ok(mut state) = self.state.try_lock() else {
            return Err(CoreError::Busy);
        };
        if state.started {
            return Err(CoreError::AlreadyRunning);
        }

        let mut handles = HashMap::new();
        for entry in &snapshot.services {
            let Some(service) = self.catalogue.iter().find(|s| s.id == entry.id) else {
                warn!("Session file names unknown service '{}'; skipping", entry.id);
                continue;
            };
            let mut handle = ProcessHandle::pending(service);
            handle.state = entry.state;
            handle.pid = entry.pid;
            handle.launched_via = entry.launch_mode;
            handle.failure = entry.failure.clone();
            handles.insert(entry.id.clone(), handle);
        }

        let restored = handles.len();
        state.handles = handles;
        state.started = true;
        state.last_order = self
            .ordered_catalogue()
            .into_iter()
            .map(|s| s.id.clone())
            .collect();
        self.set_session(SessionState::Running(snapshot.coverage));
        info!(
            "Restored {} handle(s) from session of {}",
            restored, snapshot.timestamp
        );
        Ok(restored)
    }

    async fn teardown(&self, state: &mut SupervisorState) -> StopReport {
        self.set_session(SessionState::Stopping);
        let grace = self.options.graceful_stop_timeout();
        let mut report = StopReport::default();

        let order: Vec<String> = state.last_order.iter().rev().cloned().collect();
        for id in &order {
            let Some(handle) = state.handles.get_mut(id) else {
                continue;
            };
            if !handle.is_launched() {
                continue;
            }

            match self.launcher.terminate_by_handle(handle, grace).await {
                Ok(outcome) => {
                    let found = outcome == Termination::Terminated;
                    if found {
                        info!("Terminated '{}'", id);
                        report.terminated.push(id.clone());
                    } else {
                        debug!("'{}' was already gone", id);
                        report.not_found.push(id.clone());
                    }
                    self.emit(SupervisorEvent::process_terminated(
                        id.clone(),
                        handle.pid,
                        found,
                    ));
                    if let Some(from) = handle.transition(ServiceState::Stopped) {
                        self.emit(SupervisorEvent::state_changed(
                            id.clone(),
                            from,
                            ServiceState::Stopped,
                            None,
                        ));
                    }
                }
                Err(e) => {
                    warn!("Failed to terminate '{}': {}", id, e);
                    self.emit(SupervisorEvent::error(
                        Some(id.clone()),
                        "stop",
                        e.to_string(),
                        Some(e.code().to_string()),
                    ));
                    report.failures.push((id.clone(), e.to_string()));
                }
            }
        }

        for service in self.ordered_catalogue().into_iter().rev() {
            let Some(pattern) = service
                .match_pattern
                .as_deref()
                .filter(|p| !p.trim().is_empty())
            else {
                continue;
            };
            match self.launcher.terminate_by_pattern(pattern, grace).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Swept {} process(es) matching '{}'", count, pattern);
                    }
                    report.swept += count;
                    self.emit(SupervisorEvent::sweep_completed(
                        service.id.clone(),
                        pattern.to_string(),
                        count,
                    ));
                }
                Err(e) => {
                    warn!("Sweep for '{}' failed: {}", pattern, e);
                    self.emit(SupervisorEvent::error(
                        Some(service.id.clone()),
                        "sweep",
                        e.to_string(),
                        Some(e.code().to_string()),
                    ));
                    report.failures.push((service.id.clone(), e.to_string()));
                }
            }
        }

        state.handles.clear();
        state.started = false;
        state.last_order.clear();
        self.set_session(SessionState::Idle);
        info!(
            "Stopped: {} terminated, {} already gone, {} swept, {} failure(s)",
            report.terminated.len(),
            report.not_found.len(),
            report.swept,
            report.failures.len()
        );
        report
    }

    /// Catalogue in start order, or declaration order if it does not validate
    fn ordered_catalogue(&self) -> Vec<&Service> {
        match ServiceGraph::build(self.catalogue.clone()) {
            Ok(graph) => graph
                .start_ids()
                .iter()
                .filter_map(|id| self.catalogue.iter().find(|s| &s.id == id))
                .collect(),
            Err(_) => self.catalogue.iter().collect(),
        }
    }

    /// Publish a start's cancel token
    ///
    /// A stop that arrived after the start read `stops_seen` may have found
    /// the slot still empty, so the token is cancelled right away.
    fn install_cancel(&self, cancel: &CancellationToken, stops_seen: u64) {
        *self.cancel_slot() = Some(cancel.clone());
        if self.stop_requests.load(Ordering::SeqCst) != stops_seen {
            info!("Stop requested while start was preparing; cancelling");
            cancel.cancel();
        }
    }

    fn cancel_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.start_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_session(&self, to: SessionState) {
        let from = self.session.send_replace(to);
        if from != to {
            info!("Session {} → {}", from, to);
            self.emit(SupervisorEvent::session_changed(from, to));
        }
    }

    fn reject(&self, operation: &str, err: CoreError) {
        warn!("{} rejected: {}", operation, err);
        self.emit(SupervisorEvent::warning(
            None,
            format!("{operation} rejected: {err}"),
            Some(err.code().to_string()),
        ));
    }

    pub(crate) fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
