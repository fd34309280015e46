//! The start sequence
//!
//! Prerequisites are checked for the whole catalogue before anything is
//! launched. Each remaining service then runs as its own future, all polled
//! together on the calling task: it waits for the gates of its dependencies,
//! launches, and probes readiness. Futures never touch handles directly; they
//! send [`Update`]s that the coordinating loop applies in arrival order.
//!
//! While a service is being paced and probed, the launcher is asked every
//! [`EXIT_POLL`] whether the launched process has exited. A non-zero exit
//! fails the service and blocks its dependents. A clean exit is reported and
//! probing continues, since start scripts commonly fork the real server and
//! return.

use super::{StartReport, Supervisor, SupervisorState};
use crate::error::{ConfigError, CoreError, LaunchError, Result};
use crate::graph::ServiceGraph;
use crate::handle::ProcessHandle;
use crate::health::{ReadinessOutcome, ReadinessProbe};
use crate::launcher::{LaunchId, LaunchRequest, LaunchedProcess, ProcessExit};
use futures::future::join_all;
use schema::{
    Coverage, DegradedPolicy, FailureReason, Service, ServiceState, SupervisorEvent,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EXIT_POLL: Duration = Duration::from_millis(100);

/// What a service tells its dependents once it has resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Waiting,
    Open,
    Blocked,
}

#[derive(Debug)]
enum Update {
    Launched {
        service_id: String,
        process: LaunchedProcess,
    },
    Exited {
        service_id: String,
        exit: ProcessExit,
    },
    Ready {
        service_id: String,
        attempts: u32,
        elapsed: Duration,
    },
    Degraded {
        service_id: String,
        attempts: u32,
        last_error: Option<String>,
        elapsed: Duration,
    },
    Failed {
        service_id: String,
        reason: FailureReason,
    },
}

struct Dependency {
    id: String,
    gate: watch::Receiver<Gate>,
}

pub(super) struct StartRun<'a> {
    supervisor: &'a Supervisor,
    graph: &'a ServiceGraph,
    cancel: &'a CancellationToken,
}

impl<'a> StartRun<'a> {
    pub(super) fn new(
        supervisor: &'a Supervisor,
        graph: &'a ServiceGraph,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            supervisor,
            graph,
            cancel,
        }
    }

    pub(super) async fn run(&self, state: &mut SupervisorState) -> Result<StartReport> {
        state.handles = self
            .graph
            .services()
            .iter()
            .map(|s| (s.id.clone(), ProcessHandle::pending(s)))
            .collect();

        self.check_prerequisites(state)?;

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for service in self.graph.start_order() {
            let initial = match state.handles.get(&service.id).map(|h| h.state) {
                Some(ServiceState::Failed) => failure_gate(service),
                _ => Gate::Waiting,
            };
            let (tx, rx) = watch::channel(initial);
            senders.insert(service.id.as_str(), tx);
            receivers.insert(service.id.as_str(), rx);
        }

        let (updates, mut rx) = mpsc::unbounded_channel();
        let mut runners = Vec::new();
        for service in self.graph.start_order() {
            if state.handles.get(&service.id).map(|h| h.state) != Some(ServiceState::Pending) {
                continue;
            }
            let dependencies = service
                .depends_on
                .iter()
                .filter_map(|dep| {
                    receivers.get(dep.as_str()).map(|gate| Dependency {
                        id: dep.clone(),
                        gate: gate.clone(),
                    })
                })
                .collect();
            let Some(gate) = senders.remove(service.id.as_str()) else {
                return Err(CoreError::Internal(format!(
                    "no gate for service '{}'",
                    service.id
                )));
            };
            runners.push(self.run_service(service, dependencies, gate, updates.clone()));
        }
        drop(updates);

        let runners = join_all(runners);
        tokio::pin!(runners);
        let mut finished = false;
        loop {
            tokio::select! {
                Some(update) = rx.recv() => self.apply(state, update)?,
                _ = &mut runners, if !finished => finished = true,
                else => break,
            }
        }

        Ok(self.report(state))
    }

    fn check_prerequisites(&self, state: &mut SupervisorState) -> Result<()> {
        for service in self.graph.start_order() {
            if let Some(path) = missing_prerequisite(service) {
                let err = CoreError::Config(ConfigError::MissingPath {
                    service: service.id.clone(),
                    path: path.clone(),
                });
                warn!("{}", err);
                self.supervisor.emit(SupervisorEvent::error(
                    Some(service.id.clone()),
                    "preflight",
                    err.to_string(),
                    Some(err.code().to_string()),
                ));
                self.record_failure(
                    state,
                    &service.id,
                    FailureReason::MissingPrerequisite { path },
                )?;
            }
        }

        for service in self.graph.start_order() {
            let already_failed = state
                .handles
                .get(&service.id)
                .is_some_and(|h| h.state == ServiceState::Failed);
            if already_failed {
                continue;
            }
            let blocking = service.depends_on.iter().find(|dep| {
                let failed = state
                    .handles
                    .get(dep.as_str())
                    .is_some_and(|h| h.state == ServiceState::Failed);
                let optional = self.graph.get(dep).is_some_and(|s| s.optional);
                failed && !optional
            });
            if let Some(dependency) = blocking.cloned() {
                self.record_failure(
                    state,
                    &service.id,
                    FailureReason::DependencyFailed { dependency },
                )?;
            }
        }
        Ok(())
    }

    async fn run_service(
        &self,
        service: &Service,
        dependencies: Vec<Dependency>,
        gate: watch::Sender<Gate>,
        updates: mpsc::UnboundedSender<Update>,
    ) {
        let outcome = self.drive_service(service, dependencies, &updates).await;
        gate.send_replace(outcome);
    }

    async fn drive_service(
        &self,
        service: &Service,
        dependencies: Vec<Dependency>,
        updates: &mpsc::UnboundedSender<Update>,
    ) -> Gate {
        let fail = |reason: FailureReason| {
            let _ = updates.send(Update::Failed {
                service_id: service.id.clone(),
                reason,
            });
            failure_gate(service)
        };

        for mut dependency in dependencies {
            let resolved = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return fail(FailureReason::Interrupted),
                result = dependency.gate.wait_for(|g| *g != Gate::Waiting) => {
                    result.map(|g| *g).unwrap_or(Gate::Blocked)
                }
            };
            if resolved == Gate::Blocked {
                debug!("'{}' blocked by '{}'", service.id, dependency.id);
                return fail(FailureReason::DependencyFailed {
                    dependency: dependency.id,
                });
            }
        }

        if self.cancel.is_cancelled() {
            return fail(FailureReason::Interrupted);
        }

        let options = self.supervisor.options();
        let request = LaunchRequest::for_service(service);
        let launched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return fail(FailureReason::Interrupted),
            result = timeout(options.launch_timeout(), self.supervisor.launcher.launch(&request)) => result,
        };
        let process = match launched {
            Ok(Ok(process)) => process,
            Ok(Err(e)) => return fail(FailureReason::LaunchFailed { cause: e.to_string() }),
            Err(_) => {
                let cause = LaunchError::Timeout(options.launch_timeout()).to_string();
                return fail(FailureReason::LaunchFailed { cause });
            }
        };
        let _ = updates.send(Update::Launched {
            service_id: service.id.clone(),
            process,
        });

        let started = Instant::now();
        let settle = self.settle(service);
        tokio::pin!(settle);
        let exited = self.watch_exit(process.launch_id);
        tokio::pin!(exited);
        let mut watching = true;
        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut settle => break outcome,
                exit = &mut exited, if watching => {
                    let _ = updates.send(Update::Exited {
                        service_id: service.id.clone(),
                        exit,
                    });
                    if !exit.success() {
                        return fail(FailureReason::LaunchFailed { cause: exit.to_string() });
                    }
                    watching = false;
                }
            }
        };

        match outcome {
            ReadinessOutcome::Ready { attempts } => {
                let _ = updates.send(Update::Ready {
                    service_id: service.id.clone(),
                    attempts,
                    elapsed: started.elapsed(),
                });
                Gate::Open
            }
            ReadinessOutcome::TimedOut {
                attempts,
                last_error,
            } => {
                let _ = updates.send(Update::Degraded {
                    service_id: service.id.clone(),
                    attempts,
                    last_error,
                    elapsed: started.elapsed(),
                });
                match options.degraded_policy {
                    DegradedPolicy::Block if !service.optional => Gate::Blocked,
                    _ => Gate::Open,
                }
            }
            ReadinessOutcome::Cancelled => Gate::Blocked,
        }
    }

    /// Pacing delay, then the readiness probe
    async fn settle(&self, service: &Service) -> ReadinessOutcome {
        let pacing = self.supervisor.options().pacing();
        if !pacing.is_zero() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ReadinessOutcome::Cancelled,
                _ = sleep(pacing) => {}
            }
        }
        ReadinessProbe::new(service.readiness.clone())
            .await_ready(self.cancel)
            .await
    }

    /// Resolves once the launched process has exited
    async fn watch_exit(&self, launch_id: LaunchId) -> ProcessExit {
        loop {
            if let Some(exit) = self.supervisor.launcher.exit_status(launch_id).await {
                return exit;
            }
            sleep(EXIT_POLL).await;
        }
    }

    fn apply(&self, state: &mut SupervisorState, update: Update) -> Result<()> {
        match update {
            Update::Launched {
                service_id,
                process,
            } => {
                let handle = handle_mut(state, &service_id)?;
                let from = handle
                    .record_launch(&process)
                    .ok_or_else(|| illegal(&service_id, handle.state, ServiceState::Starting))?;
                info!(
                    "Launched '{}' (pid: {})",
                    service_id,
                    process.pid.map_or("hidden".to_string(), |p| p.to_string())
                );
                self.supervisor.emit(SupervisorEvent::process_launched(
                    service_id.clone(),
                    process.pid,
                    handle.launched_via,
                    handle.command.clone(),
                ));
                self.supervisor.emit(SupervisorEvent::state_changed(
                    service_id,
                    from,
                    ServiceState::Starting,
                    None,
                ));
            }
            Update::Exited { service_id, exit } => {
                if exit.success() {
                    info!("'{}' launch command exited cleanly; still probing", service_id);
                } else {
                    warn!("'{}' {} while starting", service_id, exit);
                }
                let (code, signal) = match exit {
                    ProcessExit::Code(code) => (Some(code), None),
                    ProcessExit::Signal(signal) => (None, Some(signal)),
                };
                self.supervisor
                    .emit(SupervisorEvent::process_exited(service_id, code, signal));
            }
            Update::Ready {
                service_id,
                attempts,
                elapsed,
            } => {
                self.transition(state, &service_id, ServiceState::Ready, None)?;
                info!("'{}' is ready after {} attempt(s)", service_id, attempts);
                self.supervisor.emit(SupervisorEvent::readiness_result(
                    service_id.clone(),
                    true,
                    attempts,
                    self.target(&service_id),
                    None,
                    millis(elapsed),
                ));
            }
            Update::Degraded {
                service_id,
                attempts,
                last_error,
                elapsed,
            } => {
                let timeout = CoreError::ReadinessTimeout {
                    service_id: service_id.clone(),
                    attempts,
                };
                self.transition(
                    state,
                    &service_id,
                    ServiceState::Degraded,
                    Some(timeout.to_string()),
                )?;
                warn!("{}", timeout);
                self.supervisor.emit(SupervisorEvent::readiness_result(
                    service_id.clone(),
                    false,
                    attempts,
                    self.target(&service_id),
                    last_error,
                    millis(elapsed),
                ));
                self.supervisor.emit(SupervisorEvent::warning(
                    Some(service_id),
                    timeout.to_string(),
                    Some(timeout.code().to_string()),
                ));
            }
            Update::Failed { service_id, reason } => {
                if let FailureReason::LaunchFailed { cause } = &reason {
                    error!("Failed to launch '{}': {}", service_id, cause);
                    let err = CoreError::Launch(LaunchError::Rejected(cause.clone()));
                    self.supervisor.emit(SupervisorEvent::error(
                        Some(service_id.clone()),
                        "launch",
                        cause.clone(),
                        Some(err.code().to_string()),
                    ));
                }
                self.record_failure(state, &service_id, reason)?;
            }
        }
        Ok(())
    }

    fn transition(
        &self,
        state: &mut SupervisorState,
        service_id: &str,
        to: ServiceState,
        reason: Option<String>,
    ) -> Result<()> {
        let handle = handle_mut(state, service_id)?;
        let from = handle
            .transition(to)
            .ok_or_else(|| illegal(service_id, handle.state, to))?;
        self.supervisor.emit(SupervisorEvent::state_changed(
            service_id.to_string(),
            from,
            to,
            reason,
        ));
        Ok(())
    }

    fn record_failure(
        &self,
        state: &mut SupervisorState,
        service_id: &str,
        reason: FailureReason,
    ) -> Result<()> {
        let handle = handle_mut(state, service_id)?;
        let from = handle
            .fail(reason.clone())
            .ok_or_else(|| illegal(service_id, handle.state, ServiceState::Failed))?;
        let optional = self.graph.get(service_id).is_some_and(|s| s.optional);
        if optional {
            warn!("Optional service '{}' failed: {}", service_id, reason);
        } else {
            info!("'{}' failed: {}", service_id, reason);
        }
        self.supervisor.emit(SupervisorEvent::state_changed(
            service_id.to_string(),
            from,
            ServiceState::Failed,
            Some(reason.to_string()),
        ));
        self.supervisor.emit(SupervisorEvent::service_failed(
            service_id.to_string(),
            reason,
            optional,
        ));
        Ok(())
    }

    fn target(&self, service_id: &str) -> String {
        self.graph
            .get(service_id)
            .map(|s| s.readiness.target())
            .unwrap_or_default()
    }

    fn report(&self, state: &SupervisorState) -> StartReport {
        let mut states = Vec::with_capacity(self.graph.len());
        let mut failures = Vec::new();
        for id in self.graph.start_ids() {
            if let Some(handle) = state.handles.get(&id) {
                states.push((id.clone(), handle.state));
                if let Some(reason) = &handle.failure {
                    failures.push((id, reason.clone()));
                }
            }
        }
        let coverage = if states.iter().all(|(_, s)| *s == ServiceState::Ready) {
            Coverage::Full
        } else {
            Coverage::Partial
        };
        StartReport {
            coverage,
            states,
            failures,
            interrupted: self.cancel.is_cancelled(),
        }
    }
}

/// What dependents see when `service` fails
fn failure_gate(service: &Service) -> Gate {
    if service.optional {
        Gate::Open
    } else {
        Gate::Blocked
    }
}

/// First declared path of `service` that does not exist
///
/// Relative paths resolve against the service's working directory.
pub(super) fn missing_prerequisite(service: &Service) -> Option<PathBuf> {
    let base = service.working_directory.as_deref();
    if let Some(dir) = base {
        if !dir.is_dir() {
            return Some(dir.to_path_buf());
        }
    }

    let program = service
        .program()
        .filter(|p| p.contains(std::path::MAIN_SEPARATOR))
        .map(Path::new);
    service
        .requires
        .iter()
        .map(PathBuf::as_path)
        .chain(program)
        .map(|path| match base {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        })
        .find(|path| !path.exists())
}

fn handle_mut<'s>(state: &'s mut SupervisorState, service_id: &str) -> Result<&'s mut ProcessHandle> {
    state
        .handles
        .get_mut(service_id)
        .ok_or_else(|| CoreError::Internal(format!("no handle for service '{service_id}'")))
}

fn illegal(service_id: &str, from: ServiceState, to: ServiceState) -> CoreError {
    CoreError::Internal(format!(
        "illegal transition for '{service_id}': {from} → {to}"
    ))
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
