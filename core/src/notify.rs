//! Notification sinks for supervisor events
//!
//! The supervisor only broadcasts [`SupervisorEvent`]s. A [`NotificationSink`]
//! renders them for some audience, and [`forward_events`] pumps a broadcast
//! receiver into a sink on a background task.

use schema::{EventFilter, EventSeverity, SupervisorEvent};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives every event that passes the sink's filter
pub trait NotificationSink: Send + Sync {
    /// Handle one event
    fn notify(&self, event: &SupervisorEvent);
}

/// Renders events as `tracing` records at their severity
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    filter: EventFilter,
}

impl TracingSink {
    /// A sink that logs every event
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that logs only events matching `filter`
    pub fn with_filter(filter: EventFilter) -> Self {
        Self { filter }
    }
}

impl NotificationSink for TracingSink {
    fn notify(&self, event: &SupervisorEvent) {
        if !self.filter.matches(event) {
            return;
        }
        let service = event.service_id().unwrap_or("-");
        let kind = event.kind();
        let detail = event.detail();
        match event.severity() {
            EventSeverity::Debug => debug!(service, kind, "{}", detail),
            EventSeverity::Info => info!(service, kind, "{}", detail),
            EventSeverity::Warning => warn!(service, kind, "{}", detail),
            EventSeverity::Error => error!(service, kind, "{}", detail),
        }
    }
}

/// Keeps events in memory, for callers that render them later
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SupervisorEvent>>>,
}

impl MemorySink {
    /// An empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far
    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NotificationSink for MemorySink {
    fn notify(&self, event: &SupervisorEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Forward events from `rx` into `sink` until the sender side closes
///
/// Events dropped because the receiver lagged are reported once per gap.
pub fn forward_events(
    mut rx: broadcast::Receiver<SupervisorEvent>,
    sink: Arc<dyn NotificationSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => sink.notify(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Notification sink lagged; {} event(s) dropped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
