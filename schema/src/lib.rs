//! Schema definitions for Kindling
//!
//! This crate contains the data structures shared by the supervisor core and
//! its callers: service declarations, readiness strategies, lifecycle states
//! and the events the supervisor emits. All types here implement JSON Schema
//! generation for external consumption.

pub mod events;
pub mod service;

pub use events::*;
pub use service::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Point-in-time view of one service, as reported by a status query
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Service identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Reconciled state (external liveness wins over memory)
    pub state: ServiceState,
    /// State last recorded by the supervisor, if the service is tracked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracked_state: Option<ServiceState>,
    /// Process ID, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Failure reason for failed services
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

/// Status of every service known to a supervisor
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Session state at the time of the query
    pub session: SessionState,
    /// One entry per catalogue service, in start order
    pub services: Vec<ServiceStatus>,
}

impl StatusReport {
    /// Look up a service's status by id
    pub fn get(&self, id: &str) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Reconciled state of a service, if known
    pub fn state_of(&self, id: &str) -> Option<ServiceState> {
        self.get(id).map(|s| s.state)
    }
}
