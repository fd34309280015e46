//! Core error types and utilities

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration problems that are fatal to `start()`
///
/// Nothing is launched for a session whose configuration fails validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("dependency cycle detected among: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("service '{service}' depends on undeclared service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("service '{0}' is declared more than once")]
    DuplicateService(String),

    #[error("service '{service}': required path {} does not exist", path.display())]
    MissingPath { service: String, path: PathBuf },

    #[error("{0}")]
    Invalid(String),

    #[error("failed to read {}: {cause}", path.display())]
    Read { path: PathBuf, cause: String },

    #[error("TOML parse error: {0}")]
    Parse(String),
}

/// The launcher failed to create a process
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("launch command is empty")]
    EmptyCommand,

    #[error("failed to spawn '{program}': {cause}")]
    Spawn { program: String, cause: String },

    #[error("launch not confirmed within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Rejected(String),
}

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Readiness timeout: service '{service_id}' not ready after {attempts} attempt(s)")]
    ReadinessTimeout { service_id: String, attempts: u32 },

    #[error("Termination error for {target}: {cause}")]
    Termination { target: String, cause: String },

    #[error("Supervisor is busy with another operation")]
    Busy,

    #[error("A session is already running")]
    AlreadyRunning,

    #[error("Process spawn error: {0}")]
    ProcessSpawn(String),

    #[error("Process signal error: {0}")]
    ProcessSignal(String),

    #[error("Process wait error: {0}")]
    ProcessWait(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("Session file {}: {cause}", path.display())]
    Persistence { path: PathBuf, cause: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CORE001",
            CoreError::Launch(_) => "CORE002",
            CoreError::ReadinessTimeout { .. } => "CORE003",
            CoreError::Termination { .. } => "CORE004",
            CoreError::Busy => "CORE005",
            CoreError::AlreadyRunning => "CORE006",
            CoreError::ProcessSpawn(_) => "CORE007",
            CoreError::ProcessSignal(_) => "CORE008",
            CoreError::ProcessWait(_) => "CORE009",
            CoreError::InitializationError(_) => "CORE010",
            CoreError::Persistence { .. } => "CORE011",
            CoreError::Serialization(_) => "CORE012",
            CoreError::Internal(_) => "CORE999",
        }
    }

    /// Whether the error is a classified, recoverable outcome rather than an
    /// internal fault
    pub fn is_classified(&self) -> bool {
        !matches!(self, CoreError::Internal(_))
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;
