//! Core functionality for Kindling
//!
//! This crate holds the supervisor itself: the dependency graph, readiness
//! probes, the launcher abstraction and the session state machine, plus the
//! configuration loader used by the CLI.

pub mod config;
pub mod error;
pub mod graph;
pub mod handle;
pub mod health;
pub mod launcher;
pub mod notify;
pub mod persistence;
pub mod process;
pub mod supervisor;

// Re-export schema types for convenience
pub use schema::*;

pub use config::{load_services_from_toml_path, load_services_from_toml_str, ServicesFile};
pub use error::{ConfigError, CoreError, LaunchError, Result};
pub use graph::ServiceGraph;
pub use handle::ProcessHandle;
pub use health::{ReadinessOutcome, ReadinessProbe};
pub use launcher::{
    Launcher, LaunchId, LaunchRequest, LaunchedProcess, LivenessTarget, MockLauncher, ProcessExit,
    Termination,
};
#[cfg(unix)]
pub use launcher::SystemLauncher;
pub use notify::{forward_events, MemorySink, NotificationSink, TracingSink};
pub use persistence::{HandleSnapshot, SessionSnapshot};
pub use supervisor::{StartReport, StopReport, Supervisor};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
