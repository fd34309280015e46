//! CLI error types

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] kindling_core::CoreError),

    #[error("Unsupported platform: {0}")]
    Unsupported(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CliError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CliError::CommandFailed(_) => "CLI001",
            CliError::ConfigError(_) => "CLI003",
            CliError::Supervisor(_) => "CLI005",
            CliError::Unsupported(_) => "CLI006",
            CliError::Serialization(_) => "CLI008",
        }
    }

    /// Whether the error came from loading or validating the configuration
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            CliError::ConfigError(_) | CliError::Supervisor(kindling_core::CoreError::Config(_))
        )
    }
}

/// CLI-specific result type
pub type Result<T> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;
    use kindling_core::{ConfigError, CoreError};

    #[test]
    fn test_error_codes() {
        assert_eq!(CliError::CommandFailed("test".to_string()).code(), "CLI001");
        assert_eq!(CliError::ConfigError("test".to_string()).code(), "CLI003");
        assert_eq!(CliError::Supervisor(CoreError::Busy).code(), "CLI005");
        assert_eq!(CliError::Unsupported("windows").code(), "CLI006");
    }

    #[test]
    fn test_config_errors_are_classified() {
        let err = CliError::from(CoreError::from(ConfigError::Invalid("x".to_string())));
        assert!(err.is_config());
        assert!(!CliError::from(CoreError::Busy).is_config());
    }

    #[test]
    fn test_error_display() {
        let error = CliError::CommandFailed("session partially started".to_string());
        assert_eq!(error.to_string(), "Command failed: session partially started");
    }
}
