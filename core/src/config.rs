//! Configuration loading and validation for Kindling
//!
//! This module parses a TOML configuration into [`schema::Service`] values
//! and [`schema::SupervisorOptions`], applies defaults (via serde defaults on
//! the schema types), and performs strict validation with field-path error
//! messages.
//!
//! Two layouts are accepted. The canonical one is an array of tables:
//!
//! ```toml
//! [supervisor]
//! pacingMs = 500
//!
//! [[services]]
//! id = "llama"
//! launchCommand = ["sh", "start_llama.sh"]
//! ```
//!
//! The alternate one keys each service table by its id:
//!
//! ```toml
//! [llama]
//! launchCommand = ["sh", "start_llama.sh"]
//! ```
//!
//! Declaration order is preserved in both, since it breaks ties in the start
//! order.

use crate::error::ConfigError;
use crate::Result;
use schema::{ReadinessSpec, Service, SupervisorOptions};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Top-level TOML structure
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServicesFile {
    /// Session-wide options
    #[serde(default)]
    pub supervisor: SupervisorOptions,
    /// Services to supervise, in declaration order
    pub services: Vec<Service>,
}

const SUPERVISOR_TABLE: &str = "supervisor";

impl ServicesFile {
    /// Validate the configuration, reporting the first problem with its field path
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let options = &self.supervisor;
        if options.launch_timeout_ms == 0 {
            return Err(invalid("supervisor.launchTimeoutMs: must be > 0"));
        }
        if options.graceful_stop_timeout_ms == 0 {
            return Err(invalid("supervisor.gracefulStopTimeoutMs: must be > 0"));
        }

        if self.services.is_empty() {
            return Err(invalid("services: must contain at least one service"));
        }

        let mut seen = HashSet::new();
        for (i, svc) in self.services.iter().enumerate() {
            if svc.id.trim().is_empty() {
                return Err(invalid(format!("services[{i}].id: cannot be empty")));
            }
            if !seen.insert(svc.id.as_str()) {
                return Err(invalid(format!(
                    "services[{i}].id: duplicate id '{}'",
                    svc.id
                )));
            }

            match svc.program() {
                None => {
                    return Err(invalid(format!(
                        "services[{i}].launchCommand: cannot be empty"
                    )))
                }
                Some(program) if program.trim().is_empty() => {
                    return Err(invalid(format!(
                        "services[{i}].launchCommand[0]: program cannot be blank"
                    )))
                }
                Some(_) => {}
            }

            for (j, dep) in svc.depends_on.iter().enumerate() {
                if dep.trim().is_empty() {
                    return Err(invalid(format!(
                        "services[{i}].dependsOn[{j}]: cannot be empty"
                    )));
                }
            }

            if svc.environment.keys().any(|k| k.trim().is_empty()) {
                return Err(invalid(format!(
                    "services[{i}].environment: keys cannot be empty"
                )));
            }

            if svc
                .match_pattern
                .as_deref()
                .is_some_and(|p| p.trim().is_empty())
            {
                return Err(invalid(format!(
                    "services[{i}].matchPattern: cannot be blank"
                )));
            }

            validate_readiness(i, &svc.readiness)?;
        }
        Ok(())
    }

    /// Anchor every service's working directory at `base`
    ///
    /// Services without one run in `base`; relative ones are joined onto it.
    /// Required paths stay relative to the working directory, which is also
    /// where the process is spawned.
    pub fn resolve_paths(&mut self, base: &Path) {
        for svc in &mut self.services {
            svc.working_directory = Some(match svc.working_directory.take() {
                Some(dir) if dir.is_relative() => base.join(dir),
                Some(dir) => dir,
                None => base.to_path_buf(),
            });
        }
    }
}

fn validate_readiness(index: usize, spec: &ReadinessSpec) -> std::result::Result<(), ConfigError> {
    match spec {
        ReadinessSpec::FixedDelay { .. } => Ok(()),
        ReadinessSpec::TcpConnect {
            host,
            port,
            timeout_ms,
            ..
        } => {
            if host.trim().is_empty() {
                return Err(invalid(format!(
                    "services[{index}].readiness.host: cannot be empty"
                )));
            }
            if *port == 0 {
                return Err(invalid(format!(
                    "services[{index}].readiness.port: must be 1..=65535"
                )));
            }
            validate_timeout(index, *timeout_ms)
        }
        ReadinessSpec::HttpHealth {
            url, timeout_ms, ..
        } => {
            let uri: hyper::Uri = url.parse().map_err(|e| {
                invalid(format!("services[{index}].readiness.url: {e}"))
            })?;
            if uri.scheme_str() != Some("http") || uri.host().is_none() {
                return Err(invalid(format!(
                    "services[{index}].readiness.url: must be an http:// URL with a host"
                )));
            }
            validate_timeout(index, *timeout_ms)
        }
    }
}

fn validate_timeout(index: usize, timeout_ms: u64) -> std::result::Result<(), ConfigError> {
    if timeout_ms == 0 {
        return Err(invalid(format!(
            "services[{index}].readiness.timeoutMs: must be > 0"
        )));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Load services from a TOML file path
///
/// Services run in the file's directory unless they name another, and
/// relative paths in the file resolve against it.
pub fn load_services_from_toml_path(path: impl AsRef<Path>) -> Result<ServicesFile> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })?;
    let mut cfg = load_services_from_toml_str(&data)?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    cfg.resolve_paths(base);
    Ok(cfg)
}

/// Load services from a TOML string
pub fn load_services_from_toml_str(input: &str) -> Result<ServicesFile> {
    // First try the canonical [[services]] array format
    let cfg = match toml::from_str::<ServicesFile>(input) {
        Ok(cfg) => cfg,
        Err(canonical) => parse_keyed_tables(input, canonical)?,
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Fall back to top-level tables keyed by service id
fn parse_keyed_tables(
    input: &str,
    canonical: toml::de::Error,
) -> std::result::Result<ServicesFile, ConfigError> {
    let mut table: toml::Table =
        toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // A file that has a `services` key is meant to be canonical; report why it failed
    if table.contains_key("services") {
        return Err(ConfigError::Parse(canonical.to_string()));
    }

    let supervisor = match table.remove(SUPERVISOR_TABLE) {
        Some(value) => value
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(format!("[supervisor]: {e}")))?,
        None => SupervisorOptions::default(),
    };

    let mut services = Vec::with_capacity(table.len());
    for (id, value) in table {
        let mut service_table = match value {
            toml::Value::Table(t) => t,
            other => {
                return Err(ConfigError::Parse(format!(
                    "service '{}' must be a table, found {}",
                    id,
                    other.type_str()
                )))
            }
        };
        service_table
            .entry("id".to_string())
            .or_insert(toml::Value::String(id.clone()));

        let service: Service = toml::Value::Table(service_table).try_into().map_err(|e: toml::de::Error| {
            ConfigError::Parse(format!("failed to parse service '{id}': {e}"))
        })?;
        services.push(service);
    }

    Ok(ServicesFile {
        supervisor,
        services,
    })
}
