#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Configuration management for prm
//!
//! This crate handles loading and merging configuration from:
//! - Default values (hard-coded)
//! - Configuration file (~/.config/prm/config.toml)
//! - Environment variables
//! - CLI flags

use prm_errors::{ConfigError, Error};
use prm_types::{OutputFormat, PriorityLevels};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_output_format")]
    pub default_output: OutputFormat,
}

/// Arbiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_priority_levels")]
    pub priority_levels: usize,
    /// Give up on a blocked request after this many milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,
    /// Total number of grants the arbiter hands out over its lifetime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u64>,
}

/// Load simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
}

// Default implementations

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_output: OutputFormat::Tty,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            priority_levels: 4,
            wait_timeout_ms: None,
            max_uses: None,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            rounds: 25,
            hold_ms: 2,
        }
    }
}

// Default value functions for serde
fn default_output_format() -> OutputFormat {
    OutputFormat::Tty
}

fn default_priority_levels() -> usize {
    4
}

fn default_workers() -> usize {
    8
}

fn default_rounds() -> usize {
    25
}

fn default_hold_ms() -> u64 {
    2
}

impl ManagerConfig {
    /// Validated level count
    ///
    /// # Errors
    ///
    /// Returns an error if `priority_levels` is zero or above
    /// `prm_types::MAX_LEVELS`.
    pub fn levels(&self) -> Result<PriorityLevels, Error> {
        PriorityLevels::new(self.priority_levels).map_err(|_| {
            ConfigError::InvalidValue {
                field: "manager.priority_levels".to_string(),
                value: self.priority_levels.to_string(),
            }
            .into()
        })
    }

    #[must_use]
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

impl SimulationConfig {
    #[must_use]
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

impl Config {
    /// Get the default config file path
    ///
    /// # Errors
    ///
    /// Returns an error if the system config directory cannot be determined.
    pub fn default_path() -> Result<PathBuf, Error> {
        let config_dir = dirs::config_dir().ok_or_else(|| ConfigError::NotFound {
            path: "config directory".to_string(),
        })?;
        Ok(config_dir.join("prm").join("config.toml"))
    }

    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NotFound` if the file does not exist,
    /// `Error::Io` for any other read failure, and a parse error if the
    /// contents are not valid TOML.
    pub async fn load_from_file(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::from(ConfigError::NotFound {
                    path: path.display().to_string(),
                })
            } else {
                Error::from(err)
            }
        })?;

        debug!(path = %path.display(), "loaded config file");

        toml::from_str(&contents)
            .map_err(ConfigError::from)
            .map_err(Into::into)
    }

    /// Load configuration with fallback to defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read
    /// or contains invalid TOML syntax.
    pub async fn load() -> Result<Self, Error> {
        let config_path = Self::default_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an optional path or use default
    ///
    /// If path is provided, loads from that file.
    /// If path is None, uses the default loading behavior.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(config_path) => Self::load_from_file(config_path).await,
            None => Self::load().await,
        }
    }

    /// Merge with environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables contain invalid values
    /// that cannot be parsed into the expected types.
    pub fn merge_env(&mut self) -> Result<(), Error> {
        // PRM_OUTPUT
        if let Ok(output) = std::env::var("PRM_OUTPUT") {
            self.general.default_output = match output.as_str() {
                "plain" => OutputFormat::Plain,
                "tty" => OutputFormat::Tty,
                "json" => OutputFormat::Json,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: "PRM_OUTPUT".to_string(),
                        value: output,
                    }
                    .into())
                }
            };
        }

        if let Some(levels) = env_value("PRM_PRIORITY_LEVELS")? {
            self.manager.priority_levels = levels;
        }
        if let Some(timeout) = env_value("PRM_WAIT_TIMEOUT_MS")? {
            self.manager.wait_timeout_ms = Some(timeout);
        }
        if let Some(max_uses) = env_value("PRM_MAX_USES")? {
            self.manager.max_uses = Some(max_uses);
        }
        if let Some(workers) = env_value("PRM_WORKERS")? {
            self.simulation.workers = workers;
        }
        if let Some(rounds) = env_value("PRM_ROUNDS")? {
            self.simulation.rounds = rounds;
        }
        if let Some(hold) = env_value("PRM_HOLD_MS")? {
            self.simulation.hold_ms = hold;
        }

        Ok(())
    }

    /// Reject settings the arbiter or the simulation cannot run with
    ///
    /// # Errors
    ///
    /// Returns an error if the level count, the use budget or the worker
    /// count is zero.
    pub fn validate(&self) -> Result<(), Error> {
        self.manager.levels()?;
        if self.manager.max_uses == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "manager.max_uses".to_string(),
                value: "0".to_string(),
            }
            .into());
        }
        if self.simulation.workers == 0 {
            return Err(ConfigError::Invalid {
                message: "simulation.workers must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self)
            .map_err(ConfigError::from)
            .map_err(Into::into)
    }
}

/// Parse an optional environment variable
fn env_value<T: FromStr>(var: &str) -> Result<Option<T>, Error> {
    match std::env::var(var) {
        Ok(raw) => raw.parse().map(Some).map_err(|_| {
            ConfigError::InvalidValue {
                field: var.to_string(),
                value: raw,
            }
            .into()
        }),
        Err(_) => Ok(None),
    }
}
