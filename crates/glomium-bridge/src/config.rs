//! Bridge configuration.
//!
//! Precedence, highest first:
//! 1. `GLOMIUM_*` environment variables
//! 2. A TOML file or string
//! 3. Built-in defaults
//!
//! ```toml
//! [gas]
//! limit = 20000000
//! memory_byte_cost = 1
//!
//! [log]
//! level = "info"
//! format = "compact"
//! ```

use std::path::Path;

use glomium_wire::GasConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::telemetry::LogConfig;

/// Environment variable overriding `gas.limit`.
pub const ENV_GAS_LIMIT: &str = "GLOMIUM_GAS_LIMIT";
/// Environment variable overriding `gas.memory_byte_cost`.
pub const ENV_MEMORY_BYTE_COST: &str = "GLOMIUM_MEMORY_BYTE_COST";
/// Environment variable overriding `log.level`.
pub const ENV_LOG: &str = "GLOMIUM_LOG";

/// Default gas budget of a fresh context.
pub const DEFAULT_GAS_LIMIT: u64 = 20_000_000;

/// Maximum accepted config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("Failed to parse config at {path}: {source}")]
    ParseError {
        /// Path of the file, or `<inline>`.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("Validation error in field '{field}': {message}")]
    ValidationError {
        /// Offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// An environment override could not be parsed.
    #[error("Environment variable '{var_name}': {message}")]
    EnvError {
        /// Variable name.
        var_name: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Gas settings for new contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GasSection {
    /// Execution budget of a context.
    pub limit: u64,
    /// Gas charged per allocated byte.
    pub memory_byte_cost: u64,
}

impl Default for GasSection {
    fn default() -> Self {
        Self {
            limit: DEFAULT_GAS_LIMIT,
            memory_byte_cost: 1,
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Gas settings.
    pub gas: GasSection,
    /// Logging settings, consumed by [`setup_logging`](crate::telemetry::setup_logging).
    pub log: LogConfig,
}

impl BridgeConfig {
    /// Parse a TOML string. Environment overrides are not applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] on malformed TOML or unknown keys.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|source| ConfigError::ParseError {
            path: "<inline>".to_owned(),
            source,
        })
    }

    /// Load a TOML file, apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, an
    /// override is malformed, or the result fails validation.
    pub fn load_file(path: &Path) -> ConfigResult<Self> {
        let read_error = |source| ConfigError::ReadError {
            path: path.display().to_string(),
            source,
        };
        let metadata = std::fs::metadata(path).map_err(read_error)?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::ValidationError {
                field: path.display().to_string(),
                message: format!(
                    "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                    metadata.len()
                ),
            });
        }
        let content = std::fs::read_to_string(path).map_err(read_error)?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.display().to_string(),
            source,
        })?;

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if an override is malformed or the result
    /// fails validation.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GLOMIUM_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvError`] if a numeric override does not parse.
    pub fn apply_env(&mut self) -> ConfigResult<usize> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Returns how many were applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvError`] if a numeric override does not parse.
    pub fn apply_env_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<usize> {
        let mut applied: usize = 0;

        if let Some(raw) = lookup(ENV_GAS_LIMIT) {
            self.gas.limit = parse_env(ENV_GAS_LIMIT, &raw)?;
            applied = applied.saturating_add(1);
        }
        if let Some(raw) = lookup(ENV_MEMORY_BYTE_COST) {
            self.gas.memory_byte_cost = parse_env(ENV_MEMORY_BYTE_COST, &raw)?;
            applied = applied.saturating_add(1);
        }
        if let Some(raw) = lookup(ENV_LOG) {
            self.log.level = raw.trim().to_owned();
            applied = applied.saturating_add(1);
        }

        if applied > 0 {
            debug!(count = applied, "applied environment variable overrides");
        }
        Ok(applied)
    }

    /// Check values are within acceptable ranges.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::ValidationError`] found.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.gas.limit == 0 {
            return Err(ConfigError::ValidationError {
                field: "gas.limit".to_owned(),
                message: "gas limit must be greater than zero".to_owned(),
            });
        }

        if !VALID_LEVELS.contains(&self.log.level.as_str()) {
            return Err(ConfigError::ValidationError {
                field: "log.level".to_owned(),
                message: format!(
                    "invalid level '{}'; expected one of: {}",
                    self.log.level,
                    VALID_LEVELS.join(", ")
                ),
            });
        }

        Ok(())
    }

    /// Gas settings to seed contexts with.
    #[must_use]
    pub fn gas_config(&self) -> GasConfig {
        GasConfig::new(self.gas.limit, self.gas.memory_byte_cost)
    }
}

fn parse_env(var_name: &str, raw: &str) -> ConfigResult<u64> {
    raw.trim().parse().map_err(|e| ConfigError::EnvError {
        var_name: var_name.to_owned(),
        message: format!("expected a non-negative integer, got '{raw}': {e}"),
    })
}
