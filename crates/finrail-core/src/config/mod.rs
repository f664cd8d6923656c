//! Configuration parsing and validation.
//!
//! One TOML file configures the whole core: which key-value backend the
//! locks use, the lock retry budget, the circuit defaults, and where the
//! two `SQLite` databases live. Parsing is fail-closed: a config that
//! would disable a safety mechanism (zero thresholds, empty store
//! address) is rejected at load time rather than discovered in
//! production.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::CircuitConfig;
use crate::lock::LockConfig;


/// Errors that can occur during configuration handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The config parsed but describes an unsafe setup.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Which backing store the lock manager talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum KvBackendConfig {
    /// Process-local fallback store.
    #[default]
    Memory,

    /// Redis-protocol server at `addr` (`host:port`).
    Resp {
        /// Address to dial.
        addr: String,
    },
}

impl KvBackendConfig {
    /// Builds the configured backing store.
    ///
    /// This is the only place the backend choice is made; everything
    /// downstream sees the [`KvStore`](crate::kv::KvStore) trait.
    #[must_use]
    pub fn build(&self) -> std::sync::Arc<dyn crate::kv::KvStore> {
        match self {
            Self::Memory => std::sync::Arc::new(crate::kv::MemoryKvStore::new()),
            Self::Resp { addr } => std::sync::Arc::new(crate::kv::RespKvStore::new(addr.clone())),
        }
    }
}

/// Top-level core configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Path of the audit database (lock history, circuit log).
    #[serde(default = "default_audit_db")]
    pub audit_db: PathBuf,

    /// Path of the financial event store database.
    #[serde(default = "default_events_db")]
    pub events_db: PathBuf,

    /// Lock backing store selection.
    #[serde(default)]
    pub kv: KvBackendConfig,

    /// Lock manager tuning.
    #[serde(default)]
    pub lock: LockConfig,

    /// Defaults for lazily-created circuits.
    #[serde(default)]
    pub breaker: CircuitConfig,
}

fn default_audit_db() -> PathBuf {
    PathBuf::from("finrail-audit.db")
}

fn default_events_db() -> PathBuf {
    PathBuf::from("finrail-events.db")
}

impl CoreConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects configurations that would disable a safety mechanism.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let KvBackendConfig::Resp { addr } = &self.kv {
            if addr.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "kv.addr must not be empty for the resp backend".to_string(),
                ));
            }
        }
        if self.lock.default_ttl.is_zero() {
            return Err(ConfigError::Validation(
                "lock.default_ttl must be greater than zero".to_string(),
            ));
        }
        if self.lock.sweep_interval.is_zero() {
            return Err(ConfigError::Validation(
                "lock.sweep_interval must be greater than zero".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "breaker.failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.breaker.half_open_success_threshold == 0 {
            return Err(ConfigError::Validation(
                "breaker.half_open_success_threshold must be greater than zero".to_string(),
            ));
        }
        if self.breaker.reset_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "breaker.reset_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
