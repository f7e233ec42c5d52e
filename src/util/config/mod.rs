//! taskweave configuration
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (TASKWEAVE_*)
//! 3. Config file (taskweave.toml)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use taskweave::util::config::load_config;
//!
//! let config = load_config("taskweave.toml").unwrap();
//! assert!(config.pool.max_workers >= 1);
//! ```
//!
//! Durations are written as integer milliseconds (`idle_timeout_ms = 500`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::errors::SchedulerError;
use crate::runtime::lock::{BackoffPolicy, LockStrategy};
use crate::runtime::scheduler::PoolConfig;

/// Default config file name
pub const CONFIG_FILE: &str = "taskweave.toml";

pub const ENV_MIN_WORKERS: &str = "TASKWEAVE_MIN_WORKERS";
pub const ENV_MAX_WORKERS: &str = "TASKWEAVE_MAX_WORKERS";
pub const ENV_IDLE_TIMEOUT_MS: &str = "TASKWEAVE_IDLE_TIMEOUT_MS";
pub const ENV_SATURATION_THRESHOLD: &str = "TASKWEAVE_SATURATION_THRESHOLD";
pub const ENV_LOCK_STRATEGY: &str = "TASKWEAVE_LOCK_STRATEGY";

/// Full runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub locks: LockConfig,
}

/// Which lock strategy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Ordered,
    Backoff,
}

impl std::str::FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ordered" => Ok(StrategyKind::Ordered),
            "backoff" => Ok(StrategyKind::Backoff),
            other => Err(ConfigError::Invalid(format!(
                "unknown lock strategy '{}' (expected 'ordered' or 'backoff')",
                other
            ))),
        }
    }
}

/// Lock manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub strategy: StrategyKind,
    /// Bound for `acquire_all`; unbounded when absent.
    #[serde(
        with = "opt_duration_ms",
        rename = "default_timeout_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Ordered,
            default_timeout: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl LockConfig {
    pub fn strategy(&self) -> LockStrategy {
        match self.strategy {
            StrategyKind::Ordered => LockStrategy::Ordered,
            StrategyKind::Backoff => LockStrategy::Backoff(self.backoff),
        }
    }
}

impl RuntimeConfig {
    /// Apply `TASKWEAVE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides looked up through `lookup`.
    pub fn apply_overrides<F>(
        &mut self,
        lookup: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MIN_WORKERS) {
            self.pool.min_workers = parse_var(ENV_MIN_WORKERS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_WORKERS) {
            self.pool.max_workers = parse_var(ENV_MAX_WORKERS, &v)?;
        }
        if let Some(v) = lookup(ENV_IDLE_TIMEOUT_MS) {
            self.pool.idle_timeout = Duration::from_millis(parse_var(ENV_IDLE_TIMEOUT_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_SATURATION_THRESHOLD) {
            self.pool.saturation_threshold = parse_var(ENV_SATURATION_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_LOCK_STRATEGY) {
            self.locks.strategy = v.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate().map_err(|err| match err {
            SchedulerError::InvalidConfig(message) => ConfigError::Invalid(message),
            other => ConfigError::Invalid(other.to_string()),
        })?;
        self.locks
            .backoff
            .validate()
            .map_err(ConfigError::Invalid)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &str,
    value: &str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{}: cannot parse '{}'", name, value)))
}

/// Parse a config from TOML text (no environment overrides).
pub fn parse_config(content: &str) -> Result<RuntimeConfig, ConfigError> {
    let config: RuntimeConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Load a config file, then apply environment overrides and validate.
pub fn load_config(path: impl AsRef<Path>) -> Result<RuntimeConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: RuntimeConfig = toml::from_str(&content)?;
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Like [`load_config`], falling back to defaults when `path` is absent.
pub fn load_or_default(path: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => {
            let default = Path::new(CONFIG_FILE);
            if default.exists() {
                return load_config(default);
            }
            let mut config = RuntimeConfig::default();
            config.apply_env()?;
            config.validate()?;
            Ok(config)
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// `Option<Duration>` as integer milliseconds.
pub mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
