//! Configuration for the constraint controller.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::r#loop::LoopConfig;
use crate::reconciler::{ReconcilerConfig, DEFAULT_FINALIZER};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CONSTRAINT_SYNC_";

/// Controller configuration, loadable from TOML, JSON or YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Finalizer attached to managed constraints.
    #[serde(default = "default_finalizer_name")]
    pub finalizer_name: String,

    /// Number of reconciliation passes that may run at once.
    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,

    /// First retry delay in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry delay cap in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Default log filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            finalizer_name: default_finalizer_name(),
            max_concurrent_reconciles: default_max_concurrent_reconciles(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a file. The format follows the extension:
    /// `.json`, `.yaml`/`.yml`, anything else is read as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the file cannot be read or parsed,
    /// or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("failed to read {}: {e}", path.display()))
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let config: Self = match extension {
            "json" => serde_json::from_str(&content)
                .map_err(|e| Error::invalid_config(format!("Failed to parse config: {e}")))?,
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| Error::invalid_config(format!("Failed to parse config: {e}")))?,
            _ => toml::from_str(&content)
                .map_err(|e| Error::invalid_config(format!("Failed to parse config: {e}")))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `CONSTRAINT_SYNC_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a numeric override does not parse
    /// or the result fails validation.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Apply overrides from `lookup`, which maps an unprefixed variable name
    /// such as `LOG_LEVEL` to its value.
    ///
    /// # Errors
    ///
    /// See [`ControllerConfig::with_env_overrides`].
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("FINALIZER_NAME") {
            self.finalizer_name = name;
        }
        if let Some(value) = lookup("MAX_CONCURRENT_RECONCILES") {
            self.max_concurrent_reconciles = parse_number("MAX_CONCURRENT_RECONCILES", &value)?;
        }
        if let Some(value) = lookup("BACKOFF_BASE_MS") {
            self.backoff_base_ms = parse_number("BACKOFF_BASE_MS", &value)?;
        }
        if let Some(value) = lookup("BACKOFF_MAX_MS") {
            self.backoff_max_ms = parse_number("BACKOFF_MAX_MS", &value)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(value) = lookup("LOG_JSON") {
            self.log_json = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        self.validate()?;
        Ok(self)
    }

    /// Check invariants between fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.finalizer_name.trim().is_empty() {
            return Err(Error::invalid_config("finalizer_name must not be empty"));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::invalid_config(
                "max_concurrent_reconciles must be at least 1",
            ));
        }
        if self.backoff_base_ms == 0 {
            return Err(Error::invalid_config("backoff_base_ms must be positive"));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(Error::invalid_config(
                "backoff_max_ms must not be below backoff_base_ms",
            ));
        }
        Ok(())
    }

    /// Reconciler settings.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            finalizer_name: self.finalizer_name.clone(),
        }
    }

    /// Loop settings.
    pub const fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            max_concurrent: self.max_concurrent_reconciles,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_config(format!("{ENV_PREFIX}{name} is not a number: {value}")))
}

fn default_finalizer_name() -> String {
    DEFAULT_FINALIZER.to_string()
}

const fn default_max_concurrent_reconciles() -> usize {
    4
}

const fn default_backoff_base_ms() -> u64 {
    5
}

const fn default_backoff_max_ms() -> u64 {
    1_000_000
}

fn default_log_level() -> String {
    "info".to_string()
}
