//! Engine configuration.
//!
//! Values come from builder methods or from `SWARM_*` environment
//! variables. Every config is validated before an engine is built from it.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::retry::{RetryPolicy, RetrySettings};

/// Hard upper bound on engine concurrency.
pub const MAX_CONCURRENCY: usize = 256;

/// Concurrency used when nothing else is configured.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum executor calls in flight at once, engine-wide.
    pub concurrency: usize,
    /// Retry policy of stages that do not set their own.
    pub default_retry: RetryPolicy,
    /// Timeout of executor calls whose stage sets none.
    pub default_timeout: Option<Duration>,
    /// Opaque correlation id copied into every result's meta.
    pub tag: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            default_retry: RetryPolicy::default(),
            default_timeout: None,
            tag: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Loads configuration from `SWARM_*` environment variables.
    ///
    /// Recognized variables:
    /// - `SWARM_CONCURRENCY`
    /// - `SWARM_TIMEOUT_MS`
    /// - `SWARM_TAG`
    /// - `SWARM_RETRY_MAX_ATTEMPTS`
    /// - `SWARM_RETRY_BACKOFF_MS`
    /// - `SWARM_RETRY_BACKOFF_MULTIPLIER`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let mut retry = RetrySettings::default();

        if let Some(val) = lookup("SWARM_CONCURRENCY") {
            config.concurrency = parse_env_value(&val, "SWARM_CONCURRENCY")?;
        }

        if let Some(val) = lookup("SWARM_TIMEOUT_MS") {
            let millis: u64 = parse_env_value(&val, "SWARM_TIMEOUT_MS")?;
            config.default_timeout = Some(Duration::from_millis(millis));
        }

        if let Some(val) = lookup("SWARM_TAG") {
            if !val.trim().is_empty() {
                config.tag = Some(val);
            }
        }

        if let Some(val) = lookup("SWARM_RETRY_MAX_ATTEMPTS") {
            retry.max_attempts = parse_env_value(&val, "SWARM_RETRY_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("SWARM_RETRY_BACKOFF_MS") {
            retry.backoff_ms = parse_env_value(&val, "SWARM_RETRY_BACKOFF_MS")?;
        }

        if let Some(val) = lookup("SWARM_RETRY_BACKOFF_MULTIPLIER") {
            retry.backoff_multiplier = parse_env_value(&val, "SWARM_RETRY_BACKOFF_MULTIPLIER")?;
        }

        config.default_retry = retry.into();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        if self.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::ValidationFailed(format!(
                "concurrency must be at most {MAX_CONCURRENCY}, got {}",
                self.concurrency
            )));
        }

        if self.default_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ValidationFailed(
                "default_timeout must be greater than 0".to_string(),
            ));
        }

        self.default_retry
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;

        Ok(())
    }

    /// Serializable view, used by the `config` command.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            concurrency: self.concurrency,
            retry: RetrySettings::from(&self.default_retry),
            timeout_ms: self.default_timeout.map(|t| t.as_millis() as u64),
            tag: self.tag.clone(),
        }
    }
}

/// Plain-data rendering of an [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSummary {
    pub concurrency: usize,
    pub retry: RetrySettings,
    pub timeout_ms: Option<u64>,
    pub tag: Option<String>,
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
