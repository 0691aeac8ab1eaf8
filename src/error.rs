//! Error types for swarm orchestration.
//!
//! Three classes of failure exist:
//! - Item-level failures are never errors here: they travel as data in
//!   `TaskResult::error` and land in a stage's error bucket.
//! - Configuration errors are returned synchronously when a pipeline is
//!   built or loaded, before any executor call.
//! - Infrastructure errors abort a run and are surfaced from `Pipeline::run`
//!   together with the partial run.

use thiserror::Error;

use crate::config::ConfigError;
use crate::stage::StageKind;

/// Errors raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Engine configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A retry, verify or best-of policy carries an illegal value.
    #[error("Invalid {policy} policy: {reason}")]
    InvalidPolicy {
        policy: &'static str,
        reason: String,
    },

    /// A stage was appended after a terminal synthesis stage.
    #[error("Cannot append a {kind} stage: the pipeline already ends with a synthesis stage")]
    TerminalStage { kind: StageKind },

    /// A pipeline definition file could not be turned into a pipeline.
    #[error("Invalid pipeline definition: {0}")]
    Definition(String),

    /// The scheduler was closed while calls were still being admitted.
    #[error("Scheduler is closed: no further executor calls can be admitted")]
    SchedulerClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SwarmError {
    /// Creates an invalid-policy error.
    pub fn invalid_policy(policy: &'static str, reason: impl Into<String>) -> Self {
        SwarmError::InvalidPolicy {
            policy,
            reason: reason.into(),
        }
    }

    /// Whether this error was raised before any executor call was issued.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SwarmError::Config(_)
                | SwarmError::InvalidPolicy { .. }
                | SwarmError::TerminalStage { .. }
                | SwarmError::Definition(_)
        )
    }

    /// Whether this error aborts a running pipeline.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, SwarmError::SchedulerClosed)
    }
}

/// Result type alias for engine operations.
pub type SwarmResult<T> = Result<T, SwarmError>;
