//! The task executor contract.
//!
//! The engine never runs work itself. Every unit of work (a worker pass, a
//! verifier pass, a best-of candidate, a judge, a gate check, a synthesis)
//! is one call to a [`TaskExecutor`]. Implementations spin up or reuse a
//! remote execution context, run the prompt against the item's files and
//! return a [`TaskResult`] envelope.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::task::{Item, TaskMeta, TaskResult, TaskRole};

/// Errors an executor may raise instead of returning an envelope.
///
/// The engine treats any of these exactly like a `status = error` result
/// carrying the error message.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The execution backend failed.
    #[error("Execution failed: {0}")]
    Failed(String),

    /// The remote context did not answer in time.
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    /// The executor could not interpret the produced output.
    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything an executor needs to run one unit of work.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub prompt: String,
    /// JSON schema the structured output must satisfy.
    pub schema: Option<serde_json::Value>,
    /// Upper bound enforced by the engine around the call.
    pub timeout: Option<Duration>,
    pub role: TaskRole,
    /// Model override, set by best-of candidate overrides.
    pub model: Option<String>,
    /// Free-form executor parameters.
    pub params: BTreeMap<String, serde_json::Value>,
    pub meta: TaskMeta,
}

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>, role: TaskRole, meta: TaskMeta) -> Self {
        Self {
            prompt: prompt.into(),
            schema: None,
            timeout: None,
            role,
            model: None,
            params: BTreeMap::new(),
            meta: meta.with_role(role),
        }
    }

    pub fn with_schema(mut self, schema: Option<serde_json::Value>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Appends a paragraph to the prompt.
    pub fn append_prompt(mut self, extra: &str) -> Self {
        if !extra.is_empty() {
            if !self.prompt.is_empty() {
                self.prompt.push_str("\n\n");
            }
            self.prompt.push_str(extra);
        }
        self
    }
}

/// Executes one unit of work for one item.
///
/// Implementations must eventually settle for every call and must not hold
/// on to the item after returning. Transient infrastructure failures should
/// be reported as `Err` rather than as a partial success envelope.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Runs `request` against `item`.
    async fn execute(
        &self,
        item: Item,
        request: ExecutionRequest,
    ) -> Result<TaskResult, ExecutorError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "executor"
    }
}

#[async_trait]
impl<T: TaskExecutor + ?Sized> TaskExecutor for Arc<T> {
    async fn execute(
        &self,
        item: Item,
        request: ExecutionRequest,
    ) -> Result<TaskResult, ExecutorError> {
        (**self).execute(item, request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_request_role_is_recorded_in_meta() {
        let request =
            ExecutionRequest::new("do it", TaskRole::Judge, TaskMeta::new(Uuid::nil(), 0, 3));
        assert_eq!(request.meta.role, Some(TaskRole::Judge));
        assert_eq!(request.meta.item_index, 3);
    }

    #[test]
    fn test_append_prompt() {
        let meta = TaskMeta::default();
        let request = ExecutionRequest::new("base", TaskRole::Worker, meta.clone())
            .append_prompt("feedback");
        assert_eq!(request.prompt, "base\n\nfeedback");

        let unchanged = ExecutionRequest::new("base", TaskRole::Worker, meta).append_prompt("");
        assert_eq!(unchanged.prompt, "base");
    }

    #[test]
    fn test_executor_error_display() {
        let err = ExecutorError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));

        let err = ExecutorError::Failed("sandbox gone".to_string());
        assert_eq!(err.to_string(), "Execution failed: sandbox gone");
    }
}
