//! Stage definitions and their aggregated results.
//!
//! A pipeline is a list of stages, each one of:
//!
//! - **Transform** (map): every item is worked on under a [`QualityPolicy`]
//! - **Gate** (filter): every item is classified by a structured-output call
//!   followed by a local predicate
//! - **Synthesis** (reduce): all surviving items go into one call; terminal
//!
//! [`runner`] executes a stage against an engine; [`chain`] prepares the
//! items a stage forwards to its successor.

pub mod chain;
pub mod runner;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SwarmError;
use crate::quality::{BestOfPolicy, QualityPolicy, VerifyPolicy};
use crate::retry::RetryPolicy;
use crate::task::{Item, TaskResult, TaskStatus};

pub use runner::StageFailure;

/// Kind of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Transform,
    Gate,
    Synthesis,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Transform => "transform",
            StageKind::Gate => "gate",
            StageKind::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a prompt from an item and its index in the stage input.
pub type PromptFn = Arc<dyn Fn(&Item, usize) -> String + Send + Sync>;

/// Prompt of a stage: the same text for every item, or computed per item.
#[derive(Clone)]
pub enum Prompt {
    Fixed(String),
    Dynamic(PromptFn),
}

impl Prompt {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&Item, usize) -> String + Send + Sync + 'static,
    {
        Prompt::Dynamic(Arc::new(f))
    }

    pub fn render(&self, item: &Item, index: usize) -> String {
        match self {
            Prompt::Fixed(text) => text.clone(),
            Prompt::Dynamic(f) => f(item, index),
        }
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::Fixed(text) => f.debug_tuple("Fixed").field(text).finish(),
            Prompt::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Fixed(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Fixed(text)
    }
}

/// Which gate outcomes are forwarded to the next stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emit {
    #[default]
    Success,
    Filtered,
    /// Success and filtered items; errors are never forwarded.
    All,
}

impl Emit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Emit::Success => "success",
            Emit::Filtered => "filtered",
            Emit::All => "all",
        }
    }

    pub fn selects(&self, status: TaskStatus) -> bool {
        matches!(
            (self, status),
            (Emit::Success, TaskStatus::Success)
                | (Emit::Filtered, TaskStatus::Filtered)
                | (Emit::All, TaskStatus::Success | TaskStatus::Filtered)
        )
    }
}

/// Local, synchronous gate predicate over a parsed structured output.
pub type GatePredicate = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// Map stage.
#[derive(Debug, Clone)]
pub struct TransformStage {
    pub name: Option<String>,
    pub prompt: Prompt,
    pub schema: Option<serde_json::Value>,
    /// Falls back to the engine default when unset.
    pub retry: Option<RetryPolicy>,
    pub quality: QualityPolicy,
    pub timeout: Option<Duration>,
}

impl TransformStage {
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            name: None,
            prompt: prompt.into(),
            schema: None,
            retry: None,
            quality: QualityPolicy::Plain,
            timeout: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Runs each item through a verify loop, replacing any best-of policy.
    pub fn with_verify(mut self, policy: VerifyPolicy) -> Self {
        self.quality = QualityPolicy::Verify(policy);
        self
    }

    /// Runs each item as a best-of tournament, replacing any verify policy.
    pub fn with_best_of(mut self, policy: BestOfPolicy) -> Self {
        self.quality = QualityPolicy::BestOf(policy);
        self
    }

    pub fn with_quality(mut self, quality: QualityPolicy) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Filter stage.
#[derive(Clone)]
pub struct GateStage {
    pub name: Option<String>,
    pub prompt: Prompt,
    /// Schema of the structured output the predicate reads.
    pub schema: serde_json::Value,
    pub predicate: GatePredicate,
    pub emit: Emit,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
}

impl fmt::Debug for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateStage")
            .field("name", &self.name)
            .field("prompt", &self.prompt)
            .field("schema", &self.schema)
            .field("emit", &self.emit)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GateStage {
    pub fn new<F>(prompt: impl Into<Prompt>, schema: serde_json::Value, predicate: F) -> Self
    where
        F: Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    {
        Self {
            name: None,
            prompt: prompt.into(),
            schema,
            predicate: Arc::new(predicate),
            emit: Emit::Success,
            retry: None,
            timeout: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_emit(mut self, emit: Emit) -> Self {
        self.emit = emit;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Classifies a parsed output. Pure: same input, same answer.
    pub fn classify(&self, data: &serde_json::Value) -> TaskStatus {
        if (self.predicate)(data) {
            TaskStatus::Success
        } else {
            TaskStatus::Filtered
        }
    }
}

/// Reduce stage. Always the last stage of a pipeline.
#[derive(Debug, Clone)]
pub struct SynthesisStage {
    pub name: Option<String>,
    pub prompt: Prompt,
    pub schema: Option<serde_json::Value>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
}

impl SynthesisStage {
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            name: None,
            prompt: prompt.into(),
            schema: None,
            retry: None,
            timeout: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One stage of a pipeline.
#[derive(Debug, Clone)]
pub enum StageConfig {
    Transform(TransformStage),
    Gate(GateStage),
    Synthesis(SynthesisStage),
}

impl StageConfig {
    pub fn kind(&self) -> StageKind {
        match self {
            StageConfig::Transform(_) => StageKind::Transform,
            StageConfig::Gate(_) => StageKind::Gate,
            StageConfig::Synthesis(_) => StageKind::Synthesis,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            StageConfig::Transform(stage) => stage.name.as_deref(),
            StageConfig::Gate(stage) => stage.name.as_deref(),
            StageConfig::Synthesis(stage) => stage.name.as_deref(),
        }
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        match self {
            StageConfig::Transform(stage) => stage.retry.as_ref(),
            StageConfig::Gate(stage) => stage.retry.as_ref(),
            StageConfig::Synthesis(stage) => stage.retry.as_ref(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            StageConfig::Transform(stage) => stage.timeout,
            StageConfig::Gate(stage) => stage.timeout,
            StageConfig::Synthesis(stage) => stage.timeout,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind() == StageKind::Synthesis
    }

    /// Checks every policy carried by the stage.
    ///
    /// # Errors
    ///
    /// Returns `SwarmError::InvalidPolicy` for the first illegal value found.
    pub fn validate(&self) -> Result<(), SwarmError> {
        if let Some(retry) = self.retry() {
            retry.validate()?;
        }
        if self.timeout() == Some(Duration::ZERO) {
            return Err(SwarmError::invalid_policy("timeout", "timeout must be non-zero"));
        }
        match self {
            StageConfig::Transform(stage) => stage.quality.validate(),
            StageConfig::Gate(stage) if !stage.schema.is_object() => Err(
                SwarmError::invalid_policy("gate", "schema must be a JSON object"),
            ),
            _ => Ok(()),
        }
    }

    /// One-line description used by plan listings.
    pub fn summary(&self) -> String {
        let label = match self.name() {
            Some(name) => format!("{} '{}'", self.kind(), name),
            None => self.kind().to_string(),
        };
        match self {
            StageConfig::Transform(stage) => match &stage.quality {
                QualityPolicy::Plain => label,
                QualityPolicy::Verify(policy) => {
                    format!("{label} (verify, {} attempts)", policy.max_attempts)
                }
                QualityPolicy::BestOf(policy) => format!("{label} (best of {})", policy.n),
            },
            StageConfig::Gate(stage) => format!("{label} (emit {})", stage.emit.as_str()),
            StageConfig::Synthesis(_) => label,
        }
    }
}

impl From<TransformStage> for StageConfig {
    fn from(stage: TransformStage) -> Self {
        StageConfig::Transform(stage)
    }
}

impl From<GateStage> for StageConfig {
    fn from(stage: GateStage) -> Self {
        StageConfig::Gate(stage)
    }
}

impl From<SynthesisStage> for StageConfig {
    fn from(stage: SynthesisStage) -> Self {
        StageConfig::Synthesis(stage)
    }
}

/// Per-item results of a stage, bucketed by status, each in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub success: Vec<TaskResult>,
    pub filtered: Vec<TaskResult>,
    pub error: Vec<TaskResult>,
}

impl StageOutput {
    /// Buckets `results`, which must be in input order.
    pub fn from_results(results: impl IntoIterator<Item = TaskResult>) -> Self {
        let mut output = Self::default();
        for result in results {
            output.push(result);
        }
        output
    }

    pub fn push(&mut self, result: TaskResult) {
        match result.status {
            TaskStatus::Success => self.success.push(result),
            TaskStatus::Filtered => self.filtered.push(result),
            TaskStatus::Error => self.error.push(result),
        }
    }

    pub fn len(&self) -> usize {
        self.success.len() + self.filtered.len() + self.error.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every result, ordered by item index.
    pub fn in_input_order(&self) -> Vec<&TaskResult> {
        let mut all: Vec<&TaskResult> = self
            .success
            .iter()
            .chain(&self.filtered)
            .chain(&self.error)
            .collect();
        all.sort_by_key(|result| result.meta.item_index);
        all
    }
}

/// Aggregated outcome of one stage.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub kind: StageKind,
    pub index: usize,
    pub name: Option<String>,
    pub duration: Duration,
    pub output: StageOutput,
    /// Items handed to the next stage, in input order.
    pub forwarded: Vec<Item>,
}

impl StageResult {
    pub fn success_count(&self) -> usize {
        self.output.success.len()
    }

    pub fn error_count(&self) -> usize {
        self.output.error.len()
    }

    pub fn filtered_count(&self) -> usize {
        self.output.filtered.len()
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}
