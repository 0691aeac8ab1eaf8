//! Linear pipelines of stages.
//!
//! # Pipeline Flow
//!
//! 1. **Build**: stages are appended with [`Pipeline::then`]; policies are
//!    validated and nothing may follow a synthesis stage
//! 2. **Run**: stages execute in order with a full barrier between them;
//!    stage `k + 1` starts only once every item of stage `k` has settled
//! 3. **Chain**: each stage's forwarded items become the next stage's input
//! 4. **Report**: a [`PipelineRun`] with one `StageResult` per stage, or a
//!    [`PipelineFailure`] carrying the partial run
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_swarm::pipeline::Pipeline;
//! use agent_swarm::stage::{Emit, GateStage, SynthesisStage, TransformStage};
//!
//! let pipeline = Pipeline::new()
//!     .then(TransformStage::new("Summarize the document"))?
//!     .then(GateStage::new("Rate the summary", schema, |d| d["score"].as_i64() >= Some(8)))?
//!     .then(SynthesisStage::new("Merge the best summaries"))?;
//!
//! let run = pipeline.run(&engine, items).await?;
//! println!("{} stages, {} errors", run.stages().len(), run.total_errors());
//! ```

mod run;

pub use run::{PipelineFailure, PipelineRun};

use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::SwarmError;
use crate::stage::runner::{run_stage, RunContext};
use crate::stage::{GateStage, StageConfig, SynthesisStage, TransformStage};
use crate::task::Item;
use run::PipelineRunBuilder;

/// An ordered, append-only list of stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<StageConfig>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns `SwarmError::TerminalStage` when the pipeline already ends
    /// with a synthesis stage, or `SwarmError::InvalidPolicy` when the stage
    /// carries an illegal policy.
    pub fn then(mut self, stage: impl Into<StageConfig>) -> Result<Self, SwarmError> {
        let stage = stage.into();
        if self.stages.last().is_some_and(StageConfig::is_terminal) {
            return Err(SwarmError::TerminalStage { kind: stage.kind() });
        }
        stage.validate()?;
        self.stages.push(stage);
        Ok(self)
    }

    /// Appends a transform stage.
    pub fn map(self, stage: TransformStage) -> Result<Self, SwarmError> {
        self.then(stage)
    }

    /// Appends a gate stage.
    pub fn filter(self, stage: GateStage) -> Result<Self, SwarmError> {
        self.then(stage)
    }

    /// Appends the terminal synthesis stage.
    pub fn reduce(self, stage: SynthesisStage) -> Result<Self, SwarmError> {
        self.then(stage)
    }

    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// One line per stage, e.g. `0: transform 'draft' (verify, 3 attempts)`.
    pub fn describe(&self) -> Vec<String> {
        self.stages
            .iter()
            .enumerate()
            .map(|(index, stage)| format!("{index}: {}", stage.summary()))
            .collect()
    }

    /// Runs every stage over `items`.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineFailure`] when an infrastructure error aborts a
    /// stage; no later stage is started.
    pub async fn run(
        &self,
        engine: &Engine,
        items: Vec<Item>,
    ) -> Result<PipelineRun, PipelineFailure> {
        let mut builder = PipelineRunBuilder::new(engine.config().tag.clone());
        let context = RunContext {
            run_id: builder.run_id(),
            tag: engine.config().tag.clone(),
        };

        info!(
            run_id = %context.run_id,
            stages = self.stages.len(),
            items = items.len(),
            "Starting pipeline run"
        );

        let mut current = items;
        for (index, stage) in self.stages.iter().enumerate() {
            match run_stage(engine, &context, stage, index, &current).await {
                Ok(result) => {
                    current = result.forwarded.clone();
                    builder.push(result);
                }
                Err(failure) => {
                    warn!(
                        run_id = %context.run_id,
                        stage_index = index,
                        error = %failure.error,
                        "Pipeline run aborted"
                    );
                    builder.push(failure.partial);
                    return Err(PipelineFailure {
                        error: failure.error,
                        stage_index: index,
                        partial: builder.finish(),
                    });
                }
            }
        }

        let run = builder.finish();
        info!(
            run_id = %run.run_id(),
            duration_ms = run.duration().as_millis() as u64,
            errors = run.total_errors(),
            "Pipeline run complete"
        );
        Ok(run)
    }
}
