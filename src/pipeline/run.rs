//! Outcome of a pipeline run.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::error::SwarmError;
use crate::stage::{StageOutput, StageResult};
use crate::task::Item;

/// Every stage that ran, in order, plus the final output.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    run_id: Uuid,
    tag: Option<String>,
    started_at: DateTime<Utc>,
    duration: Duration,
    stages: Vec<StageResult>,
}

impl PipelineRun {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&StageResult> {
        self.stages.get(index)
    }

    pub fn into_stages(self) -> Vec<StageResult> {
        self.stages
    }

    /// Aggregated output of the last stage.
    pub fn output(&self) -> Option<&StageOutput> {
        self.stages.last().map(|stage| &stage.output)
    }

    /// Items the last stage would hand to a successor.
    pub fn forwarded(&self) -> &[Item] {
        self.stages
            .last()
            .map(|stage| stage.forwarded.as_slice())
            .unwrap_or_default()
    }

    /// Error count summed over every stage.
    pub fn total_errors(&self) -> usize {
        self.stages.iter().map(StageResult::error_count).sum()
    }
}

/// Accumulates stage results while a pipeline runs.
#[derive(Debug)]
pub(crate) struct PipelineRunBuilder {
    run_id: Uuid,
    tag: Option<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    stages: Vec<StageResult>,
}

impl PipelineRunBuilder {
    pub(crate) fn new(tag: Option<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            tag,
            started_at: Utc::now(),
            started: Instant::now(),
            stages: Vec::new(),
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub(crate) fn push(&mut self, stage: StageResult) {
        self.stages.push(stage);
    }

    pub(crate) fn finish(self) -> PipelineRun {
        PipelineRun {
            run_id: self.run_id,
            tag: self.tag,
            started_at: self.started_at,
            duration: self.started.elapsed(),
            stages: self.stages,
        }
    }
}

/// A run aborted by an infrastructure error.
///
/// `partial` holds every stage that started, the aborted one included with
/// the items that settled before the abort.
#[derive(Debug, Error)]
#[error("Pipeline run {run_id} aborted at stage {stage_index}: {error}", run_id = .partial.run_id)]
pub struct PipelineFailure {
    #[source]
    pub error: SwarmError,
    pub stage_index: usize,
    pub partial: PipelineRun,
}
