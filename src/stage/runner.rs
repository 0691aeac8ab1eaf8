//! Executes one stage against an engine.
//!
//! Items of a stage are fanned out together and resolved under the engine's
//! scheduler; the runner returns only once every item has settled. Item
//! failures land in the error bucket. An infrastructure failure (the
//! scheduler closing) still lets every started item settle, then aborts the
//! stage with whatever completed.

use std::time::Instant;

use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use super::chain::{combine_items, forward_gate, forward_transform};
use super::{GateStage, StageConfig, StageOutput, StageResult, SynthesisStage, TransformStage};
use crate::engine::Engine;
use crate::error::SwarmError;
use crate::events::EngineEvent;
use crate::executor::ExecutionRequest;
use crate::quality::{
    feedback_prompt, judge_context, judge_schema, run_tournament, run_verify_loop,
    verifier_context, QualityPolicy,
};
use crate::retry::{run_with_retry, ItemContext, RetryPolicy};
use crate::task::{Item, TaskMeta, TaskResult, TaskRole, TaskStatus};

/// Identity of the pipeline run a stage belongs to.
#[derive(Debug, Clone)]
pub(crate) struct RunContext {
    pub run_id: Uuid,
    pub tag: Option<String>,
}

impl RunContext {
    fn meta(&self, stage_index: usize, item_index: usize) -> TaskMeta {
        TaskMeta::new(self.run_id, stage_index, item_index).with_tag(self.tag.clone())
    }
}

/// A stage aborted by an infrastructure error.
#[derive(Debug)]
pub struct StageFailure {
    pub error: SwarmError,
    /// Accounting of the items that did settle.
    pub partial: StageResult,
}

/// Runs `stage` as stage `index` of a run over `items`.
pub(crate) async fn run_stage(
    engine: &Engine,
    run: &RunContext,
    stage: &StageConfig,
    index: usize,
    items: &[Item],
) -> Result<StageResult, StageFailure> {
    let kind = stage.kind();
    let name = stage.name().map(str::to_string);

    engine
        .events()
        .emit(EngineEvent::stage_start(kind, index, name.clone(), items.len()));
    let started = Instant::now();

    let settled = match stage {
        StageConfig::Transform(transform) => {
            join_all(items.iter().enumerate().map(|(item_index, item)| {
                run_transform_item(engine, run, transform, index, item_index, item)
            }))
            .await
        }
        StageConfig::Gate(gate) => {
            join_all(
                items
                    .iter()
                    .enumerate()
                    .map(|(item_index, item)| run_gate_item(engine, run, gate, index, item_index, item)),
            )
            .await
        }
        StageConfig::Synthesis(synthesis) => {
            vec![run_synthesis(engine, run, synthesis, index, items).await]
        }
    };

    let mut results = Vec::with_capacity(settled.len());
    let mut failure = None;
    for outcome in settled {
        match outcome {
            Ok(result) => results.push(result),
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }

    // Forwarding can move individual results to the error bucket, so it runs
    // before the accounting is frozen.
    let forwarded = match (&failure, stage) {
        (Some(_), _) | (None, StageConfig::Synthesis(_)) => Vec::new(),
        (None, StageConfig::Transform(_)) => forward_transform(&mut results, index),
        (None, StageConfig::Gate(gate)) => forward_gate(items, &mut results, gate.emit, index),
    };

    let result = StageResult {
        kind,
        index,
        name,
        duration: started.elapsed(),
        output: StageOutput::from_results(results),
        forwarded,
    };

    if let Some(error) = failure {
        debug!(
            stage_index = index,
            settled = result.output.len(),
            "Partial stage result kept after abort"
        );
        engine.events().emit(EngineEvent::stage_error(
            kind,
            index,
            result.name.clone(),
            error.to_string(),
        ));
        return Err(StageFailure {
            error,
            partial: result,
        });
    }

    debug!(
        stage_index = index,
        forwarded = result.forwarded.len(),
        "Stage output forwarded"
    );
    engine.events().emit(EngineEvent::stage_complete(&result));
    Ok(result)
}

/// Error result for a quality call whose input could not be assembled.
fn context_failure(role: TaskRole, meta: TaskMeta, error: SwarmError) -> TaskResult {
    TaskResult::error(format!("failed to build {role} context: {error}"))
        .with_meta(meta.with_role(role))
}

fn retry_policy(engine: &Engine, stage_retry: Option<&RetryPolicy>) -> RetryPolicy {
    stage_retry
        .cloned()
        .unwrap_or_else(|| engine.config().default_retry.clone())
}

async fn run_transform_item(
    engine: &Engine,
    run: &RunContext,
    stage: &TransformStage,
    stage_index: usize,
    item_index: usize,
    item: &Item,
) -> Result<TaskResult, SwarmError> {
    let ctx = ItemContext::new(engine.events(), stage_index, item_index);
    let retry = retry_policy(engine, stage.retry.as_ref());
    let retry = &retry;
    let meta = run.meta(stage_index, item_index);
    let prompt = stage.prompt.render(item, item_index);
    let worker = ExecutionRequest::new(prompt.clone(), TaskRole::Worker, meta.clone())
        .with_schema(stage.schema.clone())
        .with_timeout(stage.timeout);

    match &stage.quality {
        QualityPolicy::Plain => {
            run_with_retry(retry, ctx, |_| engine.execute(item.clone(), worker.clone())).await
        }
        QualityPolicy::Verify(policy) => {
            debug!(stage_index, item_index, max_attempts = policy.max_attempts, "Starting verify loop");
            let worker = &worker;
            let meta = &meta;
            run_verify_loop(
                ctx,
                policy.max_attempts,
                |feedback, attempt| {
                    let mut request = worker.clone();
                    request.meta.attempts = Some(attempt);
                    if let Some(reasoning) = feedback {
                        request = request.append_prompt(&feedback_prompt(&reasoning));
                    }
                    async move {
                        run_with_retry(retry, ctx, |_| engine.execute(item.clone(), request.clone()))
                            .await
                    }
                },
                |output, attempt| async move {
                    let meta = meta.clone().with_attempts(attempt);
                    let context = match verifier_context(item, &output) {
                        Ok(context) => context,
                        Err(e) => return Ok(context_failure(TaskRole::Verifier, meta, e)),
                    };
                    let request = ExecutionRequest::new(policy.prompt.clone(), TaskRole::Verifier, meta)
                    .with_schema(Some(policy.verdict_schema()))
                    .with_timeout(stage.timeout);
                    engine.execute(context, request).await
                },
            )
            .await
        }
        QualityPolicy::BestOf(policy) => {
            debug!(stage_index, item_index, candidates = policy.n, "Starting best-of tournament");
            let prompt = &prompt;
            let meta = &meta;
            run_tournament(
                ctx,
                policy.n,
                |candidate_index| {
                    let mut request = ExecutionRequest::new(
                        prompt.clone(),
                        TaskRole::Candidate,
                        meta.clone().with_candidate(candidate_index),
                    )
                    .with_schema(stage.schema.clone())
                    .with_timeout(stage.timeout);
                    if let Some(candidate) = policy.candidate(candidate_index) {
                        if let Some(suffix) = &candidate.prompt_suffix {
                            request = request.append_prompt(suffix);
                        }
                        if candidate.model.is_some() {
                            request = request.with_model(candidate.model.clone());
                        }
                        for (key, value) in &candidate.params {
                            request = request.with_param(key.clone(), value.clone());
                        }
                    }
                    async move {
                        run_with_retry(retry, ctx, |_| engine.execute(item.clone(), request.clone()))
                            .await
                    }
                },
                |candidates| async move {
                    let context = match judge_context(item, &candidates) {
                        Ok(context) => context,
                        Err(e) => return Ok(context_failure(TaskRole::Judge, meta.clone(), e)),
                    };
                    let request =
                        ExecutionRequest::new(policy.judge_prompt.clone(), TaskRole::Judge, meta.clone())
                            .with_schema(Some(judge_schema()))
                            .with_timeout(stage.timeout);
                    engine.execute(context, request).await
                },
            )
            .await
        }
    }
}

async fn run_gate_item(
    engine: &Engine,
    run: &RunContext,
    stage: &GateStage,
    stage_index: usize,
    item_index: usize,
    item: &Item,
) -> Result<TaskResult, SwarmError> {
    let ctx = ItemContext::new(engine.events(), stage_index, item_index);
    let retry = retry_policy(engine, stage.retry.as_ref());
    let request = ExecutionRequest::new(
        stage.prompt.render(item, item_index),
        TaskRole::Gate,
        run.meta(stage_index, item_index),
    )
    .with_schema(Some(stage.schema.clone()))
    .with_timeout(stage.timeout);

    run_with_retry(&retry, ctx, |_| {
        let request = request.clone();
        async move {
            let result = engine.execute(item.clone(), request).await?;
            Ok::<_, SwarmError>(classify_gate_output(stage, result))
        }
    })
    .await
}

/// Applies the gate predicate to a successful gate call.
fn classify_gate_output(stage: &GateStage, mut result: TaskResult) -> TaskResult {
    if !result.is_success() {
        return result;
    }
    match result.structured_output() {
        Some(data) => {
            result.status = stage.classify(&data);
            result.data = Some(data);
        }
        None => {
            result.status = TaskStatus::Error;
            result.error = Some("gate call returned no structured output".to_string());
        }
    }
    result
}

async fn run_synthesis(
    engine: &Engine,
    run: &RunContext,
    stage: &SynthesisStage,
    stage_index: usize,
    items: &[Item],
) -> Result<TaskResult, SwarmError> {
    let meta = run.meta(stage_index, 0);
    if items.is_empty() {
        warn!(stage_index, "Synthesis stage received no items, skipping executor call");
        return Ok(TaskResult::error("no items to synthesize")
            .with_meta(meta.with_role(TaskRole::Synthesis)));
    }

    let combined = combine_items(items);
    let request = ExecutionRequest::new(
        stage.prompt.render(&combined, 0),
        TaskRole::Synthesis,
        meta,
    )
    .with_schema(stage.schema.clone())
    .with_timeout(stage.timeout);
    let retry = retry_policy(engine, stage.retry.as_ref());

    debug!(stage_index, items = items.len(), bytes = combined.total_bytes(), "Synthesizing");
    run_with_retry(
        &retry,
        ItemContext::new(engine.events(), stage_index, 0),
        |_| engine.execute(combined.clone(), request.clone()),
    )
    .await
}
