//! Integration tests for the orchestration engine.
//!
//! Every test drives a real `Engine` against a scripted in-memory executor
//! that records when each call started and finished.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agent_swarm::events::EventLog;
use agent_swarm::executor::{ExecutionRequest, ExecutorError, TaskExecutor};
use agent_swarm::quality::{BestOfPolicy, VerifyPolicy, CANDIDATES_MANIFEST};
use agent_swarm::{
    Emit, Engine, EngineConfig, GateStage, Item, Pipeline, PipelineDefinition, RetryPolicy,
    SwarmError, SynthesisStage, TaskResult, TaskRole, TaskStatus, TransformStage,
};
use async_trait::async_trait;
use serde_json::{json, Value};

type Script =
    Arc<dyn Fn(&Item, &ExecutionRequest) -> (Duration, Result<TaskResult, ExecutorError>) + Send + Sync>;

#[derive(Debug, Clone)]
struct Call {
    role: TaskRole,
    stage_index: usize,
    item_index: usize,
    candidate_index: Option<usize>,
    item: Item,
    started: Instant,
    finished: Instant,
}

#[derive(Clone)]
struct ScriptedExecutor {
    script: Script,
    calls: Arc<Mutex<Vec<Call>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    fn new<F>(script: F) -> Self
    where
        F: Fn(&Item, &ExecutionRequest) -> (Duration, Result<TaskResult, ExecutorError>)
            + Send
            + Sync
            + 'static,
    {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("call log").clone()
    }

    fn calls_with_role(&self, role: TaskRole) -> Vec<Call> {
        self.calls().into_iter().filter(|call| call.role == role).collect()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        item: Item,
        request: ExecutionRequest,
    ) -> Result<TaskResult, ExecutorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let started = Instant::now();

        let (delay, outcome) = (self.script)(&item, &request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().expect("call log").push(Call {
            role: request.role,
            stage_index: request.meta.stage_index,
            item_index: request.meta.item_index,
            candidate_index: request.meta.candidate_index,
            item,
            started,
            finished: Instant::now(),
        });
        outcome
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn engine(executor: &ScriptedExecutor, concurrency: usize) -> Engine {
    let config = EngineConfig::new()
        .with_concurrency(concurrency)
        .with_retry(RetryPolicy::none());
    Engine::new(config, executor.clone()).expect("engine")
}

fn items(contents: &[&str]) -> Vec<Item> {
    contents
        .iter()
        .map(|content| Item::single("doc.txt", *content))
        .collect()
}

fn ok(data: Value) -> (Duration, Result<TaskResult, ExecutorError>) {
    (Duration::ZERO, Ok(TaskResult::success(data)))
}

fn score_of(item: &Item) -> i64 {
    item.get_str("doc.txt")
        .and_then(|text| text.strip_prefix("score:"))
        .and_then(|score| score.parse().ok())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_concurrency_bound_covers_sub_tasks() {
    let executor = ScriptedExecutor::new(|_, request| {
        let data = match request.role {
            TaskRole::Verifier => json!({"passed": true, "reasoning": "fine"}),
            TaskRole::Judge => json!({"winner": 1, "reasoning": "second is best"}),
            _ => json!({"text": "draft"}),
        };
        (Duration::from_millis(15), Ok(TaskResult::success(data)))
    });
    let engine = engine(&executor, 2);

    let pipeline = Pipeline::new()
        .then(TransformStage::new("draft").with_verify(VerifyPolicy::new("check")))
        .and_then(|p| p.then(TransformStage::new("polish").with_best_of(BestOfPolicy::new(3, "pick"))))
        .expect("valid");

    let run = engine
        .run(&pipeline, items(&["a", "b", "c", "d", "e"]))
        .await
        .expect("run");

    assert_eq!(run.stages()[0].success_count(), 5);
    assert_eq!(run.stages()[1].success_count(), 5);
    assert!(executor.peak() <= 2, "peak in flight was {}", executor.peak());
    assert_eq!(engine.scheduler_stats().peak_in_flight, 2);

    // 5 workers + 5 verifiers + 5 * 3 candidates + 5 judges
    assert_eq!(executor.calls().len(), 30);
    assert_eq!(engine.scheduler_stats().total_admitted, 30);
    assert_eq!(engine.scheduler_stats().in_flight, 0);
}

#[tokio::test]
async fn test_judge_starts_after_slowest_candidate() {
    let executor = ScriptedExecutor::new(|_, request| match request.role {
        TaskRole::Candidate => {
            let delay = match request.meta.candidate_index {
                Some(2) => 80,
                Some(1) => 30,
                _ => 5,
            };
            (
                Duration::from_millis(delay),
                Ok(TaskResult::success(json!({"candidate": request.meta.candidate_index}))),
            )
        }
        _ => ok(json!({"winner": 2, "reasoning": "slow but careful"})),
    });
    let engine = engine(&executor, 8);
    let log = EventLog::new();
    engine.on(log.clone());

    let stage = engine
        .map(
            items(&["only"]),
            TransformStage::new("solve").with_best_of(BestOfPolicy::new(3, "pick")),
        )
        .await
        .expect("stage");

    let candidates = executor.calls_with_role(TaskRole::Candidate);
    let judges = executor.calls_with_role(TaskRole::Judge);
    assert_eq!(candidates.len(), 3);
    assert_eq!(judges.len(), 1);

    let slowest_settled = candidates
        .iter()
        .map(|call| call.finished)
        .max()
        .expect("candidates");
    assert!(judges[0].started >= slowest_settled);

    let winner = &stage.output.success[0];
    let best_of = winner.best_of.as_ref().expect("best-of audit");
    assert_eq!(best_of.winner_index, 2);
    assert_eq!(best_of.candidates.len(), 3);
    assert_eq!(winner.data, Some(json!({"candidate": 2})));

    assert_eq!(log.count("candidateComplete"), 3);
    assert_eq!(log.count("judgeComplete"), 1);
}

#[tokio::test]
async fn test_stage_barrier() {
    let executor = ScriptedExecutor::new(|_, request| {
        let delay = if request.meta.stage_index == 0 && request.meta.item_index == 3 {
            60
        } else {
            5
        };
        (
            Duration::from_millis(delay),
            Ok(TaskResult::success(json!({"stage": request.meta.stage_index}))),
        )
    });
    let engine = engine(&executor, 8);

    let pipeline = Pipeline::new()
        .then(TransformStage::new("first"))
        .and_then(|p| p.then(TransformStage::new("second")))
        .expect("valid");
    let run = engine
        .run(&pipeline, items(&["a", "b", "c", "d"]))
        .await
        .expect("run");

    let calls = executor.calls();
    let last_stage0_end = calls
        .iter()
        .filter(|call| call.stage_index == 0)
        .map(|call| call.finished)
        .max()
        .expect("stage 0 calls");
    let first_stage1_start = calls
        .iter()
        .filter(|call| call.stage_index == 1)
        .map(|call| call.started)
        .min()
        .expect("stage 1 calls");
    assert!(first_stage1_start >= last_stage0_end);

    // Stage 1 sees stage 0's structured output under its chained name.
    let stage1_inputs: Vec<Item> = calls
        .iter()
        .filter(|call| call.stage_index == 1)
        .map(|call| call.item.clone())
        .collect();
    assert_eq!(stage1_inputs.len(), 4);
    assert!(stage1_inputs
        .iter()
        .all(|item| item.contains("stage-0.result.json") && !item.contains("result.json")));
    assert_eq!(run.stages()[1].success_count(), 4);
}

#[tokio::test]
async fn test_gate_emit_filtered_forwards_rejected_inputs_unchanged() {
    let executor = ScriptedExecutor::new(|item, _| ok(json!({"score": score_of(item)})));
    let engine = engine(&executor, 4);

    let inputs = items(&["score:5", "score:9", "score:8"]);
    let gate = GateStage::new(
        "Rate the document",
        json!({"type": "object", "properties": {"score": {"type": "integer"}}}),
        |data: &Value| data["score"].as_i64().is_some_and(|score| score >= 8),
    )
    .with_emit(Emit::Filtered);

    let stage = engine.filter(inputs.clone(), gate).await.expect("stage");

    assert_eq!(stage.success_count(), 2);
    assert_eq!(stage.filtered_count(), 1);
    assert_eq!(stage.error_count(), 0);
    assert_eq!(stage.forwarded.len(), 1);

    let forwarded = &stage.forwarded[0];
    assert_eq!(forwarded.get_str("doc.txt"), Some("score:5"));
    assert!(forwarded.contains("stage-0.result.json"));

    // The gate saw the inputs as submitted.
    let mut seen: Vec<Item> = executor
        .calls_with_role(TaskRole::Gate)
        .into_iter()
        .map(|call| call.item)
        .collect();
    seen.sort_by_key(score_of);
    let mut expected = inputs;
    expected.sort_by_key(score_of);
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_retry_bound() {
    let executor = ScriptedExecutor::new(|_, _| {
        (Duration::ZERO, Err(ExecutorError::Failed("sandbox crashed".to_string())))
    });
    let engine = engine(&executor, 2);
    let log = EventLog::new();
    engine.on(log.clone());

    let stage = engine
        .map(
            items(&["x"]),
            TransformStage::new("work").with_retry(RetryPolicy::new(3).with_backoff_ms(0)),
        )
        .await
        .expect("stage");

    assert_eq!(executor.calls().len(), 3);
    assert_eq!(log.count("itemRetry"), 2);
    assert_eq!(stage.error_count(), 1);

    let result = &stage.output.error[0];
    assert_eq!(result.meta.attempts, Some(3));
    assert!(result.failure_reason().contains("sandbox crashed"));
}

#[tokio::test]
async fn test_flaky_item_recovers_on_second_attempt() {
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let executor = ScriptedExecutor::new(move |_, request| {
        if request.meta.item_index == 1 && counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return (Duration::ZERO, Ok(TaskResult::error("transient")));
        }
        ok(json!({"item": request.meta.item_index}))
    });
    let engine = engine(&executor, 4);
    let log = EventLog::new();
    engine.on(log.clone());

    let stage = engine
        .map(
            items(&["a", "b", "c"]),
            TransformStage::new("work").with_retry(RetryPolicy::new(2).with_backoff_ms(0)),
        )
        .await
        .expect("stage");

    assert_eq!(stage.success_count(), 3);
    assert_eq!(stage.error_count(), 0);
    assert_eq!(log.count("itemRetry"), 1);
    assert_eq!(executor.calls().len(), 4);

    let ordered = stage.output.in_input_order();
    assert_eq!(ordered[1].meta.attempts, Some(2));
    assert_eq!(ordered[0].meta.attempts, Some(1));
}

#[tokio::test]
async fn test_best_of_with_every_candidate_failing_still_judges_once() {
    let executor = ScriptedExecutor::new(|_, request| match request.role {
        TaskRole::Candidate => (
            Duration::ZERO,
            Err(ExecutorError::Failed("candidate crashed".to_string())),
        ),
        _ => ok(json!({"winner": 0, "reasoning": "nothing usable"})),
    });
    let engine = engine(&executor, 4);

    let stage = engine
        .map(
            items(&["x"]),
            TransformStage::new("solve").with_best_of(BestOfPolicy::new(3, "pick")),
        )
        .await
        .expect("stage");

    let judges = executor.calls_with_role(TaskRole::Judge);
    assert_eq!(judges.len(), 1);

    let manifest: Vec<Value> = serde_json::from_slice(
        judges[0].item.get(CANDIDATES_MANIFEST).expect("candidate manifest"),
    )
    .expect("manifest json");
    assert_eq!(manifest.len(), 3);
    assert!(manifest.iter().all(|entry| entry["status"] == "error"));
    assert_eq!(judges[0].item.get_str("input/doc.txt"), Some("x"));

    assert_eq!(stage.error_count(), 1);
    let result = &stage.output.error[0];
    assert_eq!(result.status, TaskStatus::Error);
    assert_eq!(result.best_of.as_ref().map(|b| b.candidates.len()), Some(3));
}

#[tokio::test]
async fn test_verify_loop_feeds_back_and_reruns() {
    let verifications = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&verifications);
    let executor = ScriptedExecutor::new(move |_, request| match request.role {
        TaskRole::Verifier => {
            let passed = counter.fetch_add(1, Ordering::SeqCst) > 0;
            ok(json!({"passed": passed, "reasoning": "cite your sources"}))
        }
        _ => ok(json!({"has_feedback": request.prompt.contains("cite your sources")})),
    });
    let engine = engine(&executor, 2);

    let stage = engine
        .map(
            items(&["doc"]),
            TransformStage::new("write").with_verify(VerifyPolicy::new("check").with_max_attempts(3)),
        )
        .await
        .expect("stage");

    assert_eq!(stage.success_count(), 1);
    let result = &stage.output.success[0];
    assert_eq!(result.data, Some(json!({"has_feedback": true})));
    let verify = result.verify.as_ref().expect("verify audit");
    assert!(verify.passed);
    assert_eq!(verify.attempts, 2);

    assert_eq!(executor.calls_with_role(TaskRole::Worker).len(), 2);
    assert_eq!(executor.calls_with_role(TaskRole::Verifier).len(), 2);

    // The verifier sees the input and the worker output side by side.
    let verifier_input = &executor.calls_with_role(TaskRole::Verifier)[0].item;
    assert_eq!(verifier_input.get_str("input/doc.txt"), Some("doc"));
    assert!(verifier_input.contains("output/result.json"));
}

#[tokio::test]
async fn test_synthesis_combines_survivors() {
    let executor = ScriptedExecutor::new(|item, request| match request.role {
        TaskRole::Gate => ok(json!({"score": score_of(item)})),
        TaskRole::Synthesis => ok(json!({"inputs": item.paths().count()})),
        _ => ok(json!({})),
    });
    let engine = engine(&executor, 4);

    let pipeline = Pipeline::new()
        .filter(GateStage::new("rate", json!({"type": "object"}), |data: &Value| {
            data["score"].as_i64() >= Some(8)
        }))
        .and_then(|p| p.reduce(SynthesisStage::new("merge")))
        .expect("valid");

    let run = engine
        .run(&pipeline, items(&["score:5", "score:9", "score:8"]))
        .await
        .expect("run");

    let synthesis = executor.calls_with_role(TaskRole::Synthesis);
    assert_eq!(synthesis.len(), 1);
    let combined = &synthesis[0].item;
    assert!(combined.contains("item_0/doc.txt"));
    assert!(combined.contains("item_1/doc.txt"));
    assert!(!combined.contains("item_2/doc.txt"));

    let output = run.output().expect("output");
    assert_eq!(output.success.len(), 1);
}

#[tokio::test]
async fn test_empty_synthesis_makes_no_call() {
    let executor = ScriptedExecutor::new(|_, _| ok(json!({})));
    let engine = engine(&executor, 2);

    let result = engine
        .reduce(Vec::new(), SynthesisStage::new("merge"))
        .await
        .expect("reduce");

    assert!(result.is_error());
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_stage_after_synthesis_fails_before_any_call() {
    let executor = ScriptedExecutor::new(|_, _| ok(json!({})));
    let _engine = engine(&executor, 2);

    let err = Pipeline::new()
        .then(SynthesisStage::new("merge"))
        .and_then(|p| p.then(TransformStage::new("late")))
        .expect_err("terminal");

    assert!(matches!(err, SwarmError::TerminalStage { .. }));
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_shutdown_aborts_with_partial_run() {
    let executor = ScriptedExecutor::new(|_, _| {
        (Duration::from_millis(60), Ok(TaskResult::success(json!({"done": true}))))
    });
    let engine = engine(&executor, 1);
    let log = EventLog::new();
    engine.on(log.clone());

    let pipeline = Pipeline::new()
        .then(TransformStage::new("first"))
        .and_then(|p| p.then(TransformStage::new("second")))
        .expect("valid");

    let closer = engine.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.shutdown();
    });

    let failure = engine
        .run(&pipeline, items(&["a", "b", "c"]))
        .await
        .expect_err("aborted");

    assert!(matches!(failure.error, SwarmError::SchedulerClosed));
    assert_eq!(failure.stage_index, 0);
    assert_eq!(failure.partial.stages().len(), 1);

    // The call already holding the only slot was allowed to finish.
    assert_eq!(executor.calls().len(), 1);
    assert_eq!(failure.partial.stages()[0].success_count(), 1);
    assert_eq!(log.count("stageError"), 1);
    assert_eq!(log.count("stageComplete"), 0);
}

#[tokio::test]
async fn test_definition_file_runs_end_to_end() {
    let yaml = r#"
name: triage
stages:
  - type: gate
    prompt: Rate the document.
    schema: { type: object }
    conditions:
      - { field: score, op: gte, value: 8 }
  - type: transform
    name: summarize
    prompt: Summarize.
"#;
    let pipeline = PipelineDefinition::from_yaml_str(yaml)
        .and_then(PipelineDefinition::into_pipeline)
        .expect("definition");

    let executor = ScriptedExecutor::new(|item, request| match request.role {
        TaskRole::Gate => ok(json!({"score": score_of(item)})),
        _ => ok(json!({"summary": "short"})),
    });
    let engine = engine(&executor, 3);

    let run = engine
        .run(&pipeline, items(&["score:9", "score:2"]))
        .await
        .expect("run");

    assert_eq!(run.stages().len(), 2);
    assert_eq!(run.stages()[0].filtered_count(), 1);
    assert_eq!(run.stages()[1].success_count(), 1);
    assert_eq!(run.total_errors(), 0);
    assert_eq!(executor.calls_with_role(TaskRole::Worker).len(), 1);
}

#[tokio::test]
async fn test_filtered_outside_gate_becomes_error() {
    let executor = ScriptedExecutor::new(|_, _| {
        (
            Duration::ZERO,
            Ok(TaskResult {
                status: TaskStatus::Filtered,
                ..TaskResult::success(json!({"score": 1}))
            }),
        )
    });
    let engine = engine(&executor, 2);

    let stage = engine
        .map(items(&["a", "b"]), TransformStage::new("work"))
        .await
        .expect("stage");
    assert_eq!(stage.filtered_count(), 0);
    assert_eq!(stage.success_count(), 0);
    assert_eq!(stage.error_count(), 2);
    assert!(stage.forwarded.is_empty());

    let merged = engine
        .reduce(items(&["a"]), SynthesisStage::new("merge"))
        .await
        .expect("reduce");
    assert_eq!(merged.status, TaskStatus::Error);
}
