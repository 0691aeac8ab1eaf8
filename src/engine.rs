//! The orchestration engine.
//!
//! An [`Engine`] owns the three pieces of shared state a run needs: the
//! executor, the bounded scheduler that admits every executor call, and the
//! event bus. Engines are independent; two engines in one process have two
//! separate concurrency budgets.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info};

use crate::config::{ConfigError, EngineConfig};
use crate::error::SwarmError;
use crate::events::{EventBus, EventHandler, TracingEventHandler};
use crate::executor::{ExecutionRequest, ExecutorError, TaskExecutor};
use crate::metrics::MetricsCollector;
use crate::pipeline::{Pipeline, PipelineFailure, PipelineRun};
use crate::scheduler::{BoundedScheduler, SchedulerStats};
use crate::stage::{GateStage, StageResult, SynthesisStage, TransformStage};
use crate::task::{Item, TaskResult, TaskRole, TaskStatus};

/// Runs stages and pipelines against one executor under one budget.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    executor: Arc<dyn TaskExecutor>,
    scheduler: BoundedScheduler,
    events: EventBus,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("executor", &self.executor.name())
            .field("scheduler", &self.scheduler)
            .field("events", &self.events)
            .finish()
    }
}

impl Engine {
    /// Creates an engine.
    ///
    /// A [`TracingEventHandler`] and a [`MetricsCollector`] are subscribed
    /// to the event bus. The collector records nothing until
    /// `metrics::init_metrics` has been called.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `config` fails validation.
    pub fn new<E>(config: EngineConfig, executor: E) -> Result<Self, ConfigError>
    where
        E: TaskExecutor + 'static,
    {
        Self::with_shared_executor(config, Arc::new(executor))
    }

    /// Creates an engine around an executor that is shared elsewhere.
    pub fn with_shared_executor(
        config: EngineConfig,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let events = EventBus::new();
        events.subscribe(TracingEventHandler);
        events.subscribe(MetricsCollector::new());

        info!(
            concurrency = config.concurrency,
            executor = executor.name(),
            tag = config.tag.as_deref().unwrap_or(""),
            "Engine created"
        );

        Ok(Self {
            scheduler: BoundedScheduler::new(config.concurrency),
            config: Arc::new(config),
            executor,
            events,
        })
    }

    /// Creates an engine configured from `SWARM_*` environment variables.
    pub fn from_env<E>(executor: E) -> Result<Self, ConfigError>
    where
        E: TaskExecutor + 'static,
    {
        Self::new(EngineConfig::from_env()?, executor)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &BoundedScheduler {
        &self.scheduler
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Registers an event handler.
    pub fn on<H>(&self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.events.subscribe(handler);
    }

    /// Stops admitting executor calls. Running calls finish; anything that
    /// asks for a slot afterwards fails with `SwarmError::SchedulerClosed`.
    pub fn shutdown(&self) {
        info!("Engine shutting down");
        self.scheduler.close();
    }

    /// Issues one executor call under the scheduler.
    ///
    /// The call is bounded by the request timeout, or the engine default.
    /// Executor errors, timeouts and panics all come back as `error`
    /// results, as does a `filtered` status from any role but `Gate`. The
    /// result's meta is the request's meta.
    ///
    /// # Errors
    ///
    /// Returns `SwarmError::SchedulerClosed` if no slot can be admitted.
    pub async fn execute(
        &self,
        item: Item,
        request: ExecutionRequest,
    ) -> Result<TaskResult, SwarmError> {
        let _permit = self.scheduler.acquire().await?;

        let meta = request.meta.clone();
        let role = request.role;
        let timeout = request.timeout.or(self.config.default_timeout);
        let call = AssertUnwindSafe(self.executor.execute(item, request)).catch_unwind();

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(ExecutorError::Timeout(limit))),
            },
            None => call.await,
        };

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                debug!(
                    stage_index = meta.stage_index,
                    item_index = meta.item_index,
                    role = %role,
                    error = %e,
                    "Executor call failed"
                );
                TaskResult::error(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    stage_index = meta.stage_index,
                    item_index = meta.item_index,
                    role = %role,
                    panic = %message,
                    "Executor panicked"
                );
                TaskResult::error(format!("executor panicked: {message}"))
            }
        };

        if result.is_filtered() && role != TaskRole::Gate {
            debug!(
                stage_index = meta.stage_index,
                item_index = meta.item_index,
                role = %role,
                "Executor returned filtered outside a gate stage"
            );
            result.status = TaskStatus::Error;
            result.error = Some(format!(
                "executor returned filtered for a {role} call; only gate stages may filter"
            ));
        }

        result.meta = meta;
        Ok(result)
    }

    /// Runs `pipeline` over `items`.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        items: Vec<Item>,
    ) -> Result<PipelineRun, PipelineFailure> {
        pipeline.run(self, items).await
    }

    /// Runs a single transform stage.
    ///
    /// On an infrastructure abort only the error is returned; run a
    /// [`Pipeline`] to keep the partial accounting.
    pub async fn map(
        &self,
        items: Vec<Item>,
        stage: TransformStage,
    ) -> Result<StageResult, SwarmError> {
        self.single_stage(Pipeline::new().then(stage)?, items).await
    }

    /// Runs a single gate stage.
    pub async fn filter(&self, items: Vec<Item>, stage: GateStage) -> Result<StageResult, SwarmError> {
        self.single_stage(Pipeline::new().then(stage)?, items).await
    }

    /// Runs a single synthesis stage and returns its one result.
    pub async fn reduce(
        &self,
        items: Vec<Item>,
        stage: SynthesisStage,
    ) -> Result<TaskResult, SwarmError> {
        let stage = self.single_stage(Pipeline::new().then(stage)?, items).await?;
        stage
            .output
            .in_input_order()
            .first()
            .map(|result| (*result).clone())
            .ok_or_else(|| SwarmError::Definition("synthesis produced no result".to_string()))
    }

    async fn single_stage(
        &self,
        pipeline: Pipeline,
        items: Vec<Item>,
    ) -> Result<StageResult, SwarmError> {
        let run = pipeline.run(self, items).await.map_err(|failure| failure.error)?;
        run.into_stages()
            .pop()
            .ok_or_else(|| SwarmError::Definition("pipeline ran no stage".to_string()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskMeta;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    struct Scripted;

    #[async_trait]
    impl TaskExecutor for Scripted {
        async fn execute(
            &self,
            _item: Item,
            request: ExecutionRequest,
        ) -> Result<TaskResult, ExecutorError> {
            match request.prompt.as_str() {
                "fail" => Err(ExecutorError::Failed("no sandbox".to_string())),
                "filter" => Ok(TaskResult {
                    status: TaskStatus::Filtered,
                    ..TaskResult::success(json!({"score": 1}))
                }),
                "panic" => panic!("executor bug"),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(TaskResult::success(json!({})))
                }
                _ => Ok(TaskResult::success(json!({"echo": request.prompt}))),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn request(prompt: &str) -> ExecutionRequest {
        ExecutionRequest::new(prompt, TaskRole::Worker, TaskMeta::new(Uuid::nil(), 1, 2))
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Engine::new(EngineConfig::new().with_concurrency(0), Scripted)
            .expect_err("invalid");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_engine_logs_and_counts_events() {
        let engine = Engine::new(EngineConfig::default(), Scripted).expect("engine");
        assert_eq!(engine.events().handler_count(), 2);
    }

    #[tokio::test]
    async fn test_execute_copies_request_meta() {
        let engine = Engine::new(EngineConfig::default(), Scripted).expect("engine");
        let result = engine.execute(Item::new(), request("hello")).await.expect("ok");

        assert!(result.is_success());
        assert_eq!(result.meta.stage_index, 1);
        assert_eq!(result.meta.item_index, 2);
        assert_eq!(result.meta.role, Some(TaskRole::Worker));
    }

    #[tokio::test]
    async fn test_executor_error_becomes_error_result() {
        let engine = Engine::new(EngineConfig::default(), Scripted).expect("engine");
        let result = engine.execute(Item::new(), request("fail")).await.expect("ok");
        assert!(result.is_error());
        assert!(result.failure_reason().contains("no sandbox"));
    }

    #[tokio::test]
    async fn test_panic_becomes_error_result_and_frees_slot() {
        let engine = Engine::new(EngineConfig::new().with_concurrency(1), Scripted).expect("engine");
        let result = engine.execute(Item::new(), request("panic")).await.expect("ok");

        assert!(result.is_error());
        assert!(result.failure_reason().contains("executor bug"));
        assert_eq!(engine.scheduler().available(), 1);
    }

    #[tokio::test]
    async fn test_timeout_becomes_error_result() {
        let engine = Engine::new(EngineConfig::default(), Scripted).expect("engine");
        let result = engine
            .execute(
                Item::new(),
                request("slow").with_timeout(Some(Duration::from_millis(20))),
            )
            .await
            .expect("ok");
        assert!(result.is_error());
        assert!(result.failure_reason().contains("timed out"));
    }

    #[tokio::test]
    async fn test_filtered_is_reserved_for_gates() {
        let engine = Engine::new(EngineConfig::default(), Scripted).expect("engine");

        for role in [TaskRole::Worker, TaskRole::Verifier, TaskRole::Candidate, TaskRole::Judge, TaskRole::Synthesis] {
            let request = ExecutionRequest::new("filter", role, TaskMeta::new(Uuid::nil(), 0, 0));
            let result = engine.execute(Item::new(), request).await.expect("ok");
            assert_eq!(result.status, TaskStatus::Error, "role {role}");
            assert!(result.failure_reason().contains("only gate stages may filter"));
        }

        let gate = ExecutionRequest::new("filter", TaskRole::Gate, TaskMeta::new(Uuid::nil(), 0, 0));
        let result = engine.execute(Item::new(), gate).await.expect("ok");
        assert_eq!(result.status, TaskStatus::Filtered);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_calls() {
        let engine = Engine::new(EngineConfig::default(), Scripted).expect("engine");
        engine.shutdown();
        let err = engine
            .execute(Item::new(), request("hello"))
            .await
            .expect_err("closed");
        assert!(err.is_infrastructure());
    }
}
