//! agent-swarm: orchestration engine for swarms of AI-agent calls.
//!
//! Batches of items flow through linear pipelines of transform, gate and
//! synthesis stages. Every executor call, including verifier passes, best-of
//! candidates and judges, competes for one global concurrency bound.

pub mod cli;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod metrics;
pub mod pipeline;
pub mod quality;
pub mod retry;
pub mod scheduler;
pub mod stage;
pub mod task;

pub use config::{ConfigError, EngineConfig};
pub use definition::PipelineDefinition;
pub use engine::Engine;
pub use error::{SwarmError, SwarmResult};
pub use events::{EngineEvent, EventBus, EventHandler};
pub use executor::{ExecutionRequest, ExecutorError, TaskExecutor};
pub use pipeline::{Pipeline, PipelineFailure, PipelineRun};
pub use quality::{BestOfPolicy, QualityPolicy, VerifyPolicy};
pub use retry::RetryPolicy;
pub use stage::{Emit, GateStage, StageConfig, StageKind, StageResult, SynthesisStage, TransformStage};
pub use task::{Item, TaskMeta, TaskResult, TaskRole, TaskStatus};
