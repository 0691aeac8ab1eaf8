//! Lifecycle telemetry for the engine.
//!
//! Events are pushed synchronously to every registered handler, inline with
//! result aggregation. Handlers are expected to be quick side-effect-only
//! hooks (logging, metrics, progress displays); a slow handler slows the
//! engine down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::stage::{StageKind, StageResult};
use crate::task::TaskStatus;

/// Events emitted while stages run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    /// A stage is about to fan out over its items.
    StageStart {
        #[serde(rename = "type")]
        kind: StageKind,
        index: usize,
        name: Option<String>,
        item_count: usize,
        timestamp: DateTime<Utc>,
    },
    /// A stage resolved every item.
    StageComplete {
        #[serde(rename = "type")]
        kind: StageKind,
        index: usize,
        name: Option<String>,
        duration_ms: u64,
        success_count: usize,
        error_count: usize,
        filtered_count: usize,
        timestamp: DateTime<Utc>,
    },
    /// A stage was aborted by an infrastructure failure.
    StageError {
        #[serde(rename = "type")]
        kind: StageKind,
        index: usize,
        name: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// An item attempt failed and will be retried after backoff.
    ItemRetry {
        stage_index: usize,
        item_index: usize,
        attempt: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A verify-loop worker pass finished.
    WorkerComplete {
        stage_index: usize,
        item_index: usize,
        attempt: u32,
        status: TaskStatus,
        timestamp: DateTime<Utc>,
    },
    /// A verify-loop verifier pass finished.
    VerifierComplete {
        stage_index: usize,
        item_index: usize,
        attempt: u32,
        passed: bool,
        feedback: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A best-of candidate settled.
    CandidateComplete {
        stage_index: usize,
        item_index: usize,
        candidate_index: usize,
        status: TaskStatus,
        timestamp: DateTime<Utc>,
    },
    /// A best-of judge picked a winner.
    JudgeComplete {
        stage_index: usize,
        item_index: usize,
        winner_index: usize,
        reasoning: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn stage_start(kind: StageKind, index: usize, name: Option<String>, item_count: usize) -> Self {
        EngineEvent::StageStart {
            kind,
            index,
            name,
            item_count,
            timestamp: Utc::now(),
        }
    }

    pub fn stage_complete(result: &StageResult) -> Self {
        EngineEvent::StageComplete {
            kind: result.kind,
            index: result.index,
            name: result.name.clone(),
            duration_ms: result.duration_ms(),
            success_count: result.success_count(),
            error_count: result.error_count(),
            filtered_count: result.filtered_count(),
            timestamp: Utc::now(),
        }
    }

    pub fn stage_error(
        kind: StageKind,
        index: usize,
        name: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        EngineEvent::StageError {
            kind,
            index,
            name,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn item_retry(
        stage_index: usize,
        item_index: usize,
        attempt: u32,
        error: impl Into<String>,
    ) -> Self {
        EngineEvent::ItemRetry {
            stage_index,
            item_index,
            attempt,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn worker_complete(
        stage_index: usize,
        item_index: usize,
        attempt: u32,
        status: TaskStatus,
    ) -> Self {
        EngineEvent::WorkerComplete {
            stage_index,
            item_index,
            attempt,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn verifier_complete(
        stage_index: usize,
        item_index: usize,
        attempt: u32,
        passed: bool,
        feedback: Option<String>,
    ) -> Self {
        EngineEvent::VerifierComplete {
            stage_index,
            item_index,
            attempt,
            passed,
            feedback,
            timestamp: Utc::now(),
        }
    }

    pub fn candidate_complete(
        stage_index: usize,
        item_index: usize,
        candidate_index: usize,
        status: TaskStatus,
    ) -> Self {
        EngineEvent::CandidateComplete {
            stage_index,
            item_index,
            candidate_index,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn judge_complete(
        stage_index: usize,
        item_index: usize,
        winner_index: usize,
        reasoning: impl Into<String>,
    ) -> Self {
        EngineEvent::JudgeComplete {
            stage_index,
            item_index,
            winner_index,
            reasoning: reasoning.into(),
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::StageStart { .. } => "stageStart",
            EngineEvent::StageComplete { .. } => "stageComplete",
            EngineEvent::StageError { .. } => "stageError",
            EngineEvent::ItemRetry { .. } => "itemRetry",
            EngineEvent::WorkerComplete { .. } => "workerComplete",
            EngineEvent::VerifierComplete { .. } => "verifierComplete",
            EngineEvent::CandidateComplete { .. } => "candidateComplete",
            EngineEvent::JudgeComplete { .. } => "judgeComplete",
        }
    }

    /// Moment the event was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::StageStart { timestamp, .. }
            | EngineEvent::StageComplete { timestamp, .. }
            | EngineEvent::StageError { timestamp, .. }
            | EngineEvent::ItemRetry { timestamp, .. }
            | EngineEvent::WorkerComplete { timestamp, .. }
            | EngineEvent::VerifierComplete { timestamp, .. }
            | EngineEvent::CandidateComplete { timestamp, .. }
            | EngineEvent::JudgeComplete { timestamp, .. } => *timestamp,
        }
    }
}

/// Receives engine events.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn handle(&self, event: &EngineEvent) {
        self(event)
    }
}

/// Synchronous fan-out of events to registered handlers.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. Handlers are called in registration order.
    pub fn subscribe<H>(&self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.subscribe_arc(Arc::new(handler));
    }

    /// Registers a shared handler.
    pub fn subscribe_arc(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Dispatches `event` to every handler before returning.
    ///
    /// A panicking handler is logged and skipped; remaining handlers still
    /// receive the event.
    pub fn emit(&self, event: EngineEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler.handle(&event))).is_err() {
                error!(event = event.name(), "Event handler panicked");
            }
        }
    }
}

/// Logs every engine event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventHandler;

impl EventHandler for TracingEventHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::StageStart {
                kind,
                index,
                name,
                item_count,
                ..
            } => info!(
                stage_index = index,
                kind = %kind,
                name = name.as_deref().unwrap_or(""),
                item_count,
                "Stage started"
            ),
            EngineEvent::StageComplete {
                kind,
                index,
                duration_ms,
                success_count,
                error_count,
                filtered_count,
                ..
            } => info!(
                stage_index = index,
                kind = %kind,
                duration_ms,
                success_count,
                error_count,
                filtered_count,
                "Stage completed"
            ),
            EngineEvent::StageError {
                kind, index, error, ..
            } => error!(stage_index = index, kind = %kind, error = %error, "Stage aborted"),
            EngineEvent::ItemRetry {
                stage_index,
                item_index,
                attempt,
                error,
                ..
            } => warn!(
                stage_index,
                item_index,
                attempt,
                error = %error,
                "Item attempt failed, retrying"
            ),
            EngineEvent::WorkerComplete {
                stage_index,
                item_index,
                attempt,
                status,
                ..
            } => debug!(stage_index, item_index, attempt, status = %status, "Worker pass complete"),
            EngineEvent::VerifierComplete {
                stage_index,
                item_index,
                attempt,
                passed,
                ..
            } => debug!(stage_index, item_index, attempt, passed, "Verifier pass complete"),
            EngineEvent::CandidateComplete {
                stage_index,
                item_index,
                candidate_index,
                status,
                ..
            } => debug!(
                stage_index,
                item_index,
                candidate_index,
                status = %status,
                "Candidate settled"
            ),
            EngineEvent::JudgeComplete {
                stage_index,
                item_index,
                winner_index,
                ..
            } => debug!(stage_index, item_index, winner_index, "Judge picked winner"),
        }
    }
}

/// Handler that keeps every event it sees, in dispatch order.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of recorded events with the given wire name.
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventHandler for EventLog {
    fn handle(&self, event: &EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}
