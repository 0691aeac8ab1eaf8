//! Event-driven metric recording.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics. Engines subscribe one
//! to their event bus, so every lifecycle event is counted without the
//! runner knowing about Prometheus. All methods are no-ops until
//! `init_metrics()` has been called.

use super::prometheus::{
    CALLS_IN_FLIGHT, CANDIDATES_TOTAL, ITEMS_TOTAL, ITEM_RETRIES, JUDGE_TOTAL, STAGES_TOTAL,
    STAGE_DURATION, VERIFIER_TOTAL,
};
use crate::events::{EngineEvent, EventHandler};
use crate::stage::StageKind;
use crate::task::TaskStatus;

/// Records engine metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished stage and its per-status item counts.
    pub fn record_stage(
        &self,
        kind: StageKind,
        duration_secs: f64,
        success: usize,
        filtered: usize,
        error: usize,
    ) {
        if let Some(stages_total) = STAGES_TOTAL.get() {
            stages_total
                .with_label_values(&[kind.as_str(), "completed"])
                .inc();
        }

        if let Some(stage_duration) = STAGE_DURATION.get() {
            stage_duration
                .with_label_values(&[kind.as_str()])
                .observe(duration_secs);
        }

        if let Some(items_total) = ITEMS_TOTAL.get() {
            for (status, count) in [
                (TaskStatus::Success, success),
                (TaskStatus::Filtered, filtered),
                (TaskStatus::Error, error),
            ] {
                if count > 0 {
                    items_total
                        .with_label_values(&[kind.as_str(), status.as_str()])
                        .inc_by(count as f64);
                }
            }
        }
    }

    /// Record a stage aborted by an infrastructure error.
    pub fn record_stage_aborted(&self, kind: StageKind) {
        if let Some(stages_total) = STAGES_TOTAL.get() {
            stages_total
                .with_label_values(&[kind.as_str(), "aborted"])
                .inc();
        }
    }

    pub fn record_retry(&self) {
        if let Some(item_retries) = ITEM_RETRIES.get() {
            item_retries.inc();
        }
    }

    pub fn record_verifier(&self, passed: bool) {
        if let Some(verifier_total) = VERIFIER_TOTAL.get() {
            let label = if passed { "true" } else { "false" };
            verifier_total.with_label_values(&[label]).inc();
        }
    }

    pub fn record_candidate(&self, status: TaskStatus) {
        if let Some(candidates_total) = CANDIDATES_TOTAL.get() {
            candidates_total
                .with_label_values(&[status.as_str()])
                .inc();
        }
    }

    pub fn record_judge(&self) {
        if let Some(judge_total) = JUDGE_TOTAL.get() {
            judge_total.inc();
        }
    }

    /// An executor call took a scheduler slot. The gauge sums over every
    /// engine in the process.
    pub fn record_call_started(&self) {
        if let Some(calls_in_flight) = CALLS_IN_FLIGHT.get() {
            calls_in_flight.inc();
        }
    }

    /// An executor call gave its scheduler slot back.
    pub fn record_call_finished(&self) {
        if let Some(calls_in_flight) = CALLS_IN_FLIGHT.get() {
            calls_in_flight.dec();
        }
    }
}

impl EventHandler for MetricsCollector {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::StageComplete {
                kind,
                duration_ms,
                success_count,
                error_count,
                filtered_count,
                ..
            } => self.record_stage(
                *kind,
                *duration_ms as f64 / 1000.0,
                *success_count,
                *filtered_count,
                *error_count,
            ),
            EngineEvent::StageError { kind, .. } => self.record_stage_aborted(*kind),
            EngineEvent::ItemRetry { .. } => self.record_retry(),
            EngineEvent::VerifierComplete { passed, .. } => self.record_verifier(*passed),
            EngineEvent::CandidateComplete { status, .. } => self.record_candidate(*status),
            EngineEvent::JudgeComplete { .. } => self.record_judge(),
            EngineEvent::StageStart { .. } | EngineEvent::WorkerComplete { .. } => {}
        }
    }
}
