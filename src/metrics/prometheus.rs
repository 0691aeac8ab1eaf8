//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by agent-swarm and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all agent-swarm metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Stages finished, labeled by kind and outcome (completed/aborted).
pub static STAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage wall-clock duration in seconds, labeled by kind.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Items resolved, labeled by stage kind and final status.
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Item attempts that were retried.
pub static ITEM_RETRIES: OnceLock<Counter> = OnceLock::new();

/// Verifier passes, labeled by verdict.
pub static VERIFIER_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Best-of candidates settled, labeled by status.
pub static CANDIDATES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Judge decisions made.
pub static JUDGE_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Executor calls currently holding a scheduler slot.
pub static CALLS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Stage metrics
    let stages_total = CounterVec::new(
        Opts::new("agent_swarm_stages_total", "Total number of stages finished"),
        &["kind", "outcome"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "agent_swarm_stage_duration_seconds",
            "Stage execution duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        &["kind"],
    )?;

    let items_total = CounterVec::new(
        Opts::new("agent_swarm_items_total", "Total number of items resolved"),
        &["kind", "status"],
    )?;

    // Quality metrics
    let item_retries = Counter::new("agent_swarm_item_retries_total", "Total item retries")?;

    let verifier_total = CounterVec::new(
        Opts::new("agent_swarm_verifier_total", "Total verifier passes"),
        &["passed"],
    )?;

    let candidates_total = CounterVec::new(
        Opts::new("agent_swarm_candidates_total", "Total best-of candidates settled"),
        &["status"],
    )?;

    let judge_total = Counter::new("agent_swarm_judge_total", "Total judge decisions")?;

    // Scheduler metrics
    let calls_in_flight = Gauge::new(
        "agent_swarm_calls_in_flight",
        "Executor calls currently holding a scheduler slot",
    )?;

    registry.register(Box::new(stages_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(item_retries.clone()))?;
    registry.register(Box::new(verifier_total.clone()))?;
    registry.register(Box::new(candidates_total.clone()))?;
    registry.register(Box::new(judge_total.clone()))?;
    registry.register(Box::new(calls_in_flight.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = STAGES_TOTAL.set(stages_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = ITEMS_TOTAL.set(items_total);
    let _ = ITEM_RETRIES.set(item_retries);
    let _ = VERIFIER_TOTAL.set(verifier_total);
    let _ = CANDIDATES_TOTAL.set(candidates_total);
    let _ = JUDGE_TOTAL.set(judge_total);
    let _ = CALLS_IN_FLIGHT.set(calls_in_flight);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
