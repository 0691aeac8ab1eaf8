//! Metrics module for Prometheus-based monitoring.
//!
//! Stage, item, retry, verifier, candidate and judge counters, a stage
//! duration histogram and an in-flight gauge for the scheduler.
//!
//! # Example
//!
//! ```ignore
//! use agent_swarm::metrics::{init_metrics, export_metrics};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // ... run pipelines; every engine records into the registry ...
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    CALLS_IN_FLIGHT, CANDIDATES_TOTAL, ITEMS_TOTAL, ITEM_RETRIES, JUDGE_TOTAL, REGISTRY,
    STAGES_TOTAL, STAGE_DURATION, VERIFIER_TOTAL,
};
