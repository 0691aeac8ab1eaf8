//! Bounded admission control for executor calls.
//!
//! Every executor call issued by an engine, at any depth of the call graph,
//! first takes a slot from that engine's [`BoundedScheduler`]:
//!
//! ```text
//!   stage ─┬─ item 0 ── retry ── worker ──────────┐
//!          ├─ item 1 ── verify ─ worker, verifier ─┼──► [ semaphore (C) ] ──► executor
//!          └─ item 2 ── best-of ─ candidates, judge┘
//! ```
//!
//! The budget is global to the engine instance, not per stage or per item.
//! Separate engines in one process get separate budgets.

pub mod bounded;
pub mod stats;

pub use bounded::{BoundedScheduler, SchedulerPermit};
pub use stats::SchedulerStats;
