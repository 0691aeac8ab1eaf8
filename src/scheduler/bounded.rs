//! Engine-wide admission control for executor calls.
//!
//! A single counting semaphore bounds how many executor calls one engine
//! instance has in flight, whichever stage, item, retry, verifier,
//! candidate or judge issued them. Slots are handed out as
//! [`SchedulerPermit`] guards that give the slot back when dropped, so a
//! slot cannot leak on an early return, an error or a panic.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use super::stats::{SchedulerStats, SharedSchedulerStats};
use crate::error::SwarmError;
use crate::metrics::MetricsCollector;

/// Counting-semaphore scheduler owned by one engine instance.
#[derive(Debug, Clone)]
pub struct BoundedScheduler {
    semaphore: Arc<Semaphore>,
    limit: usize,
    stats: Arc<SharedSchedulerStats>,
}

impl BoundedScheduler {
    /// Creates a scheduler admitting at most `limit` concurrent calls.
    ///
    /// A limit of zero is raised to one; callers validate the configured
    /// value before it reaches here.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            stats: Arc::new(SharedSchedulerStats::new()),
        }
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns `SwarmError::SchedulerClosed` once [`close`](Self::close) has
    /// been called.
    pub async fn acquire(&self) -> Result<SchedulerPermit, SwarmError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| SwarmError::SchedulerClosed)?;

        let in_flight = self.stats.record_admission();
        MetricsCollector::new().record_call_started();
        trace!(in_flight, limit = self.limit, "Scheduler slot acquired");

        Ok(SchedulerPermit {
            _permit: permit,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Runs `fut` while holding a slot.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, SwarmError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(fut.await)
    }

    /// Stops admitting new calls. Calls already holding a slot finish normally.
    pub fn close(&self) {
        if !self.semaphore.is_closed() {
            debug!(limit = self.limit, "Closing scheduler");
            self.semaphore.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Configured concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.to_stats(self.limit)
    }
}

/// A held scheduler slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct SchedulerPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<SharedSchedulerStats>,
}

impl Drop for SchedulerPermit {
    fn drop(&mut self) {
        self.stats.record_release();
        MetricsCollector::new().record_call_finished();
    }
}
