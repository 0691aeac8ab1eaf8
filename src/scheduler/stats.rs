//! Admission statistics for the bounded scheduler.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time view of scheduler activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Configured concurrency limit.
    pub limit: usize,
    /// Executor calls currently holding a slot.
    pub in_flight: usize,
    /// Highest `in_flight` value observed since creation.
    pub peak_in_flight: usize,
    /// Total slots handed out since creation.
    pub total_admitted: u64,
}

impl SchedulerStats {
    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_flight)
    }

    /// Fraction of the budget in use, between 0.0 and 1.0.
    pub fn utilization(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.in_flight as f64 / self.limit as f64
    }
}

/// Shared counters updated by permits as they are created and dropped.
#[derive(Debug, Default)]
pub(crate) struct SharedSchedulerStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    total_admitted: AtomicU64,
}

impl SharedSchedulerStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_admission(&self) -> usize {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.total_admitted.fetch_add(1, Ordering::SeqCst);
        now
    }

    pub(crate) fn record_release(&self) -> usize {
        self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub(crate) fn to_stats(&self, limit: usize) -> SchedulerStats {
        SchedulerStats {
            limit,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            total_admitted: self.total_admitted.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default() {
        let stats = SchedulerStats::default();
        assert_eq!(stats.available(), 0);
        assert!((stats.utilization() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_stats_track_peak() {
        let shared = SharedSchedulerStats::new();

        assert_eq!(shared.record_admission(), 1);
        assert_eq!(shared.record_admission(), 2);
        assert_eq!(shared.record_release(), 1);
        assert_eq!(shared.record_admission(), 2);
        assert_eq!(shared.record_release(), 1);
        assert_eq!(shared.record_release(), 0);

        let stats = shared.to_stats(4);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.peak_in_flight, 2);
        assert_eq!(stats.total_admitted, 3);
        assert_eq!(stats.available(), 4);
    }

    #[test]
    fn test_utilization() {
        let stats = SchedulerStats {
            limit: 4,
            in_flight: 3,
            peak_in_flight: 4,
            total_admitted: 10,
        };
        assert!((stats.utilization() - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.available(), 1);
    }
}
