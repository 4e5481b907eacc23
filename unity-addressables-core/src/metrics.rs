//! Metrics and statistics
//!
//! Lifecycle counters for the operations a manager has run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle counters
#[derive(Debug, Default)]
pub struct OperationStatistics {
    pub created: AtomicU64,
    pub started: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub silent_failures: AtomicU64,
    pub destroyed: AtomicU64,
    pub deferred_callbacks: AtomicU64,
    pub flush_passes: AtomicU64,
}

/// Point-in-time copy of [`OperationStatistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub created: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub silent_failures: u64,
    pub destroyed: u64,
    pub deferred_callbacks: u64,
    pub flush_passes: u64,
}

impl StatisticsSnapshot {
    /// Operations created but not yet destroyed
    pub fn live(&self) -> u64 {
        self.created.saturating_sub(self.destroyed)
    }
}

impl OperationStatistics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Read all counters
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            silent_failures: self.silent_failures.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            deferred_callbacks: self.deferred_callbacks.load(Ordering::Relaxed),
            flush_passes: self.flush_passes.load(Ordering::Relaxed),
        }
    }
}
