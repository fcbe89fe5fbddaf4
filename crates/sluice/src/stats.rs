//! Pool statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolStats {
    /// Live handles (idle + borrowed).
    pub total: usize,
    /// Handles available for borrowing.
    pub idle: usize,
    /// Handles currently borrowed.
    pub active: usize,
    /// Borrowers currently waiting for a handle.
    pub waiting: usize,
    /// Borrow calls made, successful or not.
    pub borrow_requests: u64,
    /// Borrow calls that returned a handle.
    pub borrow_successes: u64,
    /// Borrow calls that gave up at their deadline.
    pub borrow_timeouts: u64,
    /// Mean time a borrow call spent before returning.
    pub average_wait: Duration,
    /// Borrows reported as leaked.
    pub leaks_detected: u64,
    /// Handles ever opened.
    pub created: u64,
    /// Handles ever destroyed.
    pub destroyed: u64,
    /// Factory failures while growing the pool.
    pub creation_failures: u64,
    /// Probes that found a handle unusable.
    pub validation_failures: u64,
}

/// Lock-free counters behind [`PoolStats`]. Every field is only ever
/// incremented.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    borrow_requests: AtomicU64,
    borrow_successes: AtomicU64,
    borrow_timeouts: AtomicU64,
    wait_nanos: AtomicU64,
    leaks_detected: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    creation_failures: AtomicU64,
    validation_failures: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record_borrow(&self, waited: Duration, succeeded: bool) {
        self.borrow_requests.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.wait_nanos.fetch_add(nanos, Ordering::Relaxed);
        if succeeded {
            self.borrow_successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_timeout(&self) {
        self.borrow_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_leak(&self) {
        self.leaks_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_creation_failure(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Fill in the counter half of a snapshot; gauges come from the pool.
    pub(crate) fn snapshot(
        &self,
        total: usize,
        idle: usize,
        active: usize,
        waiting: usize,
    ) -> PoolStats {
        let borrow_requests = self.borrow_requests.load(Ordering::Relaxed);
        let wait_nanos = self.wait_nanos.load(Ordering::Relaxed);
        let average_wait = if borrow_requests == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(wait_nanos / borrow_requests)
        };
        PoolStats {
            total,
            idle,
            active,
            waiting,
            borrow_requests,
            borrow_successes: self.borrow_successes.load(Ordering::Relaxed),
            borrow_timeouts: self.borrow_timeouts.load(Ordering::Relaxed),
            average_wait,
            leaks_detected: self.leaks_detected.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
        }
    }
}
