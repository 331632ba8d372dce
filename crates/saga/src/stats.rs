//! Per-consumer processing counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters owned by a consumer and shared with whoever reports on it.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    fetched: AtomicU64,
    applied: AtomicU64,
    stale: AtomicU64,
    terminal: AtomicU64,
    decode_failures: AtomicU64,
    execute_failures: AtomicU64,
    fetch_failures: AtomicU64,
}

/// A point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub fetched: u64,
    pub applied: u64,
    pub stale: u64,
    pub terminal: u64,
    pub decode_failures: u64,
    pub execute_failures: u64,
    pub fetch_failures: u64,
}

impl StatsSnapshot {
    /// Events whose cursor was committed.
    pub fn committed(&self) -> u64 {
        self.applied + self.stale + self.terminal
    }
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_fetched(&self) {
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_terminal(&self) {
        self.terminal.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_execute_failure(&self) {
        self.execute_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            terminal: self.terminal.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            execute_failures: self.execute_failures.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }
}
