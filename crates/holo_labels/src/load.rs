//! Per-worker task counters for the dense-block sync engine.
//!
//! Counters are best-effort and process-local. `dispatched - completed` is
//! the number of block tasks queued or running on a worker, which makes a hot
//! block coordinate visible as one worker with a long backlog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot of per-worker counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncLoadSnapshot {
    pub dispatched: Vec<u64>,
    pub completed: Vec<u64>,
}

impl SyncLoadSnapshot {
    pub fn in_flight(&self) -> u64 {
        self.dispatched
            .iter()
            .zip(&self.completed)
            .map(|(d, c)| d.saturating_sub(*c))
            .sum()
    }
}

#[derive(Clone, Debug)]
pub struct SyncLoadTracker {
    dispatched: Arc<Vec<AtomicU64>>,
    completed: Arc<Vec<AtomicU64>>,
}

impl SyncLoadTracker {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let dispatched = (0..workers).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
        let completed = (0..workers).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
        Self {
            dispatched: Arc::new(dispatched),
            completed: Arc::new(completed),
        }
    }

    pub fn workers(&self) -> usize {
        self.dispatched.len()
    }

    pub fn record_dispatched(&self, worker: usize) {
        if let Some(counter) = self.dispatched.get(worker) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_completed(&self, worker: usize) {
        if let Some(counter) = self.completed.get(worker) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SyncLoadSnapshot {
        let dispatched = self
            .dispatched
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect::<Vec<_>>();
        let completed = self
            .completed
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect::<Vec<_>>();
        SyncLoadSnapshot {
            dispatched,
            completed,
        }
    }
}
