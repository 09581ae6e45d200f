//! Reference-counted set of labels currently being rewritten.
//!
//! A label is dirty while its count is above zero. Merge and split paths
//! increment on entry and decrement on completion; at rest the tracker is
//! empty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use holo_rle::Label;
use tracing::error;

use crate::store::InstanceVersion;
use crate::types::MergeOp;

#[derive(Debug, Default)]
pub struct DirtyTracker {
    counts: Mutex<HashMap<InstanceVersion, HashMap<Label, u64>>>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceVersion, HashMap<Label, u64>>> {
        match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn incr(&self, iv: &InstanceVersion, label: Label) {
        let mut counts = self.lock();
        *counts.entry(iv.clone()).or_default().entry(label).or_insert(0) += 1;
    }

    /// Release one reference. Releasing a label that is not dirty is an
    /// invariant violation; the count is left untouched and an error returned.
    pub fn decr(&self, iv: &InstanceVersion, label: Label) -> anyhow::Result<()> {
        let mut counts = self.lock();
        let count = counts
            .get(iv)
            .and_then(|labels| labels.get(&label))
            .copied()
            .unwrap_or(0);
        if count == 0 {
            error!(invariant = true, %iv, label, "dirty count decremented below zero");
            anyhow::bail!("label {label} in {iv} is not dirty");
        }
        let Some(labels) = counts.get_mut(iv) else {
            return Ok(());
        };
        if count > 1 {
            labels.insert(label, count - 1);
        } else {
            labels.remove(&label);
            if labels.is_empty() {
                counts.remove(iv);
            }
        }
        Ok(())
    }

    pub fn is_dirty(&self, iv: &InstanceVersion, label: Label) -> bool {
        self.count(iv, label) > 0
    }

    pub fn count(&self, iv: &InstanceVersion, label: Label) -> u64 {
        self.lock()
            .get(iv)
            .and_then(|labels| labels.get(&label))
            .copied()
            .unwrap_or(0)
    }

    /// Dirty labels of one instance version, ascending.
    pub fn dirty_labels(&self, iv: &InstanceVersion) -> Vec<Label> {
        let mut labels: Vec<Label> = self
            .lock()
            .get(iv)
            .map(|labels| labels.keys().copied().collect())
            .unwrap_or_default();
        labels.sort_unstable();
        labels
    }

    /// No label is dirty in any instance version.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until no label is dirty, polling every few milliseconds.
    pub async fn wait_clean(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_empty() {
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "dirty labels still pending after {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Ok(())
    }

    /// Mark the target and every merged label dirty.
    pub fn mark_merge_start(&self, iv: &InstanceVersion, op: &MergeOp) {
        let mut counts = self.lock();
        let labels = counts.entry(iv.clone()).or_default();
        for label in op.labels() {
            *labels.entry(label).or_insert(0) += 1;
        }
    }

    /// Release the marks taken by `mark_merge_start`.
    pub fn mark_merge_done(&self, iv: &InstanceVersion, op: &MergeOp) -> anyhow::Result<()> {
        let mut first_err = None;
        for label in op.labels() {
            if let Err(err) = self.decr(iv, label) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Hold `label` dirty until the returned guard drops.
    pub fn busy(self: &Arc<Self>, iv: &InstanceVersion, label: Label) -> DirtyGuard {
        self.incr(iv, label);
        DirtyGuard {
            tracker: self.clone(),
            iv: iv.clone(),
            label,
        }
    }
}

/// Releases one dirty reference on drop.
#[derive(Debug)]
pub struct DirtyGuard {
    tracker: Arc<DirtyTracker>,
    iv: InstanceVersion,
    label: Label,
}

impl Drop for DirtyGuard {
    fn drop(&mut self) {
        // Logged by `decr`.
        let _ = self.tracker.decr(&self.iv, self.label);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn iv() -> InstanceVersion {
        InstanceVersion::new("seg", 3)
    }

    #[test]
    fn merge_marks_cover_target_and_sources() {
        let tracker = DirtyTracker::new();
        let op = MergeOp::new(5, [7, 9]).expect("op");
        tracker.mark_merge_start(&iv(), &op);
        assert!(tracker.is_dirty(&iv(), 5));
        assert!(tracker.is_dirty(&iv(), 7));
        assert!(tracker.is_dirty(&iv(), 9));
        assert!(!tracker.is_dirty(&iv(), 11));
        assert!(!tracker.is_dirty(&InstanceVersion::new("seg", 4), 5));

        tracker.incr(&iv(), 11);
        tracker.mark_merge_done(&iv(), &op).expect("done");
        assert_eq!(tracker.dirty_labels(&iv()), vec![11]);
        tracker.decr(&iv(), 11).expect("decr");
        assert!(tracker.is_empty());
    }

    #[test]
    fn decr_without_incr_is_rejected() {
        let tracker = DirtyTracker::new();
        assert!(tracker.decr(&iv(), 1).is_err());
        tracker.incr(&iv(), 1);
        tracker.decr(&iv(), 1).expect("decr");
        assert!(tracker.decr(&iv(), 1).is_err());
        assert_eq!(tracker.count(&iv(), 1), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let tracker = Arc::new(DirtyTracker::new());
        tracker.incr(&iv(), 42);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        tracker.incr(&iv(), 42);
                        tracker.decr(&iv(), 42).expect("decr");
                    }
                    for _ in 0..10 {
                        tracker.incr(&iv(), 42);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(tracker.count(&iv(), 42), 81);
    }

    #[test]
    fn busy_guard_releases_on_drop() {
        let tracker = Arc::new(DirtyTracker::new());
        {
            let _guard = tracker.busy(&iv(), 8);
            let _again = tracker.busy(&iv(), 8);
            assert_eq!(tracker.count(&iv(), 8), 2);
        }
        assert!(tracker.is_empty());
    }
}
