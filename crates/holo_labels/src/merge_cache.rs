//! In-flight merges, for relabeling reads on the fly.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use holo_rle::Label;

use crate::store::InstanceVersion;
use crate::types::MergeOp;

/// Merges whose dense-block propagation has not finished yet.
#[derive(Debug, Default)]
pub struct MergeCache {
    ops: Mutex<HashMap<InstanceVersion, Vec<MergeOp>>>,
}

impl MergeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceVersion, Vec<MergeOp>>> {
        match self.ops.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(&self, iv: &InstanceVersion, op: MergeOp) {
        self.lock().entry(iv.clone()).or_default().push(op);
    }

    /// Remove one entry equal to `op`. Returns whether one was found.
    pub fn remove(&self, iv: &InstanceVersion, op: &MergeOp) -> bool {
        let mut ops = self.lock();
        let Some(list) = ops.get_mut(iv) else {
            return false;
        };
        let Some(pos) = list.iter().position(|o| o == op) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            ops.remove(iv);
        }
        true
    }

    /// Label that `label` reads as once pending merges land.
    pub fn translate(&self, iv: &InstanceVersion, label: Label) -> Label {
        self.lock()
            .get(iv)
            .and_then(|list| list.iter().find(|op| op.merged.contains(&label)))
            .map(|op| op.target)
            .unwrap_or(label)
    }

    pub fn pending(&self, iv: &InstanceVersion) -> usize {
        self.lock().get(iv).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
