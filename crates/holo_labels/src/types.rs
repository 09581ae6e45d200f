//! Merge operations and label size deltas.

use std::collections::BTreeSet;
use std::fmt;

use holo_rle::Label;

/// Absorb every label in `merged` into `target`.
///
/// Merges do not cascade: callers flatten transitive merges before
/// submitting them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MergeOp {
    pub target: Label,
    pub merged: BTreeSet<Label>,
}

impl MergeOp {
    pub fn new(target: Label, merged: impl IntoIterator<Item = Label>) -> anyhow::Result<Self> {
        let op = Self {
            target,
            merged: merged.into_iter().collect(),
        };
        op.validate()?;
        Ok(op)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.merged.is_empty(), "merge into {} has no source labels", self.target);
        anyhow::ensure!(
            !self.merged.contains(&self.target),
            "merge target {} is also listed as a source",
            self.target
        );
        Ok(())
    }

    /// Target followed by every merged label.
    pub fn labels(&self) -> impl Iterator<Item = Label> + '_ {
        std::iter::once(self.target).chain(self.merged.iter().copied())
    }
}

impl fmt::Display for MergeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} -> {}", self.merged, self.target)
    }
}

/// Change in a label's voxel count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeDelta {
    /// The label was folded into another and no longer owns voxels.
    Deleted { label: Label, old_size: u64 },
    Replaced { label: Label, old_size: u64, new_size: u64 },
    Created { label: Label, size: u64 },
    Modified { label: Label, delta: i64 },
}

impl SizeDelta {
    pub fn label(&self) -> Label {
        match *self {
            SizeDelta::Deleted { label, .. }
            | SizeDelta::Replaced { label, .. }
            | SizeDelta::Created { label, .. }
            | SizeDelta::Modified { label, .. } => label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_op_rejects_self_and_empty() {
        assert!(MergeOp::new(5, [7, 9]).is_ok());
        assert!(MergeOp::new(5, []).is_err());
        assert!(MergeOp::new(5, [5, 7]).is_err());
        let op = MergeOp::new(5, [9, 7, 9]).expect("op");
        assert_eq!(op.labels().collect::<Vec<_>>(), vec![5, 7, 9]);
    }
}
