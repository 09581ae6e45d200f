//! Lifecycle events published by label volumes.
//!
//! Subscribers register a bounded channel per `(instance, kind)`. Publishing
//! awaits capacity on every subscriber queue, so a slow subscriber applies
//! backpressure to the publisher instead of losing deltas. Per subscriber,
//! deltas arrive in publish order.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use holo_rle::{BlockCoord, BlockRles, Label};
use tokio::sync::mpsc;
use tracing::warn;

use crate::barrier::CompletionBarrier;
use crate::store::{InstanceVersion, VersionId};
use crate::types::{MergeOp, SizeDelta};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    MergeStart,
    MergeBlock,
    MergeEnd,
    SplitStart,
    SplitLabel,
    SplitEnd,
    ChangeSize,
}

/// Events of one kind from one data instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncEvent {
    pub instance: String,
    pub kind: EventKind,
}

impl SyncEvent {
    pub fn new(instance: impl Into<String>, kind: EventKind) -> Self {
        Self {
            instance: instance.into(),
            kind,
        }
    }
}

/// Blocks touched by one merge.
#[derive(Clone, Debug)]
pub struct DeltaMerge {
    pub op: Arc<MergeOp>,
    pub blocks: Arc<BTreeSet<BlockCoord>>,
    /// Held until every block of the merge has been relabeled.
    pub done: CompletionBarrier,
}

/// Voxels carved out of `old` into `new`, grouped by block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaSplit {
    pub old: Label,
    pub new: Label,
    pub split: BlockRles,
    pub sorted_blocks: Vec<BlockCoord>,
}

impl DeltaSplit {
    pub fn num_voxels(&self) -> u64 {
        self.split.num_voxels()
    }
}

#[derive(Clone, Debug)]
pub enum Delta {
    MergeStart {
        op: Arc<MergeOp>,
        done: CompletionBarrier,
    },
    MergeBlock(DeltaMerge),
    MergeEnd {
        op: Arc<MergeOp>,
    },
    SplitStart {
        old: Label,
        new: Label,
        done: CompletionBarrier,
    },
    SplitLabel {
        split: Arc<DeltaSplit>,
        done: CompletionBarrier,
    },
    SplitEnd {
        old: Label,
        new: Label,
    },
    ChangeSize(SizeDelta),
}

impl Delta {
    pub fn kind(&self) -> EventKind {
        match self {
            Delta::MergeStart { .. } => EventKind::MergeStart,
            Delta::MergeBlock(_) => EventKind::MergeBlock,
            Delta::MergeEnd { .. } => EventKind::MergeEnd,
            Delta::SplitStart { .. } => EventKind::SplitStart,
            Delta::SplitLabel { .. } => EventKind::SplitLabel,
            Delta::SplitEnd { .. } => EventKind::SplitEnd,
            Delta::ChangeSize(_) => EventKind::ChangeSize,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncMessage {
    pub version: VersionId,
    pub delta: Delta,
}

impl SyncMessage {
    pub fn ctx(&self, instance: &str) -> InstanceVersion {
        InstanceVersion::new(instance, self.version)
    }
}

/// Fan-out of lifecycle deltas to subscriber queues.
#[derive(Debug, Default)]
pub struct SyncBus {
    subs: RwLock<HashMap<SyncEvent, Vec<mpsc::Sender<SyncMessage>>>>,
}

impl SyncBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: SyncEvent, tx: mpsc::Sender<SyncMessage>) {
        let mut subs = match self.subs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.entry(event).or_default().push(tx);
    }

    /// Subscribe to several kinds on one bounded queue.
    pub fn subscribe_all(
        &self,
        instance: &str,
        kinds: &[EventKind],
        capacity: usize,
    ) -> mpsc::Receiver<SyncMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        for kind in kinds {
            self.subscribe(SyncEvent::new(instance, *kind), tx.clone());
        }
        rx
    }

    pub fn subscriber_count(&self, event: &SyncEvent) -> usize {
        match self.subs.read() {
            Ok(subs) => subs.get(event).map(Vec::len).unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(event).map(Vec::len).unwrap_or(0),
        }
    }

    fn senders(&self, event: &SyncEvent) -> Vec<mpsc::Sender<SyncMessage>> {
        match self.subs.read() {
            Ok(subs) => subs.get(event).cloned().unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().get(event).cloned().unwrap_or_default(),
        }
    }

    /// Deliver `msg` to every subscriber of `instance`'s events of the
    /// message's kind. Returns the number of queues it reached.
    pub async fn publish(&self, instance: &str, msg: SyncMessage) -> usize {
        let event = SyncEvent::new(instance, msg.delta.kind());
        let senders = self.senders(&event);
        if senders.is_empty() {
            return 0;
        }
        let mut delivered = 0usize;
        let mut closed = false;
        for tx in &senders {
            if tx.send(msg.clone()).await.is_ok() {
                delivered += 1;
            } else {
                warn!(instance, kind = ?event.kind, "dropping closed sync subscriber");
                closed = true;
            }
        }
        if closed {
            let mut subs = match self.subs.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(list) = subs.get_mut(&event) {
                list.retain(|tx| !tx.is_closed());
                if list.is_empty() {
                    subs.remove(&event);
                }
            }
        }
        delivered
    }
}
