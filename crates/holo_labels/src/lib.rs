//! Merge/split consistency engine for labeled volumes.
//!
//! A labeled volume is stored twice: sparsely, as per-label run-length sets
//! keyed by label and block (`LabelVol`), and densely, as blocks of raw
//! 64-bit labels (`LabelBlockStore`). Merges and splits are applied to the
//! sparse side in one atomic batch and published as lifecycle deltas on a
//! `SyncBus`; `LabelBlockSync` consumes those deltas and rewrites the dense
//! blocks with one serial worker per block-coordinate shard. `DirtyTracker`
//! reports which labels are still in flux.

pub mod barrier;
pub mod config;
pub mod dense;
pub mod dirty;
pub mod engine;
pub mod events;
pub mod labelvol;
pub mod load;
pub mod merge_cache;
pub mod store;
pub mod sync;
pub mod types;

pub use barrier::CompletionBarrier;
pub use config::{Checksum, Compression, SyncConfig, VolumeConfig};
pub use dense::{LabelBlock, LabelBlockStore};
pub use dirty::{DirtyGuard, DirtyTracker};
pub use engine::LabelEngine;
pub use events::{Delta, DeltaMerge, DeltaSplit, EventKind, SyncBus, SyncEvent, SyncMessage};
pub use labelvol::LabelVol;
pub use load::{SyncLoadSnapshot, SyncLoadTracker};
pub use merge_cache::MergeCache;
pub use store::{FjallKv, InstanceVersion, MemoryKv, OrderedKv, VersionId, WriteBatch};
pub use sync::{LabelBlockSync, SyncState};
pub use types::{MergeOp, SizeDelta};
