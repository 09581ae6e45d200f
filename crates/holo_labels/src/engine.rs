//! Wiring of one labeled volume: sparse store, dense store and sync engine
//! sharing one dirty tracker, merge cache and event bus.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{SyncConfig, VolumeConfig};
use crate::dense::LabelBlockStore;
use crate::dirty::DirtyTracker;
use crate::events::SyncBus;
use crate::labelvol::LabelVol;
use crate::merge_cache::MergeCache;
use crate::store::OrderedKv;
use crate::sync::LabelBlockSync;

pub struct LabelEngine {
    pub labels: Arc<LabelVol>,
    pub blocks: LabelBlockStore,
    pub sync: LabelBlockSync,
    pub dirty: Arc<DirtyTracker>,
    pub merge_cache: Arc<MergeCache>,
    pub bus: Arc<SyncBus>,
}

impl LabelEngine {
    /// Build the engine over `kv`. The sync engine is idle until `start`.
    pub fn open(
        instance: &str,
        kv: Arc<dyn OrderedKv>,
        volume: VolumeConfig,
        sync: SyncConfig,
    ) -> anyhow::Result<Self> {
        let dirty = Arc::new(DirtyTracker::new());
        let merge_cache = Arc::new(MergeCache::new());
        let bus = Arc::new(SyncBus::new());
        let labels = Arc::new(LabelVol::new(
            instance,
            kv.clone(),
            volume,
            dirty.clone(),
            bus.clone(),
        )?);
        let blocks = LabelBlockStore::new(kv, volume);
        let sync = LabelBlockSync::new(
            instance,
            blocks.clone(),
            dirty.clone(),
            merge_cache.clone(),
            sync,
        );
        Ok(Self {
            labels,
            blocks,
            sync,
            dirty,
            merge_cache,
            bus,
        })
    }

    /// Start dense-block propagation. Requires a tokio runtime.
    pub fn start(&self) -> anyhow::Result<()> {
        self.sync.init_sync(&self.bus)
    }

    /// Wait for in-flight merges and splits to finish propagating.
    pub async fn quiesce(&self, timeout: Duration) -> anyhow::Result<()> {
        self.dirty.wait_clean(timeout).await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.sync.shutdown().await
    }
}
