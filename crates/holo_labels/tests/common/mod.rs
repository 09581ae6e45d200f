//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use holo_labels::{
    FjallKv, InstanceVersion, LabelEngine, MemoryKv, OrderedKv, SyncConfig, VolumeConfig,
    WriteBatch,
};
use holo_rle::{BlockCoord, BlockRles, BlockSize, Label, RunLengthSet, Span};

/// Upper bound on how long propagation may take in a test.
pub const QUIESCE_TIMEOUT: Duration = Duration::from_secs(10);

pub const INSTANCE: &str = "segmentation";

pub fn volume(block: i32) -> VolumeConfig {
    VolumeConfig {
        block_size: BlockSize::cube(block),
        ..VolumeConfig::default()
    }
}

pub fn sync_config(workers: usize) -> SyncConfig {
    SyncConfig::default().with_workers(workers)
}

/// Engine over a fresh in-memory store, not yet started.
pub fn memory_engine(block: i32, workers: usize) -> LabelEngine {
    LabelEngine::open(
        INSTANCE,
        Arc::new(MemoryKv::new()),
        volume(block),
        sync_config(workers),
    )
    .expect("open engine")
}

/// Engine over a fjall keyspace rooted at `dir`, not yet started.
pub fn fjall_engine(
    dir: &Path,
    block: i32,
    workers: usize,
) -> (Arc<fjall::Keyspace>, LabelEngine) {
    let keyspace = Arc::new(fjall::Config::new(dir).open().expect("open keyspace"));
    let kv = FjallKv::open(keyspace.clone(), "labels").expect("open partition");
    let engine = LabelEngine::open(INSTANCE, Arc::new(kv), volume(block), sync_config(workers))
        .expect("open engine");
    (keyspace, engine)
}

/// Store `spans` as `label` in both the sparse and the dense representation.
pub fn seed(engine: &LabelEngine, iv: &InstanceVersion, label: Label, spans: &[Span]) {
    let rles = RunLengthSet::from_spans(spans.iter().copied());
    let blocks =
        BlockRles::partition(&rles, engine.labels.config().block_size).expect("partition");
    engine
        .labels
        .write_label_vol(iv, label, &blocks)
        .expect("write label volume");
    engine.blocks.paint(iv, &blocks, label).expect("paint dense blocks");
}

/// Dense label at an absolute voxel, or `None` if its block is absent.
pub fn dense_label(
    engine: &LabelEngine,
    iv: &InstanceVersion,
    x: i32,
    y: i32,
    z: i32,
) -> Option<Label> {
    let size = engine.labels.config().block_size;
    let coord = BlockCoord::containing(x, y, z, size);
    let block = engine.blocks.get_block(iv, coord).expect("read dense block")?;
    let (ox, oy, oz) = coord.min_point(size);
    block.get(x - ox, y - oy, z - oz)
}

/// Assert every voxel of `spans` reads `label` in the dense representation.
pub fn assert_dense(engine: &LabelEngine, iv: &InstanceVersion, spans: &[Span], label: Label) {
    for span in spans {
        for x in span.x..span.end_x() {
            assert_eq!(
                dense_label(engine, iv, x, span.y, span.z),
                Some(label),
                "voxel ({x},{},{})",
                span.y,
                span.z
            );
        }
    }
}

/// Assert the dense blocks agree with the sparse spans of every label in
/// `labels`, block by block.
pub fn assert_consistent(engine: &LabelEngine, iv: &InstanceVersion, labels: &[Label]) {
    let sparse: BTreeMap<Label, BlockRles> = labels
        .iter()
        .map(|&label| {
            let rles = engine.labels.get_label_rles(iv, label).expect("label rles");
            (label, rles)
        })
        .collect();
    let coords: BTreeSet<BlockCoord> = sparse
        .values()
        .flat_map(|blocks| blocks.sorted_blocks())
        .collect();
    for coord in coords {
        let dense = engine
            .blocks
            .get_block(iv, coord)
            .expect("read dense block")
            .unwrap_or_else(|| panic!("dense block {coord} missing"))
            .label_spans(coord);
        for label in labels {
            assert_eq!(
                dense.get(label),
                sparse[label].get(&coord),
                "label {label} in block {coord}"
            );
        }
    }
}

/// In-memory store with switchable read and commit failures.
#[derive(Default)]
pub struct FaultyKv {
    inner: MemoryKv,
    fail_reads: AtomicBool,
    fail_commits: AtomicBool,
}

impl FaultyKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make range scans fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

impl OrderedKv for FaultyKv {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> anyhow::Result<()> {
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.inner.delete(key)
    }

    fn range(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        anyhow::ensure!(
            !self.fail_reads.load(Ordering::SeqCst),
            "injected range failure"
        );
        self.inner.range(start, end)
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.fail_commits.load(Ordering::SeqCst),
            "injected commit failure"
        );
        self.inner.commit(batch)
    }
}

/// In-memory store whose point reads stall on label sync worker threads,
/// so block tasks pile up behind a busy worker.
pub struct SlowKv {
    inner: MemoryKv,
    delay: Duration,
}

impl SlowKv {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryKv::new(),
            delay,
        }
    }
}

impl OrderedKv for SlowKv {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let on_worker = std::thread::current()
            .name()
            .is_some_and(|name| name.starts_with("label-sync-"));
        if on_worker {
            std::thread::sleep(self.delay);
        }
        self.inner.get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> anyhow::Result<()> {
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.inner.delete(key)
    }

    fn range(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.range(start, end)
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        self.inner.commit(batch)
    }
}
