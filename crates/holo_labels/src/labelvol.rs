//! Sparse label storage and the merge/split orchestration over it.
//!
//! Each label owns one run-length set per block it touches, stored under
//! `[scope][0x01][label BE][block key]`, so one label's blocks form a
//! contiguous key range in Z, then Y, then X order. Merge and split compute
//! their full result in memory and persist it with a single atomic batch;
//! lifecycle deltas are published along the way for the dense-block sync.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use holo_rle::{
    diff_rles, encode_sparsevol, read_sparsevol, BlockCoord, BlockRles, Label, RunLengthSet,
    BLOCK_KEY_LEN,
};
use tracing::{debug, info};

use crate::barrier::CompletionBarrier;
use crate::config::VolumeConfig;
use crate::dirty::DirtyTracker;
use crate::events::{Delta, DeltaMerge, DeltaSplit, SyncBus, SyncMessage};
use crate::store::{InstanceVersion, OrderedKv, VersionId, WriteBatch};
use crate::types::{MergeOp, SizeDelta};

const TAG_LABEL_BLOCK: u8 = 0x01;
const TAG_MAX_LABEL: u8 = 0x02;

/// One labeled volume's sparse representation.
pub struct LabelVol {
    name: String,
    kv: Arc<dyn OrderedKv>,
    config: VolumeConfig,
    dirty: Arc<DirtyTracker>,
    bus: Arc<SyncBus>,
    // Serializes allocation against the persisted max-label counter.
    label_lock: Mutex<()>,
}

impl LabelVol {
    pub fn new(
        name: impl Into<String>,
        kv: Arc<dyn OrderedKv>,
        config: VolumeConfig,
        dirty: Arc<DirtyTracker>,
        bus: Arc<SyncBus>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            kv,
            config,
            dirty,
            bus,
            label_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn dirty(&self) -> &Arc<DirtyTracker> {
        &self.dirty
    }

    pub fn bus(&self) -> &Arc<SyncBus> {
        &self.bus
    }

    pub fn ctx(&self, version: VersionId) -> InstanceVersion {
        InstanceVersion::new(self.name.clone(), version)
    }

    fn block_key(iv: &InstanceVersion, label: Label, coord: BlockCoord) -> Vec<u8> {
        let mut suffix = Vec::with_capacity(1 + 8 + BLOCK_KEY_LEN);
        suffix.push(TAG_LABEL_BLOCK);
        suffix.extend_from_slice(&label.to_be_bytes());
        suffix.extend_from_slice(&coord.to_key());
        iv.key(&suffix)
    }

    /// Inclusive key range covering every block of `label`.
    fn label_range(iv: &InstanceVersion, label: Label) -> (Vec<u8>, Vec<u8>) {
        (
            Self::block_key(iv, label, BlockCoord::MIN),
            Self::block_key(iv, label, BlockCoord::MAX),
        )
    }

    fn max_label_key(iv: &InstanceVersion) -> Vec<u8> {
        iv.key(&[TAG_MAX_LABEL])
    }

    /// Every block of `label` with its spans.
    pub fn get_label_rles(&self, iv: &InstanceVersion, label: Label) -> anyhow::Result<BlockRles> {
        let (start, end) = Self::label_range(iv, label);
        let entries = self
            .kv
            .range(&start, &end)
            .with_context(|| format!("scan blocks of label {label}"))?;
        let mut blocks = BlockRles::new();
        for (key, value) in entries {
            anyhow::ensure!(
                key.len() >= BLOCK_KEY_LEN,
                "label {label} block key has {} bytes",
                key.len()
            );
            let coord = BlockCoord::from_key(&key[key.len() - BLOCK_KEY_LEN..])?;
            let rles = RunLengthSet::from_bytes(&value)
                .with_context(|| format!("decode label {label} block {coord}"))?;
            blocks.insert(coord, rles);
        }
        Ok(blocks)
    }

    pub fn get_label_block(
        &self,
        iv: &InstanceVersion,
        label: Label,
        coord: BlockCoord,
    ) -> anyhow::Result<Option<RunLengthSet>> {
        let Some(bytes) = self
            .kv
            .get(&Self::block_key(iv, label, coord))
            .with_context(|| format!("read label {label} block {coord}"))?
        else {
            return Ok(None);
        };
        let rles = RunLengthSet::from_bytes(&bytes)
            .with_context(|| format!("decode label {label} block {coord}"))?;
        Ok(Some(rles))
    }

    /// Number of voxels owned by `label`.
    pub fn label_size(&self, iv: &InstanceVersion, label: Label) -> anyhow::Result<u64> {
        Ok(self.get_label_rles(iv, label)?.num_voxels())
    }

    /// Sparse-volume encoding of `label`, or `None` if it owns no voxels.
    pub fn get_sparsevol(
        &self,
        iv: &InstanceVersion,
        label: Label,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let blocks = self.get_label_rles(iv, label)?;
        if blocks.is_empty() {
            return Ok(None);
        }
        Ok(Some(encode_sparsevol(&blocks.flatten())))
    }

    fn stage_blocks(
        batch: &mut WriteBatch,
        iv: &InstanceVersion,
        label: Label,
        blocks: &BlockRles,
    ) {
        for (coord, rles) in blocks.iter() {
            batch.put(Self::block_key(iv, label, *coord), rles.to_bytes());
        }
    }

    /// Store `blocks` as the spans of `label`, replacing any entries for the
    /// same blocks, and raise the max-label counter to cover `label`.
    pub fn write_label_vol(
        &self,
        iv: &InstanceVersion,
        label: Label,
        blocks: &BlockRles,
    ) -> anyhow::Result<()> {
        let _guard = self
            .label_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("label allocation lock poisoned"))?;
        let mut batch = WriteBatch::new();
        Self::stage_blocks(&mut batch, iv, label, blocks);
        if label > self.read_max_label(iv)? {
            batch.put(Self::max_label_key(iv), label.to_be_bytes().to_vec());
        }
        self.kv
            .commit(batch)
            .with_context(|| format!("write label {label} volume"))?;
        debug!(%iv, label, blocks = blocks.len(), "wrote label volume");
        Ok(())
    }

    fn read_max_label(&self, iv: &InstanceVersion) -> anyhow::Result<Label> {
        let Some(bytes) = self.kv.get(&Self::max_label_key(iv)).context("read max label")? else {
            return Ok(0);
        };
        let buf: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("max label entry has {} bytes", bytes.len()))?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Largest label id stored or allocated in `iv`.
    pub fn max_label(&self, iv: &InstanceVersion) -> anyhow::Result<Label> {
        let _guard = self
            .label_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("label allocation lock poisoned"))?;
        self.read_max_label(iv)
    }

    /// Allocate a label id never used before in `iv`.
    pub fn new_label(&self, iv: &InstanceVersion) -> anyhow::Result<Label> {
        let _guard = self
            .label_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("label allocation lock poisoned"))?;
        let next = self
            .read_max_label(iv)?
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("label ids exhausted in {iv}"))?;
        self.kv
            .put(Self::max_label_key(iv), next.to_be_bytes().to_vec())
            .context("persist max label")?;
        Ok(next)
    }

    async fn publish(&self, version: VersionId, delta: Delta) {
        self.bus.publish(&self.name, SyncMessage { version, delta }).await;
    }

    /// Fold every label of `op.merged` into `op.target`.
    ///
    /// The dirty marks for all labels of the merge stay set until the dense
    /// blocks have been relabeled, which may be after this returns.
    pub async fn merge_labels(&self, version: VersionId, op: MergeOp) -> anyhow::Result<()> {
        op.validate()?;
        let started = Instant::now();
        let iv = self.ctx(version);
        let op = Arc::new(op);

        self.dirty.mark_merge_start(&iv, &op);
        let done = {
            let dirty = self.dirty.clone();
            let iv = iv.clone();
            let op = op.clone();
            CompletionBarrier::new(move || {
                // Logged by `decr`.
                let _ = dirty.mark_merge_done(&iv, &op);
            })
        };
        self.publish(
            version,
            Delta::MergeStart {
                op: op.clone(),
                done: done.clone(),
            },
        )
        .await;

        let mut target = self.get_label_rles(&iv, op.target)?;
        let old_size = target.num_voxels();
        let mut changed = BTreeSet::new();
        let mut added = 0u64;
        let mut batch = WriteBatch::new();

        for &label in &op.merged {
            let source = self.get_label_rles(&iv, label)?;
            if source.is_empty() {
                debug!(%iv, label, target = op.target, "merge source has no blocks");
                continue;
            }
            let size = source.num_voxels();
            self.publish(
                version,
                Delta::ChangeSize(SizeDelta::Deleted {
                    label,
                    old_size: size,
                }),
            )
            .await;
            for (coord, rles) in source.iter() {
                target.add_block(*coord, rles);
                changed.insert(*coord);
            }
            added += size;
            let (start, end) = Self::label_range(&iv, label);
            batch.delete_range(start, end);
        }

        if changed.is_empty() {
            debug!(%iv, %op, "merge has nothing to move");
            return Ok(());
        }

        let blocks = Arc::new(changed);
        self.publish(
            version,
            Delta::MergeBlock(DeltaMerge {
                op: op.clone(),
                blocks: blocks.clone(),
                done: done.clone(),
            }),
        )
        .await;

        for coord in blocks.iter() {
            if let Some(rles) = target.get(coord) {
                batch.put(Self::block_key(&iv, op.target, *coord), rles.to_bytes());
            }
        }
        self.kv
            .commit(batch)
            .with_context(|| format!("commit merge into label {}", op.target))?;

        self.publish(
            version,
            Delta::ChangeSize(SizeDelta::Replaced {
                label: op.target,
                old_size,
                new_size: old_size + added,
            }),
        )
        .await;
        self.publish(version, Delta::MergeEnd { op: op.clone() }).await;

        info!(
            %iv,
            target = op.target,
            merged = op.merged.len(),
            blocks = blocks.len(),
            voxels = added,
            elapsed_us = started.elapsed().as_micros() as u64,
            "merged labels"
        );
        Ok(())
    }

    /// Move the voxels described by the sparse volume in `reader` from
    /// `from` into a freshly allocated label, which is returned.
    ///
    /// Every split block is validated against `from`'s spans before anything
    /// is written; a split that is not a subset of `from` changes nothing.
    pub async fn split_labels<R: Read>(
        &self,
        version: VersionId,
        from: Label,
        reader: R,
    ) -> anyhow::Result<Label> {
        let started = Instant::now();
        let iv = self.ctx(version);
        // Held until every consumer of this split has released its barrier.
        let busy = self.dirty.busy(&iv, from);
        let done = CompletionBarrier::new(move || drop(busy));

        let to = self.new_label(&iv)?;
        self.publish(
            version,
            Delta::SplitStart {
                old: from,
                new: to,
                done: done.clone(),
            },
        )
        .await;

        let rles = read_sparsevol(reader).context("parse split sparse volume")?;
        anyhow::ensure!(!rles.is_empty(), "split of label {from} has no voxels");
        let split = BlockRles::partition(&rles, self.config.block_size)?;
        let sorted_blocks = split.sorted_blocks();
        let moved = split.num_voxels();

        let mut batch = WriteBatch::new();
        Self::stage_blocks(&mut batch, &iv, to, &split);
        for coord in &sorted_blocks {
            let Some(cut) = split.get(coord) else {
                continue;
            };
            let Some(original) = self.get_label_block(&iv, from, *coord)? else {
                anyhow::bail!("split references block {coord} not owned by label {from}");
            };
            let diff = diff_rles(cut, &original)
                .with_context(|| format!("split label {from} block {coord}"))?;
            let key = Self::block_key(&iv, from, *coord);
            if diff.full_duplicate {
                batch.delete(key);
            } else {
                batch.put(key, diff.residual.to_bytes());
            }
        }

        let delta = Arc::new(DeltaSplit {
            old: from,
            new: to,
            split,
            sorted_blocks,
        });
        self.publish(
            version,
            Delta::SplitLabel {
                split: delta.clone(),
                done: done.clone(),
            },
        )
        .await;

        self.kv
            .commit(batch)
            .with_context(|| format!("commit split of label {from}"))?;

        self.publish(
            version,
            Delta::ChangeSize(SizeDelta::Created {
                label: to,
                size: moved,
            }),
        )
        .await;
        self.publish(
            version,
            Delta::ChangeSize(SizeDelta::Modified {
                label: from,
                delta: -(moved as i64),
            }),
        )
        .await;
        self.publish(version, Delta::SplitEnd { old: from, new: to }).await;

        info!(
            %iv,
            from,
            to,
            blocks = delta.sorted_blocks.len(),
            voxels = moved,
            elapsed_us = started.elapsed().as_micros() as u64,
            "split label"
        );
        Ok(to)
    }
}
