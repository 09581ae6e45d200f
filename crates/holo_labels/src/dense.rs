//! Dense label blocks and their serialized form.
//!
//! A dense block is an array of little-endian `u64` labels, one per voxel, in
//! block-local Z, then Y, then X order. Serialized blocks carry a small header:
//!
//! ```text
//! [0]    compression tag
//! [1]    checksum tag
//! [2..6] crc32 of the uncompressed cells (0 when no checksum)
//! [6..]  cells, compressed per the tag
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use holo_rle::{BlockCoord, BlockRles, BlockSize, Label, RunLengthSet, Span};

use crate::config::{Checksum, Compression, VolumeConfig};
use crate::store::{InstanceVersion, OrderedKv, WriteBatch};

const HEADER_LEN: usize = 6;
const ZSTD_LEVEL: i32 = 3;

/// Key tag for dense blocks within an instance/version scope.
const TAG_DENSE_BLOCK: u8 = 0x10;

/// One block of voxel labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelBlock {
    size: BlockSize,
    data: Vec<u8>,
}

impl LabelBlock {
    /// A block of background (label 0) voxels.
    pub fn new(size: BlockSize) -> Self {
        Self {
            size,
            data: vec![0u8; size.voxels() * 8],
        }
    }

    pub fn from_bytes(size: BlockSize, data: Vec<u8>) -> anyhow::Result<Self> {
        let expected = size.voxels() * 8;
        anyhow::ensure!(
            data.len() == expected,
            "dense block has {} bytes, expected {expected} for {size} block",
            data.len()
        );
        Ok(Self { size, data })
    }

    pub fn size(&self) -> BlockSize {
        self.size
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn offset(&self, x: i32, y: i32, z: i32) -> Option<usize> {
        let s = self.size;
        if !(0..s.x).contains(&x) || !(0..s.y).contains(&y) || !(0..s.z).contains(&z) {
            return None;
        }
        let idx = (z as usize * s.y as usize + y as usize) * s.x as usize + x as usize;
        Some(idx * 8)
    }

    /// Label at block-local voxel `(x, y, z)`.
    pub fn get(&self, x: i32, y: i32, z: i32) -> Option<Label> {
        let at = self.offset(x, y, z)?;
        Some(cell(&self.data, at))
    }

    pub fn set(&mut self, x: i32, y: i32, z: i32, label: Label) -> anyhow::Result<()> {
        let Some(at) = self.offset(x, y, z) else {
            anyhow::bail!("voxel ({x},{y},{z}) outside {} block", self.size);
        };
        self.data[at..at + 8].copy_from_slice(&label.to_le_bytes());
        Ok(())
    }

    /// Rewrite every cell holding a label in `merged` to `target`.
    /// Returns the number of cells changed.
    pub fn relabel(&mut self, merged: &BTreeSet<Label>, target: Label) -> usize {
        let mut changed = 0usize;
        for chunk in self.data.chunks_exact_mut(8) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            if merged.contains(&u64::from_le_bytes(buf)) {
                chunk.copy_from_slice(&target.to_le_bytes());
                changed += 1;
            }
        }
        changed
    }

    /// Write `label` into every voxel of `rles`, which are absolute
    /// coordinates that must fall inside the block at `coord`.
    pub fn write_spans(
        &mut self,
        coord: BlockCoord,
        rles: &RunLengthSet,
        label: Label,
    ) -> anyhow::Result<usize> {
        let (ox, oy, oz) = coord.min_point(self.size);
        let bytes = label.to_le_bytes();
        let mut written = 0usize;
        for span in rles {
            let (x, y, z) = (span.x - ox, span.y - oy, span.z - oz);
            let (Some(start), Some(_)) = (
                self.offset(x, y, z),
                self.offset(x + span.length - 1, y, z),
            ) else {
                anyhow::bail!("span {span} outside block {coord}");
            };
            for at in (start..start + span.length as usize * 8).step_by(8) {
                self.data[at..at + 8].copy_from_slice(&bytes);
            }
            written += span.length as usize;
        }
        Ok(written)
    }

    /// Per-label spans (absolute coordinates) of every non-background voxel.
    pub fn label_spans(&self, coord: BlockCoord) -> BTreeMap<Label, RunLengthSet> {
        let s = self.size;
        let (ox, oy, oz) = coord.min_point(s);
        let mut spans: BTreeMap<Label, Vec<Span>> = BTreeMap::new();
        for z in 0..s.z {
            for y in 0..s.y {
                let row = (z as usize * s.y as usize + y as usize) * s.x as usize * 8;
                let mut x = 0i32;
                while x < s.x {
                    let label = cell(&self.data, row + x as usize * 8);
                    let start = x;
                    while x < s.x && cell(&self.data, row + x as usize * 8) == label {
                        x += 1;
                    }
                    if label != 0 {
                        spans
                            .entry(label)
                            .or_default()
                            .push(Span::new(ox + start, oy + y, oz + z, x - start));
                    }
                }
            }
        }
        spans
            .into_iter()
            .map(|(label, spans)| (label, RunLengthSet::from_spans(spans)))
            .collect()
    }
}

fn cell(data: &[u8], at: usize) -> Label {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

pub fn encode_block(
    block: &LabelBlock,
    compression: Compression,
    checksum: Checksum,
) -> anyhow::Result<Vec<u8>> {
    let crc = match checksum {
        Checksum::None => 0,
        Checksum::Crc32 => crc32fast::hash(block.as_bytes()),
    };
    let payload = match compression {
        Compression::None => block.as_bytes().to_vec(),
        Compression::Zstd => {
            zstd::encode_all(block.as_bytes(), ZSTD_LEVEL).context("zstd compress dense block")?
        }
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(compression.tag());
    out.push(checksum.tag());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_block(bytes: &[u8], size: BlockSize) -> anyhow::Result<LabelBlock> {
    anyhow::ensure!(
        bytes.len() >= HEADER_LEN,
        "serialized dense block has {} bytes, shorter than its header",
        bytes.len()
    );
    let compression = Compression::from_tag(bytes[0])?;
    let checksum = Checksum::from_tag(bytes[1])?;
    let mut crc_buf = [0u8; 4];
    crc_buf.copy_from_slice(&bytes[2..HEADER_LEN]);
    let stored_crc = u32::from_le_bytes(crc_buf);

    let payload = &bytes[HEADER_LEN..];
    let data = match compression {
        Compression::None => payload.to_vec(),
        Compression::Zstd => zstd::decode_all(payload).context("zstd decompress dense block")?,
    };
    if checksum == Checksum::Crc32 {
        let actual = crc32fast::hash(&data);
        anyhow::ensure!(
            actual == stored_crc,
            "dense block checksum mismatch: stored {stored_crc:#010x}, computed {actual:#010x}"
        );
    }
    LabelBlock::from_bytes(size, data)
}

/// Dense block storage for one volume.
#[derive(Clone)]
pub struct LabelBlockStore {
    kv: Arc<dyn OrderedKv>,
    config: VolumeConfig,
    scale: u8,
}

impl LabelBlockStore {
    pub fn new(kv: Arc<dyn OrderedKv>, config: VolumeConfig) -> Self {
        Self {
            kv,
            config,
            scale: 0,
        }
    }

    /// Store blocks of a downsampled resolution level.
    pub fn with_scale(mut self, scale: u8) -> Self {
        self.scale = scale;
        self
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn block_key(&self, iv: &InstanceVersion, coord: BlockCoord) -> Vec<u8> {
        let mut suffix = Vec::with_capacity(2 + holo_rle::BLOCK_KEY_LEN);
        suffix.push(TAG_DENSE_BLOCK);
        suffix.push(self.scale);
        suffix.extend_from_slice(&coord.to_key());
        iv.key(&suffix)
    }

    /// Serialized bytes of a block, without decoding.
    pub fn get_raw(
        &self,
        iv: &InstanceVersion,
        coord: BlockCoord,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        self.kv
            .get(&self.block_key(iv, coord))
            .with_context(|| format!("read dense block {coord}"))
    }

    pub fn get_block(
        &self,
        iv: &InstanceVersion,
        coord: BlockCoord,
    ) -> anyhow::Result<Option<LabelBlock>> {
        match self.get_raw(iv, coord)? {
            Some(bytes) => Ok(Some(decode_block(&bytes, self.config.block_size)?)),
            None => Ok(None),
        }
    }

    pub fn encode(&self, block: &LabelBlock) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(
            block.size() == self.config.block_size,
            "block is {} but volume uses {}",
            block.size(),
            self.config.block_size
        );
        encode_block(block, self.config.compression, self.config.checksum)
    }

    pub fn put_block(
        &self,
        iv: &InstanceVersion,
        coord: BlockCoord,
        block: &LabelBlock,
    ) -> anyhow::Result<()> {
        let bytes = self.encode(block)?;
        self.kv
            .put(self.block_key(iv, coord), bytes)
            .with_context(|| format!("write dense block {coord}"))
    }

    /// Write `label` into every voxel of `blocks`, starting missing blocks
    /// from background, and commit all touched blocks in one batch.
    pub fn paint(
        &self,
        iv: &InstanceVersion,
        blocks: &BlockRles,
        label: Label,
    ) -> anyhow::Result<()> {
        let mut batch = WriteBatch::new();
        for (coord, rles) in blocks.iter() {
            let mut block = self
                .get_block(iv, *coord)?
                .unwrap_or_else(|| LabelBlock::new(self.config.block_size));
            block.write_spans(*coord, rles, label)?;
            self.stage_put(&mut batch, iv, *coord, &block)?;
        }
        self.kv.commit(batch).context("commit painted dense blocks")
    }

    /// Stage a block write in `batch`.
    pub fn stage_put(
        &self,
        batch: &mut WriteBatch,
        iv: &InstanceVersion,
        coord: BlockCoord,
        block: &LabelBlock,
    ) -> anyhow::Result<()> {
        batch.put(self.block_key(iv, coord), self.encode(block)?);
        Ok(())
    }
}
