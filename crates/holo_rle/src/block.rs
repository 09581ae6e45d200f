//! Block coordinates and per-block span partitions.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Context;

use crate::rle::{RunLengthSet, Span};

/// Encoded length of a block coordinate key.
pub const BLOCK_KEY_LEN: usize = 12;

/// Chunk index of a block in the voxel grid.
///
/// Ordering (and the encoded key) is Z, then Y, then X so range scans over
/// block-indexed keys come back in scan order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockCoord {
    pub const MIN: BlockCoord = BlockCoord::new(i32::MIN, i32::MIN, i32::MIN);
    pub const MAX: BlockCoord = BlockCoord::new(i32::MAX, i32::MAX, i32::MAX);

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Fixed-width key whose byte order matches `Ord` for `BlockCoord`.
    ///
    /// Each component is stored big-endian with the sign bit flipped.
    pub fn to_key(&self) -> [u8; BLOCK_KEY_LEN] {
        let mut out = [0u8; BLOCK_KEY_LEN];
        out[0..4].copy_from_slice(&flip_sign(self.z).to_be_bytes());
        out[4..8].copy_from_slice(&flip_sign(self.y).to_be_bytes());
        out[8..12].copy_from_slice(&flip_sign(self.x).to_be_bytes());
        out
    }

    pub fn from_key(key: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            key.len() == BLOCK_KEY_LEN,
            "block key has {} bytes, expected {BLOCK_KEY_LEN}",
            key.len()
        );
        let read = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&key[at..at + 4]);
            unflip_sign(u32::from_be_bytes(buf))
        };
        Ok(Self {
            z: read(0),
            y: read(4),
            x: read(8),
        })
    }

    /// Block containing the voxel `(x, y, z)`.
    pub fn containing(x: i32, y: i32, z: i32, size: BlockSize) -> Self {
        Self {
            x: x.div_euclid(size.x),
            y: y.div_euclid(size.y),
            z: z.div_euclid(size.z),
        }
    }

    /// First voxel covered by this block.
    pub fn min_point(&self, size: BlockSize) -> (i32, i32, i32) {
        (self.x * size.x, self.y * size.y, self.z * size.z)
    }
}

impl Ord for BlockCoord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.z, self.y, self.x).cmp(&(other.z, other.y, other.x))
    }
}

impl PartialOrd for BlockCoord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BlockCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

fn flip_sign(v: i32) -> u32 {
    (v as u32) ^ 0x8000_0000
}

fn unflip_sign(v: u32) -> i32 {
    (v ^ 0x8000_0000) as i32
}

/// Voxel extent of one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockSize {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockSize {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub const fn cube(n: i32) -> Self {
        Self { x: n, y: n, z: n }
    }

    pub fn voxels(&self) -> usize {
        self.x as usize * self.y as usize * self.z as usize
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.x > 0 && self.y > 0 && self.z > 0,
            "block size {}x{}x{} must be positive",
            self.x,
            self.y,
            self.z
        );
        Ok(())
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::cube(32)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

/// Spans of one label grouped by the block they fall in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockRles {
    blocks: BTreeMap<BlockCoord, RunLengthSet>,
}

impl BlockRles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `rles` on block boundaries so every resulting span lies inside
    /// exactly one block.
    pub fn partition(rles: &RunLengthSet, size: BlockSize) -> anyhow::Result<Self> {
        size.validate()?;
        let mut grouped: BTreeMap<BlockCoord, Vec<Span>> = BTreeMap::new();
        for span in rles {
            let end = span
                .x
                .checked_add(span.length)
                .with_context(|| format!("span {span} runs past the end of the grid"))?;
            let mut x = span.x;
            while x < end {
                let coord = BlockCoord::containing(x, span.y, span.z, size);
                // The last block on an axis may end past i32::MAX.
                let block_end = (i64::from(coord.x) + 1) * i64::from(size.x);
                let run_end = i64::from(end).min(block_end) as i32;
                grouped
                    .entry(coord)
                    .or_default()
                    .push(Span::new(x, span.y, span.z, run_end - x));
                x = run_end;
            }
        }
        Ok(Self {
            blocks: grouped
                .into_iter()
                .map(|(coord, spans)| (coord, RunLengthSet::from_spans(spans)))
                .collect(),
        })
    }

    pub fn get(&self, coord: &BlockCoord) -> Option<&RunLengthSet> {
        self.blocks.get(coord)
    }

    pub fn get_mut(&mut self, coord: &BlockCoord) -> Option<&mut RunLengthSet> {
        self.blocks.get_mut(coord)
    }

    pub fn insert(&mut self, coord: BlockCoord, rles: RunLengthSet) -> Option<RunLengthSet> {
        self.blocks.insert(coord, rles)
    }

    pub fn remove(&mut self, coord: &BlockCoord) -> Option<RunLengthSet> {
        self.blocks.remove(coord)
    }

    /// Union `rles` into the entry for `coord`, creating it if absent.
    pub fn add_block(&mut self, coord: BlockCoord, rles: &RunLengthSet) {
        self.blocks.entry(coord).or_default().add(rles);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlockCoord, &RunLengthSet)> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block coordinates in Z, Y, X order.
    pub fn sorted_blocks(&self) -> Vec<BlockCoord> {
        self.blocks.keys().copied().collect()
    }

    pub fn num_voxels(&self) -> u64 {
        self.blocks.values().map(RunLengthSet::num_voxels).sum()
    }

    /// All spans across blocks, coalesced back into one set.
    pub fn flatten(&self) -> RunLengthSet {
        RunLengthSet::from_spans(self.blocks.values().flat_map(|r| r.iter().copied()))
    }
}

impl FromIterator<(BlockCoord, RunLengthSet)> for BlockRles {
    fn from_iter<I: IntoIterator<Item = (BlockCoord, RunLengthSet)>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coord_keys_sort_like_coords() {
        let mut coords = vec![
            BlockCoord::new(1, 0, 0),
            BlockCoord::new(-1, 0, 0),
            BlockCoord::new(0, 1, 0),
            BlockCoord::new(0, -3, 2),
            BlockCoord::new(5, 5, -1),
            BlockCoord::MIN,
            BlockCoord::MAX,
        ];
        let mut by_key = coords.clone();
        coords.sort();
        by_key.sort_by_key(|c| c.to_key());
        assert_eq!(coords, by_key);
        assert_eq!(coords.first(), Some(&BlockCoord::MIN));
        assert_eq!(coords.last(), Some(&BlockCoord::MAX));
    }

    #[test]
    fn coord_key_decodes() {
        let coord = BlockCoord::new(-7, 12, i32::MIN + 1);
        assert_eq!(BlockCoord::from_key(&coord.to_key()).expect("decode"), coord);
        assert!(BlockCoord::from_key(&[0u8; 4]).is_err());
    }

    #[test]
    fn containing_floors_negative_voxels() {
        let size = BlockSize::cube(32);
        assert_eq!(BlockCoord::containing(0, 31, 32, size), BlockCoord::new(0, 0, 1));
        assert_eq!(BlockCoord::containing(-1, -32, -33, size), BlockCoord::new(-1, -1, -2));
    }

    #[test]
    fn partition_splits_spans_on_block_boundaries() {
        let size = BlockSize::new(8, 4, 4);
        let rles = RunLengthSet::from_spans([Span::new(-2, 1, 0, 20), Span::new(3, 5, 0, 2)]);
        let blocks = BlockRles::partition(&rles, size).expect("partition");

        assert_eq!(
            blocks.sorted_blocks(),
            vec![
                BlockCoord::new(-1, 0, 0),
                BlockCoord::new(0, 0, 0),
                BlockCoord::new(1, 0, 0),
                BlockCoord::new(2, 0, 0),
                BlockCoord::new(0, 1, 0),
            ]
        );
        assert_eq!(
            blocks.get(&BlockCoord::new(-1, 0, 0)).expect("block").spans(),
            &[Span::new(-2, 1, 0, 2)]
        );
        assert_eq!(
            blocks.get(&BlockCoord::new(0, 0, 0)).expect("block").spans(),
            &[Span::new(0, 1, 0, 8)]
        );
        assert_eq!(
            blocks.get(&BlockCoord::new(2, 0, 0)).expect("block").spans(),
            &[Span::new(16, 1, 0, 2)]
        );
        assert_eq!(blocks.num_voxels(), rles.num_voxels());
        assert_eq!(blocks.flatten(), rles);
    }

    #[test]
    fn partition_handles_blocks_at_the_grid_edge() {
        let size = BlockSize::cube(32);
        let last = BlockCoord::new(i32::MAX / 32, 0, 0);

        let rles = RunLengthSet::from_spans([Span::new(i32::MAX - 5, 0, 0, 1)]);
        let blocks = BlockRles::partition(&rles, size).expect("partition");
        assert_eq!(blocks.sorted_blocks(), vec![last]);

        let rles = RunLengthSet::from_spans([Span::new(i32::MAX - 40, 0, 0, 40)]);
        let blocks = BlockRles::partition(&rles, size).expect("partition");
        assert_eq!(
            blocks.sorted_blocks(),
            vec![BlockCoord::new(i32::MAX / 32 - 1, 0, 0), last]
        );
        assert_eq!(
            blocks.get(&last).expect("block").spans(),
            &[Span::new(i32::MAX - 31, 0, 0, 31)]
        );
        assert_eq!(blocks.num_voxels(), 40);
    }

    #[test]
    fn partition_rejects_span_past_the_grid() {
        let rles = RunLengthSet::from_spans([Span::new(i32::MAX - 2, 0, 0, 10)]);
        let err = BlockRles::partition(&rles, BlockSize::cube(32)).expect_err("overhang");
        assert!(err.to_string().contains("past the end"), "{err}");
    }

    #[test]
    fn partition_rejects_degenerate_block_size() {
        let rles = RunLengthSet::from_spans([Span::new(0, 0, 0, 1)]);
        assert!(BlockRles::partition(&rles, BlockSize::new(0, 1, 1)).is_err());
    }
}
