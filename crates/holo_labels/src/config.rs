//! Volume and sync engine configuration.

use std::env;
use std::fmt;
use std::str::FromStr;

use holo_rle::BlockSize;

pub const DEFAULT_SYNC_WORKERS: usize = 32;
pub const DEFAULT_MERGE_QUEUE: usize = 100;
pub const DEFAULT_SPLIT_QUEUE: usize = 10;
pub const DEFAULT_WORKER_QUEUE: usize = 100;

/// Compression applied to serialized dense blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Compression {
    None,
    #[default]
    Zstd,
}

impl Compression {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> anyhow::Result<Self> {
        match tag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Zstd),
            other => anyhow::bail!("unknown compression tag {other}"),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

/// Checksum stored alongside serialized dense blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Checksum {
    None,
    #[default]
    Crc32,
}

impl Checksum {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Checksum::None => 0,
            Checksum::Crc32 => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> anyhow::Result<Self> {
        match tag {
            0 => Ok(Checksum::None),
            1 => Ok(Checksum::Crc32),
            other => anyhow::bail!("unknown checksum tag {other}"),
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checksum::None => write!(f, "none"),
            Checksum::Crc32 => write!(f, "crc32"),
        }
    }
}

/// Layout and encoding of one labeled volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeConfig {
    pub block_size: BlockSize,
    pub compression: Compression,
    pub checksum: Checksum,
}

impl VolumeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.block_size.validate()
    }
}

/// Parse `N` or `XxYxZ` into a block size.
pub fn parse_block_size(value: &str) -> anyhow::Result<BlockSize> {
    let parts = value
        .split(['x', 'X', ','])
        .map(|p| i32::from_str(p.trim()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| anyhow::anyhow!("invalid block size {value:?}: {err}"))?;
    let size = match parts.as_slice() {
        [n] => BlockSize::cube(*n),
        [x, y, z] => BlockSize::new(*x, *y, *z),
        _ => anyhow::bail!("invalid block size {value:?}: expected N or XxYxZ"),
    };
    size.validate()?;
    Ok(size)
}

/// Sizing of the dense-block sync engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// Number of serial block workers.
    pub workers: usize,
    /// Room for merge deltas in the sync subscription queue.
    pub merge_queue: usize,
    /// Room for split deltas. Merge and split deltas share one queue of
    /// `merge_queue + split_queue` entries.
    pub split_queue: usize,
    /// Capacity of each worker's task queue.
    pub worker_queue: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_SYNC_WORKERS,
            merge_queue: DEFAULT_MERGE_QUEUE,
            split_queue: DEFAULT_SPLIT_QUEUE,
            worker_queue: DEFAULT_WORKER_QUEUE,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `HOLO_LABELS_*` environment variables.
    /// Zero or unparsable values keep the default.
    pub fn from_env() -> Self {
        Self {
            workers: read_env_usize("HOLO_LABELS_SYNC_WORKERS", DEFAULT_SYNC_WORKERS),
            merge_queue: read_env_usize("HOLO_LABELS_MERGE_QUEUE", DEFAULT_MERGE_QUEUE),
            split_queue: read_env_usize("HOLO_LABELS_SPLIT_QUEUE", DEFAULT_SPLIT_QUEUE),
            worker_queue: read_env_usize("HOLO_LABELS_WORKER_QUEUE", DEFAULT_WORKER_QUEUE),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        if workers > 0 {
            self.workers = workers;
        }
        self
    }

    /// Clamp every knob to at least one.
    pub(crate) fn normalized(self) -> Self {
        Self {
            workers: self.workers.max(1),
            merge_queue: self.merge_queue.max(1),
            split_queue: self.split_queue.max(1),
            worker_queue: self.worker_queue.max(1),
        }
    }
}

/// Read an env var as usize with a default.
fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(v.trim()).ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
