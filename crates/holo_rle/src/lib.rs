//! Run-length voxel sets for labeled volumes.
//!
//! This crate provides the sparse voxel representation shared by the label
//! volume orchestrator and the dense block sync: spans along X, normalized
//! span sets, block coordinates with sortable keys, block partitioning, the
//! binary encodings, and span subtraction used when a label is split.

mod block;
mod diff;
mod rle;
mod sparsevol;

pub use block::{BlockCoord, BlockRles, BlockSize, BLOCK_KEY_LEN};
pub use diff::{diff_rles, BlockDiff};
pub use rle::{Excised, RunLengthSet, Span};
pub use sparsevol::{decode_sparsevol, encode_sparsevol, read_sparsevol, SPARSEVOL_HEADER_LEN};

/// Identifier of a segmented object.
pub type Label = u64;
