//! Sparse volume encoding.
//!
//! Layout (little-endian):
//!
//! ```text
//! [0]     payload descriptor, always 0
//! [1]     number of dimensions, always 3
//! [2]     dimension of the run, always 0 (X)
//! [3]     reserved
//! [4..8]  u32 voxel count (0 when unknown)
//! [8..12] u32 span count
//! then per span: i32 x, i32 y, i32 z, i32 length
//! ```

use std::io::Read;

use anyhow::Context;

use crate::rle::{put_span, read_span, read_u32, RunLengthSet, Span};

pub const SPARSEVOL_HEADER_LEN: usize = 12;

const SPAN_BYTES: usize = 16;

pub fn encode_sparsevol(rles: &RunLengthSet) -> Vec<u8> {
    let mut out = Vec::with_capacity(SPARSEVOL_HEADER_LEN + rles.len() * SPAN_BYTES);
    out.extend_from_slice(&[0, 3, 0, 0]);
    let voxels = u32::try_from(rles.num_voxels()).unwrap_or(0);
    out.extend_from_slice(&voxels.to_le_bytes());
    out.extend_from_slice(&(rles.len() as u32).to_le_bytes());
    for span in rles {
        put_span(&mut out, span);
    }
    out
}

pub fn decode_sparsevol(data: &[u8]) -> anyhow::Result<RunLengthSet> {
    anyhow::ensure!(
        data.len() >= SPARSEVOL_HEADER_LEN,
        "sparsevol has {} bytes, shorter than its header",
        data.len()
    );
    check_header(&data[..4])?;
    let mut offset = 4usize;
    let _voxels = read_u32(data, &mut offset)?;
    let count = read_u32(data, &mut offset)? as usize;
    anyhow::ensure!(
        data.len() - offset == count * SPAN_BYTES,
        "sparsevol declares {count} spans but carries {} payload bytes",
        data.len() - offset
    );
    let mut spans = Vec::with_capacity(count);
    for _ in 0..count {
        spans.push(read_span(data, &mut offset)?);
    }
    Ok(RunLengthSet::from_spans(spans))
}

/// Read one sparsevol from a stream, consuming exactly its bytes.
pub fn read_sparsevol<R: Read>(mut reader: R) -> anyhow::Result<RunLengthSet> {
    let mut header = [0u8; SPARSEVOL_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .context("reading sparsevol header")?;
    check_header(&header[..4])?;
    let mut offset = 8usize;
    let count = read_u32(&header, &mut offset)? as usize;

    let mut spans: Vec<Span> = Vec::with_capacity(count.min(1 << 16));
    let mut buf = [0u8; SPAN_BYTES];
    for i in 0..count {
        reader
            .read_exact(&mut buf)
            .with_context(|| format!("reading span {i} of {count}"))?;
        let mut at = 0usize;
        spans.push(read_span(&buf, &mut at)?);
    }
    Ok(RunLengthSet::from_spans(spans))
}

fn check_header(head: &[u8]) -> anyhow::Result<()> {
    anyhow::ensure!(head[0] == 0, "unsupported sparsevol payload descriptor {}", head[0]);
    anyhow::ensure!(head[1] == 3, "sparsevol has {} dimensions, expected 3", head[1]);
    anyhow::ensure!(head[2] == 0, "sparsevol runs along dimension {}, expected 0", head[2]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunLengthSet {
        RunLengthSet::from_spans([Span::new(0, 0, 0, 10), Span::new(-4, 2, 7, 3)])
    }

    #[test]
    fn header_carries_counts() {
        let bytes = encode_sparsevol(&sample());
        assert_eq!(bytes.len(), SPARSEVOL_HEADER_LEN + 2 * SPAN_BYTES);
        assert_eq!(&bytes[..4], &[0, 3, 0, 0]);
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 13);
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 2);
        assert_eq!(decode_sparsevol(&bytes).expect("decode"), sample());
    }

    #[test]
    fn stream_reader_stops_after_one_volume() {
        let mut bytes = encode_sparsevol(&sample());
        bytes.extend_from_slice(b"trailing");
        let mut cursor = std::io::Cursor::new(bytes);
        let rles = read_sparsevol(&mut cursor).expect("read");
        assert_eq!(rles, sample());
        assert_eq!(cursor.position() as usize, SPARSEVOL_HEADER_LEN + 2 * SPAN_BYTES);
    }

    #[test]
    fn rejects_bad_header_and_short_body() {
        let mut bytes = encode_sparsevol(&sample());
        bytes[1] = 2;
        assert!(decode_sparsevol(&bytes).is_err());

        let bytes = encode_sparsevol(&sample());
        let short = &bytes[..bytes.len() - 1];
        assert!(decode_sparsevol(short).is_err());
        let err = read_sparsevol(short).expect_err("short stream");
        assert!(err.to_string().contains("span 1 of 2"), "{err}");
    }
}
