//! Spans and normalized span sets.
//!
//! A `Span` is a run of voxels along X starting at `(x, y, z)`. A
//! `RunLengthSet` keeps spans sorted in Z, then Y, then X order with no two
//! spans overlapping or touching; touching runs are coalesced on construction.

use std::cmp::Ordering;
use std::fmt;

/// Bytes used by one encoded span (`x`, `y`, `z`, `length` as i32).
const SPAN_BYTES: usize = 16;

/// A run of `length` voxels along X starting at `(x, y, z)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub length: i32,
}

/// Result of removing one span from another that it intersects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Excised {
    /// The cut covers the whole span.
    Consumed,
    /// The cut touched one edge; the remaining fragment is returned.
    Trimmed(Span),
    /// The cut was strictly interior; left and right fragments remain.
    Split(Span, Span),
}

impl Span {
    pub const fn new(x: i32, y: i32, z: i32, length: i32) -> Self {
        Self { x, y, z, length }
    }

    /// Exclusive end coordinate along X.
    pub fn end_x(&self) -> i32 {
        self.x.saturating_add(self.length)
    }

    /// Whether both spans lie on the same (y, z) row.
    pub fn same_row(&self, other: &Span) -> bool {
        self.y == other.y && self.z == other.z
    }

    pub fn intersects(&self, other: &Span) -> bool {
        self.same_row(other) && self.x < other.end_x() && other.x < self.end_x()
    }

    /// Remove `cut` from this span.
    ///
    /// Returns `None` when the spans do not intersect.
    pub fn excise(&self, cut: &Span) -> Option<Excised> {
        if !self.intersects(cut) {
            return None;
        }
        let left = cut.x - self.x;
        let right = self.end_x() - cut.end_x();
        let left_frag = Span { length: left, ..*self };
        let right_frag = Span {
            x: cut.end_x(),
            length: right,
            ..*self
        };
        Some(match (left > 0, right > 0) {
            (false, false) => Excised::Consumed,
            (true, false) => Excised::Trimmed(left_frag),
            (false, true) => Excised::Trimmed(right_frag),
            (true, true) => Excised::Split(left_frag, right_frag),
        })
    }

    fn row_key(&self) -> (i32, i32) {
        (self.z, self.y)
    }
}

impl Ord for Span {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.z, self.y, self.x, self.length).cmp(&(other.z, other.y, other.x, other.length))
    }
}

impl PartialOrd for Span {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})+{}", self.x, self.y, self.z, self.length)
    }
}

/// Sorted, disjoint spans. Runs on one row touch only when they are too
/// long for a single span.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunLengthSet {
    spans: Vec<Span>,
}

impl RunLengthSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a normalized set: sorts, drops empty spans and coalesces
    /// overlapping or touching runs on the same row.
    pub fn from_spans(spans: impl IntoIterator<Item = Span>) -> Self {
        let mut spans: Vec<Span> = spans.into_iter().filter(|s| s.length > 0).collect();
        spans.sort_unstable();
        Self {
            spans: coalesce(spans),
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Span> {
        self.spans.iter()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn num_voxels(&self) -> u64 {
        self.spans.iter().map(|s| s.length as u64).sum()
    }

    /// Union `other` into this set.
    pub fn add(&mut self, other: &RunLengthSet) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.spans = other.spans.clone();
            return;
        }
        let mut merged = Vec::with_capacity(self.spans.len() + other.spans.len());
        let (mut a, mut b) = (self.spans.iter().peekable(), other.spans.iter().peekable());
        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(x), Some(y)) => {
                    if x <= y {
                        a.next()
                    } else {
                        b.next()
                    }
                }
                (Some(_), None) => a.next(),
                (None, Some(_)) => b.next(),
                (None, None) => break,
            };
            if let Some(span) = next {
                merged.push(*span);
            }
        }
        self.spans = coalesce(merged);
    }

    pub fn contains_voxel(&self, x: i32, y: i32, z: i32) -> bool {
        let probe = Span::new(x, y, z, 1);
        let idx = self.spans.partition_point(|s| {
            s.row_key() < probe.row_key() || (s.row_key() == probe.row_key() && s.x <= x)
        });
        idx > 0 && self.spans[idx - 1].intersects(&probe)
    }

    /// Encode as `u32` span count followed by `x, y, z, length` per span
    /// (all little-endian).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.spans.len() * SPAN_BYTES);
        out.extend_from_slice(&(self.spans.len() as u32).to_le_bytes());
        for span in &self.spans {
            put_span(&mut out, span);
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let count = read_u32(data, &mut offset)? as usize;
        anyhow::ensure!(
            data.len() - offset == count * SPAN_BYTES,
            "span payload has {} bytes, expected {} for {count} spans",
            data.len() - offset,
            count * SPAN_BYTES
        );
        let mut spans = Vec::with_capacity(count);
        for _ in 0..count {
            spans.push(read_span(data, &mut offset)?);
        }
        Ok(Self::from_spans(spans))
    }
}

impl FromIterator<Span> for RunLengthSet {
    fn from_iter<I: IntoIterator<Item = Span>>(iter: I) -> Self {
        Self::from_spans(iter)
    }
}

impl<'a> IntoIterator for &'a RunLengthSet {
    type Item = &'a Span;
    type IntoIter = std::slice::Iter<'a, Span>;

    fn into_iter(self) -> Self::IntoIter {
        self.spans.iter()
    }
}

/// Coalesce a sorted span list in place.
///
/// A merged run too long for one span's length continues in a second span
/// starting where the first ends.
fn coalesce(sorted: Vec<Span>) -> Vec<Span> {
    let mut out: Vec<Span> = Vec::with_capacity(sorted.len());
    for span in sorted {
        let Some(last) = out.last_mut() else {
            out.push(span);
            continue;
        };
        if !last.same_row(&span) || span.x > last.end_x() {
            out.push(span);
            continue;
        }
        let end = i64::from(last.end_x().max(span.end_x()));
        let mut x = i64::from(last.x);
        let mut length = (end - x).min(i64::from(i32::MAX));
        last.length = length as i32;
        x += length;
        while x < end {
            length = (end - x).min(i64::from(i32::MAX));
            out.push(Span::new(x as i32, span.y, span.z, length as i32));
            x += length;
        }
    }
    out
}

pub(crate) fn put_span(out: &mut Vec<u8>, span: &Span) {
    out.extend_from_slice(&span.x.to_le_bytes());
    out.extend_from_slice(&span.y.to_le_bytes());
    out.extend_from_slice(&span.z.to_le_bytes());
    out.extend_from_slice(&span.length.to_le_bytes());
}

pub(crate) fn read_span(data: &[u8], offset: &mut usize) -> anyhow::Result<Span> {
    let x = read_i32(data, offset)?;
    let y = read_i32(data, offset)?;
    let z = read_i32(data, offset)?;
    let length = read_i32(data, offset)?;
    anyhow::ensure!(length > 0, "span at ({x},{y},{z}) has non-positive length {length}");
    Ok(Span { x, y, z, length })
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_i32(data: &[u8], offset: &mut usize) -> anyhow::Result<i32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short i32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(i32::from_le_bytes(buf))
}
