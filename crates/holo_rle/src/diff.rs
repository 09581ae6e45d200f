//! Span subtraction for label splits.
//!
//! `diff_rles` removes a split's spans from the original spans of one block.
//! The original spans live in an index-based doubly-linked list so a span can
//! be replaced in place by its remaining fragments while the scan keeps moving
//! forward. Both inputs are sorted, so the scan is linear in the number of
//! original plus split spans.

use crate::rle::{Excised, RunLengthSet, Span};

/// Outcome of subtracting a split from one block's original spans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDiff {
    /// Original spans left after the split is removed.
    pub residual: RunLengthSet,
    /// Every original span was consumed; the block entry should be deleted.
    pub full_duplicate: bool,
}

/// Remove `split` from `original`.
///
/// `split` must be a subset of `original`. A split span that is not fully
/// covered by original spans is an error, and no partial result is returned.
pub fn diff_rles(split: &RunLengthSet, original: &RunLengthSet) -> anyhow::Result<BlockDiff> {
    anyhow::ensure!(!split.is_empty(), "diff_rles called with no splits");

    let mut list = SpanList::from_sorted(original.spans());
    let mut cursor = list.head;

    for cut in split {
        let cut_end = cut.end_x();
        // Portion of `cut` not yet removed from the list.
        let mut pending = *cut;
        loop {
            let Some(idx) = cursor else {
                anyhow::bail!("split RLE {cut} is not contained in original RLE");
            };
            let span = list.span(idx);
            let Some(excised) = span.excise(&pending) else {
                if span_is_past(&span, &pending) {
                    anyhow::bail!("split RLE {cut} is not contained in original RLE");
                }
                cursor = list.next(idx);
                continue;
            };
            anyhow::ensure!(
                pending.x >= span.x,
                "split RLE {cut} is not contained in original RLE"
            );

            let span_end = span.end_x();
            let (last, after) = match excised {
                Excised::Consumed => {
                    let next = list.remove(idx);
                    (None, next)
                }
                Excised::Trimmed(frag) => {
                    let frag_idx = list.insert_after(idx, frag);
                    let next = list.remove(idx);
                    (Some(frag_idx), next)
                }
                Excised::Split(left, right) => {
                    list.insert_before(idx, left);
                    let right_idx = list.insert_after(idx, right);
                    let next = list.remove(idx);
                    (Some(right_idx), next)
                }
            };

            if cut_end > span_end {
                // The cut runs past this span and must continue into the
                // next one without a gap.
                pending = Span::new(span_end, cut.y, cut.z, cut_end - span_end);
                cursor = after;
                continue;
            }
            cursor = last.or(after);
            break;
        }
    }

    let residual = RunLengthSet::from_spans(list.into_spans());
    let full_duplicate = residual.is_empty();
    Ok(BlockDiff {
        residual,
        full_duplicate,
    })
}

/// Whether `span` starts at or after the end of `pending` in scan order.
fn span_is_past(span: &Span, pending: &Span) -> bool {
    (span.z, span.y, span.x) >= (pending.z, pending.y, pending.end_x())
}

#[derive(Clone, Copy, Debug)]
struct Node {
    span: Span,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked span list backed by a vector arena.
///
/// Removed nodes stay in the arena but are unlinked; `len` counts live nodes.
struct SpanList {
    nodes: Vec<Node>,
    head: Option<usize>,
    len: usize,
}

impl SpanList {
    /// `spans` must already be in span order.
    fn from_sorted(spans: &[Span]) -> Self {
        debug_assert!(spans.windows(2).all(|pair| pair[0] <= pair[1]));
        let count = spans.len();
        let nodes = spans
            .iter()
            .copied()
            .enumerate()
            .map(|(i, span)| Node {
                span,
                prev: i.checked_sub(1),
                next: (i + 1 < count).then_some(i + 1),
            })
            .collect();
        Self {
            nodes,
            head: (count > 0).then_some(0),
            len: count,
        }
    }

    fn span(&self, idx: usize) -> Span {
        self.nodes[idx].span
    }

    fn next(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].next
    }

    fn insert_before(&mut self, idx: usize, span: Span) -> usize {
        let new_idx = self.nodes.len();
        let prev = self.nodes[idx].prev;
        self.nodes.push(Node {
            span,
            prev,
            next: Some(idx),
        });
        match prev {
            Some(p) => self.nodes[p].next = Some(new_idx),
            None => self.head = Some(new_idx),
        }
        self.nodes[idx].prev = Some(new_idx);
        self.len += 1;
        new_idx
    }

    fn insert_after(&mut self, idx: usize, span: Span) -> usize {
        let new_idx = self.nodes.len();
        let next = self.nodes[idx].next;
        self.nodes.push(Node {
            span,
            prev: Some(idx),
            next,
        });
        if let Some(n) = next {
            self.nodes[n].prev = Some(new_idx);
        }
        self.nodes[idx].next = Some(new_idx);
        self.len += 1;
        new_idx
    }

    /// Unlink `idx`, returning the node that followed it.
    fn remove(&mut self, idx: usize) -> Option<usize> {
        let Node { prev, next, .. } = self.nodes[idx];
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            self.nodes[n].prev = prev;
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
        self.len -= 1;
        next
    }

    fn into_spans(self) -> Vec<Span> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            out.push(self.nodes[idx].span);
            cursor = self.nodes[idx].next;
        }
        out
    }
}
