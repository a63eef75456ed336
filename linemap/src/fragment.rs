//! Leaf entities of the linemap: resident and unmapped runs.

use crate::{
    layout::{layout_span, LayoutDelta, WidthTable},
    sum_tree::{Dimension, Item, SeekTarget, Summary},
    utf8_seq_len,
};
use std::{
    cmp::Ordering,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
};

/// Resident runs are kept at or below this length so that inspecting one on
/// the interactive path is bounded work. Unmapped runs have no size limit.
pub const MAX_FRAGMENT_BYTES: u64 = 8 * 1024;

/// Identity of a fragment, used by the background scan to detect that a
/// fragment it planned to transform was edited in the meantime. Never reused;
/// every split or trim mints fresh ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId(u64);

impl FragmentId {
    pub(crate) fn mint() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// Where a run's bytes live.
#[derive(Debug, Clone)]
pub enum Backing {
    /// This offset of the backing file.
    File(u64),
    /// Bytes owned by the buffer itself (typed or pasted). Splits share the
    /// allocation.
    Literal { bytes: Arc<[u8]>, start: usize },
}

impl Backing {
    pub fn literal(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Literal {
            bytes: bytes.into(),
            start: 0,
        }
    }

    /// The same backing shifted `by` bytes forward.
    pub fn offset(&self, by: u64) -> Self {
        match self {
            Self::File(off) => Self::File(off + by),
            Self::Literal { bytes, start } => Self::Literal {
                bytes: bytes.clone(),
                start: start + by as usize,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum Kind {
    /// Layout of the run is known.
    Resident { delta: LayoutDelta, widest: f64 },
    /// The run occupies virtual-offset space but its layout is unknown.
    Unmapped,
}

/// A leaf of the linemap: a run of `len` bytes of buffer content.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub id: FragmentId,
    pub len: u64,
    pub backing: Backing,
    pub kind: Kind,
}

impl Fragment {
    pub fn resident(len: u64, backing: Backing, delta: LayoutDelta, widest: f64) -> Self {
        debug_assert!(len > 0 && len <= MAX_FRAGMENT_BYTES);
        Self {
            id: FragmentId::mint(),
            len,
            backing,
            kind: Kind::Resident { delta, widest },
        }
    }

    pub fn unmapped(len: u64, backing: Backing) -> Self {
        debug_assert!(len > 0);
        Self {
            id: FragmentId::mint(),
            len,
            backing,
            kind: Kind::Unmapped,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.kind, Kind::Resident { .. })
    }

    /// The backing file range for a `rel` sub-range of this run, if it is
    /// file-backed.
    pub fn file_range(&self, rel: Range<u64>) -> Option<Range<u64>> {
        match self.backing {
            Backing::File(off) => Some(off + rel.start..off + rel.end),
            Backing::Literal { .. } => None,
        }
    }

    /// The bytes of a `rel` sub-range when they are owned by the buffer.
    pub fn literal_bytes(&self, rel: Range<u64>) -> Option<&[u8]> {
        match &self.backing {
            Backing::Literal { bytes, start } => {
                Some(&bytes[start + rel.start as usize..start + rel.end as usize])
            }
            Backing::File(_) => None,
        }
    }
}

/// Monoidal roll-up of a subtree's fragments.
#[derive(Debug, Clone)]
pub struct FragmentSummary {
    pub len: u64,
    /// True only if every descendant run is resident; `delta` is meaningless
    /// otherwise.
    pub mapped: bool,
    pub delta: LayoutDelta,
    /// Lower bound on the widest line wholly contained in the subtree's
    /// resident runs. Conservatively small by construction.
    pub max_width: f64,
}

impl Default for FragmentSummary {
    fn default() -> Self {
        Self {
            len: 0,
            mapped: true,
            delta: LayoutDelta::ZERO,
            max_width: 0.0,
        }
    }
}

impl Summary for FragmentSummary {
    fn add(&mut self, other: &Self) {
        self.len += other.len;
        if self.mapped && other.mapped {
            self.delta = self.delta.then(other.delta);
        } else {
            self.mapped = false;
            self.delta = LayoutDelta::ZERO;
        }
        self.max_width = self.max_width.max(other.max_width);
    }
}

impl Item for Fragment {
    type Summary = FragmentSummary;

    fn summary(&self) -> FragmentSummary {
        match self.kind {
            Kind::Resident { delta, widest } => FragmentSummary {
                len: self.len,
                mapped: true,
                delta,
                max_width: widest,
            },
            Kind::Unmapped => FragmentSummary {
                len: self.len,
                mapped: false,
                delta: LayoutDelta::ZERO,
                max_width: 0.0,
            },
        }
    }
}

/// Position within the buffer, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualOffset(pub u64);

impl Dimension<FragmentSummary> for VirtualOffset {
    fn add_summary(&mut self, summary: &FragmentSummary) {
        self.0 += summary.len;
    }
}

impl SeekTarget<FragmentSummary, VirtualOffset> for VirtualOffset {
    fn cmp(&self, position: &VirtualOffset) -> Ordering {
        self.0.cmp(&position.0)
    }
}

/// Chop `bytes` into resident runs of at most [`MAX_FRAGMENT_BYTES`], split
/// on UTF-8 boundaries, sharing `backing` at successive offsets.
pub fn build_runs(bytes: &[u8], backing: &Backing, widths: &WidthTable) -> Vec<Fragment> {
    let mut runs = Vec::with_capacity(bytes.len() / MAX_FRAGMENT_BYTES as usize + 1);
    let mut at = 0usize;
    while at < bytes.len() {
        let mut end = (at + MAX_FRAGMENT_BYTES as usize).min(bytes.len());
        if end < bytes.len() {
            // Back off so the cut lands between code points.
            for back in 0..3.min(end - at) {
                let lead = bytes[end - back - 1];
                if utf8_seq_len(lead) > back + 1 {
                    end -= back + 1;
                    break;
                }
                if !crate::is_utf8_cont(lead) {
                    break;
                }
            }
        }
        let chunk = &bytes[at..end];
        let (delta, widest) = layout_span(chunk, widths);
        runs.push(Fragment::resident(
            chunk.len() as u64,
            backing.offset(at as u64),
            delta,
            widest,
        ));
        at = end;
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_composition_tracks_mapping() {
        let widths = WidthTable::uniform(1.0, 4);
        let (delta, widest) = layout_span(b"ab\ncd", &widths);
        let a = Fragment::resident(5, Backing::literal(&b"ab\ncd"[..]), delta, widest);
        let b = Fragment::unmapped(1 << 30, Backing::File(0));

        let mut s = a.summary();
        assert!(s.mapped);
        s.add(&b.summary());
        assert!(!s.mapped);
        assert_eq!(s.len, 5 + (1 << 30));

        let mut t = a.summary();
        t.add(&a.summary());
        assert!(t.mapped);
        assert_eq!(t.delta.lines, 2);
        assert_eq!(t.delta.x, 2.0);
    }

    #[test]
    fn build_runs_round_trips_length_and_layout() {
        let widths = WidthTable::uniform(1.0, 4);
        // Multi-byte characters and tabs, with a repeat length chosen so
        // chunk cuts land mid-line rather than on newlines.
        let text: String = "é日\twide x\n".repeat(1500);
        let backing = Backing::literal(text.as_bytes().to_vec());
        let runs = build_runs(text.as_bytes(), &backing, &widths);

        assert!(runs.len() > 1);
        let total: u64 = runs.iter().map(|r| r.len).sum();
        assert_eq!(total, text.len() as u64);
        assert!(runs.iter().all(|r| r.len <= MAX_FRAGMENT_BYTES));

        // Chunk edges never split a code point, and at least one falls
        // inside a line so cross-fragment composition is exercised.
        let mut cuts = Vec::new();
        let mut at = 0usize;
        for run in &runs {
            assert!(text.is_char_boundary(at));
            cuts.push(at);
            at += run.len as usize;
        }
        assert!(cuts[1..]
            .iter()
            .any(|&cut| text.as_bytes()[cut - 1] != b'\n'));

        let composed = runs
            .iter()
            .map(|r| r.summary())
            .fold(FragmentSummary::default(), |mut acc, s| {
                acc.add(&s);
                acc
            });
        let (whole, _) = layout_span(text.as_bytes(), &widths);
        assert_eq!(composed.delta.lines, whole.lines);
        assert!((composed.delta.x - whole.x).abs() < 1e-9);
    }

    #[test]
    fn backing_offsets_compose() {
        let backing = Backing::literal(&b"abcdef"[..]);
        let shifted = backing.offset(2);
        let frag = Fragment::resident(2, shifted, LayoutDelta::ZERO, 0.0);
        assert_eq!(frag.literal_bytes(0..2).unwrap(), b"cd");
        assert_eq!(frag.literal_bytes(1..2).unwrap(), b"d");

        let file = Backing::File(100).offset(20);
        let frag = Fragment::unmapped(10, file);
        assert_eq!(frag.file_range(2..6).unwrap(), 122..126);
    }
}
