//! The linemap: a balanced ordered index from virtual byte offsets to
//! spatial (line, column) positions, tolerant of unmapped regions.
//!
//! Fragments live in a [`SumTree`] keyed by virtual offset; internal nodes
//! carry composed [`FragmentSummary`]s, so every query descends by summary
//! and inspects at most a couple of bounded resident runs byte-by-byte.
//! Queries that would need bytes which are not resident return partial
//! answers carrying the file ranges that would refine them; they never block
//! and never do I/O.

use crate::{
    fragment::{build_runs, Backing, Fragment, FragmentId, Kind, VirtualOffset},
    layout::{decode_utf8, layout_span, LayoutDelta, SpatialDelta, WidthTable, REPLACEMENT_CHAR},
    sum_tree::{Bias, SumTree},
};
use std::{cmp::Ordering, ops::ControlFlow, ops::Range};
use tracing::debug;

/// Cap on how many distinct missing ranges a partial answer enumerates;
/// beyond this the caller is expected to load and re-query anyway.
const MAX_MISSING: usize = 8;

/// Supplies backing-file bytes to queries. Implemented over the sparse store
/// by the buffer; an implementation must never block on I/O -- if the bytes
/// are not at hand, it reports so and the query returns a partial answer.
pub trait ByteSource {
    fn read(&self, file_range: Range<u64>, out: &mut Vec<u8>) -> SourceStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// `out` holds the whole requested range.
    Complete,
    /// Not resident (or the store was contended); retry after the epoch moves.
    Unavailable,
    /// The range can never load.
    Failed,
}

/// A byte source with nothing to offer; useful when a query should only use
/// what the tree itself knows.
pub struct NoSource;

impl ByteSource for NoSource {
    fn read(&self, _file_range: Range<u64>, _out: &mut Vec<u8>) -> SourceStatus {
        SourceStatus::Unavailable
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    Mapped(SpatialDelta),
    /// Part of the span is unknown. `approx` composes only the mapped parts;
    /// `missing` lists (a bounded number of) file ranges that would refine it.
    Partial {
        approx: SpatialDelta,
        missing: Vec<Range<u64>>,
    },
}

impl DeltaOutcome {
    /// The delta, exact or approximate.
    pub fn best_effort(&self) -> SpatialDelta {
        match self {
            DeltaOutcome::Mapped(d) => *d,
            DeltaOutcome::Partial { approx, .. } => *approx,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, DeltaOutcome::Mapped(_))
    }
}

/// Result of [`Linemap::offset_at`].
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    pub offset: u64,
    /// Actual spatial distance from the query's base to `offset`.
    pub achieved: SpatialDelta,
    /// Set when the answer stops at the edge of an unknown region; loading
    /// this range allows refinement.
    pub missing: Option<Range<u64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Greatest offset whose spatial position is ≤ the target.
    Floor,
    /// Closest offset; ties break toward the earlier one.
    Round,
    /// Least offset whose spatial position is ≥ the target.
    Ceil,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("offset {offset} out of bounds (buffer length {len})")]
    OutOfBounds { offset: u64, len: u64 },
}

/// A unit of background layout work: one unmapped fragment (or part of one)
/// to convert into resident runs. Committing is a compare-and-swap on the
/// fragment's identity.
#[derive(Debug, Clone)]
pub struct ScanTicket {
    pub id: FragmentId,
    /// Virtual offset of the fragment when the ticket was issued.
    pub start: u64,
    pub len: u64,
    pub backing: Backing,
    /// Sub-range of the fragment (relative bytes) to lay out.
    pub replace: Range<u64>,
}

#[derive(Clone)]
pub struct Linemap {
    fragments: SumTree<Fragment>,
    epoch: u64,
}

impl Default for Linemap {
    fn default() -> Self {
        Self::new()
    }
}

impl Linemap {
    /// An empty buffer.
    pub fn new() -> Self {
        Self {
            fragments: SumTree::new(),
            epoch: 0,
        }
    }

    /// A buffer backed by a file of `len` bytes, wholly unmapped.
    pub fn open(len: u64) -> Self {
        let mut fragments = SumTree::new();
        if len > 0 {
            fragments.push(Fragment::unmapped(len, Backing::File(0)));
        }
        Self {
            fragments,
            epoch: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.fragments.summary().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advanced by every edit and every scan commit.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_fully_mapped(&self) -> bool {
        self.fragments.summary().mapped
    }

    // ---- queries ----

    /// Spatial delta from `a` to `b`.
    pub fn spatial_delta(
        &self,
        a: u64,
        b: u64,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) -> DeltaOutcome {
        let len = self.len();
        let (a, b) = (a.min(len), b.min(len));
        if a == b {
            return DeltaOutcome::Mapped(SpatialDelta::ZERO);
        }
        if a < b {
            return match self.forward_delta(a..b, source, widths) {
                (delta, true, _) => DeltaOutcome::Mapped(SpatialDelta::forward(delta)),
                (delta, false, missing) => DeltaOutcome::Partial {
                    approx: SpatialDelta::forward(delta),
                    missing,
                },
            };
        }

        // Backward: negate the line count; when lines are crossed the x
        // component is b's absolute column, which takes a walk to the start
        // of b's line.
        let (delta, mapped, mut missing) = self.forward_delta(b..a, source, widths);
        let lines = -(delta.lines as i64);
        if delta.lines == 0 {
            return if mapped {
                DeltaOutcome::Mapped(SpatialDelta::new(0, -delta.x))
            } else {
                DeltaOutcome::Partial {
                    approx: SpatialDelta::new(0, -delta.x),
                    missing,
                }
            };
        }
        match self.column_of(b, source, widths) {
            Ok(col) if mapped => DeltaOutcome::Mapped(SpatialDelta::new(lines, col)),
            Ok(col) => DeltaOutcome::Partial {
                approx: SpatialDelta::new(lines, col),
                missing,
            },
            Err(mut col_missing) => {
                missing.append(&mut col_missing);
                missing.truncate(MAX_MISSING);
                DeltaOutcome::Partial {
                    approx: SpatialDelta::new(lines, 0.0),
                    missing,
                }
            }
        }
    }

    /// The offset whose spatial position, relative to `base`, best matches
    /// `target` under `rounding`.
    pub fn offset_at(
        &self,
        base: u64,
        target: SpatialDelta,
        rounding: Rounding,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) -> Located {
        let base = base.min(self.len());
        if target.total_cmp(&SpatialDelta::ZERO) != Ordering::Less {
            return self.seek_forward(base, target, rounding, source, widths);
        }
        self.seek_backward(base, target, rounding, source, widths)
    }

    /// Maximal range around `offset` whose fragments are all resident.
    /// Degenerates to `offset..offset` inside an unmapped run.
    pub fn mapped_neighborhood(&self, offset: u64) -> Range<u64> {
        let offset = offset.min(self.len());
        let left = mapped_left(&self.fragments, 0, offset).unwrap_or(0);
        let right = mapped_right(&self.fragments, 0, offset).unwrap_or(self.len());
        left..right
    }

    /// Conservative lower bound on the widest line wholly inside `range`'s
    /// resident portion.
    pub fn max_line_width_lower_bound(&self, range: Range<u64>) -> f64 {
        let mut out: f64 = 0.0;
        width_walk(&self.fragments, 0, &range, &mut out);
        out
    }

    /// True if `offset` falls between code points, false if it provably
    /// splits one, `None` when the bytes there are not known.
    pub fn is_char_boundary(&self, offset: u64, source: &dyn ByteSource) -> Option<bool> {
        if offset == 0 || offset >= self.len() {
            return Some(true);
        }
        let mut cursor = self.fragments.cursor::<VirtualOffset>();
        cursor.seek(&VirtualOffset(offset), Bias::Right);
        let frag = cursor.item()?;
        let frag_start = cursor.start().0;
        if frag_start == offset {
            // Runs are decoded independently, so run edges act as
            // boundaries.
            return Some(true);
        }
        match frag.kind {
            Kind::Unmapped => None,
            Kind::Resident { .. } => {
                let rel = offset - frag_start;
                let mut scratch = Vec::new();
                match run_bytes(frag, rel..rel + 1, source, &mut scratch) {
                    Ok(bytes) => Some(!crate::is_utf8_cont(bytes[0])),
                    Err(_) => None,
                }
            }
        }
    }

    // ---- updates ----

    /// Insert bytes whose layout is computed immediately. The caller keeps
    /// these small (large pastes go through [`insert_deferred`]).
    ///
    /// [`insert_deferred`]: Self::insert_deferred
    pub fn insert_literal(
        &mut self,
        offset: u64,
        bytes: std::sync::Arc<[u8]>,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) -> Result<(), TreeError> {
        self.check_offset(offset)?;
        if bytes.is_empty() {
            return Ok(());
        }
        let backing = Backing::literal(bytes.clone());
        let runs = build_runs(&bytes, &backing, widths);
        self.splice(offset..offset, runs, source, widths);
        Ok(())
    }

    /// Insert a run of known length whose layout will be produced by the
    /// background scan.
    pub fn insert_deferred(
        &mut self,
        offset: u64,
        backing: Backing,
        len: u64,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) -> Result<(), TreeError> {
        self.check_offset(offset)?;
        if len == 0 {
            return Ok(());
        }
        let runs = vec![Fragment::unmapped(len, backing)];
        self.splice(offset..offset, runs, source, widths);
        Ok(())
    }

    pub fn delete(
        &mut self,
        range: Range<u64>,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) -> Result<(), TreeError> {
        self.check_offset(range.start)?;
        self.check_offset(range.end)?;
        if range.start > range.end {
            return Err(TreeError::OutOfBounds {
                offset: range.start,
                len: self.len(),
            });
        }
        if range.is_empty() {
            return Ok(());
        }
        self.splice(range, Vec::new(), source, widths);
        Ok(())
    }

    fn check_offset(&self, offset: u64) -> Result<(), TreeError> {
        if offset > self.len() {
            return Err(TreeError::OutOfBounds {
                offset,
                len: self.len(),
            });
        }
        Ok(())
    }

    fn splice(
        &mut self,
        range: Range<u64>,
        runs: Vec<Fragment>,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) {
        let mut scratch = Vec::new();
        let (keep, right) = split_at(&self.fragments, range.end, source, widths, &mut scratch);
        let (mut left, _) = split_at(&keep, range.start, source, widths, &mut scratch);
        for run in runs {
            left.push(run);
        }
        left.append(right);
        self.fragments = left;
        self.epoch += 1;
    }

    // ---- background scan ----

    /// First file-backed unmapped fragment (ending past `from`) whose backing
    /// intersects `window`. The ticket's `replace` range is the intersection.
    pub fn next_unmapped_in_window(&self, window: Range<u64>, from: u64) -> Option<ScanTicket> {
        find_unmapped(&self.fragments, 0, from, &mut |frag, start| {
            let Backing::File(off) = frag.backing else {
                return None;
            };
            let lo = window.start.max(off);
            let hi = window.end.min(off + frag.len);
            (lo < hi).then(|| ScanTicket {
                id: frag.id,
                start,
                len: frag.len,
                backing: frag.backing.clone(),
                replace: lo - off..hi - off,
            })
        })
    }

    /// First literal-backed unmapped fragment ending past `from` (a large
    /// paste awaiting layout).
    pub fn next_deferred_literal(&self, from: u64) -> Option<ScanTicket> {
        find_unmapped(&self.fragments, 0, from, &mut |frag, start| {
            matches!(frag.backing, Backing::Literal { .. }).then(|| ScanTicket {
                id: frag.id,
                start,
                len: frag.len,
                backing: frag.backing.clone(),
                replace: 0..frag.len,
            })
        })
    }

    /// Replace `replaced` (relative bytes) of the ticket's fragment with
    /// laid-out runs. Returns false -- and changes nothing -- if the fragment
    /// was edited since the ticket was issued. Idempotent: a resolved region
    /// is no longer unmapped, so overlapping tickets simply stop matching.
    pub fn commit_scan(
        &mut self,
        ticket: &ScanTicket,
        replaced: Range<u64>,
        runs: Vec<Fragment>,
    ) -> bool {
        let frag = {
            let mut cursor = self.fragments.cursor::<VirtualOffset>();
            cursor.seek(&VirtualOffset(ticket.start), Bias::Right);
            match cursor.item() {
                Some(frag) if frag.id == ticket.id && cursor.start().0 == ticket.start => {
                    frag.clone()
                }
                _ => {
                    debug!(start = ticket.start, "scan commit discarded; fragment changed");
                    return false;
                }
            }
        };
        debug_assert_eq!(
            runs.iter().map(|r| r.len).sum::<u64>(),
            replaced.end - replaced.start
        );

        let left = self
            .fragments
            .slice_to::<VirtualOffset, _>(&VirtualOffset(ticket.start), Bias::Right);
        let right = self
            .fragments
            .suffix_from::<VirtualOffset, _>(&VirtualOffset(ticket.start + frag.len), Bias::Right);

        let mut rebuilt = left;
        if replaced.start > 0 {
            rebuilt.push(Fragment::unmapped(replaced.start, frag.backing.clone()));
        }
        for run in runs {
            rebuilt.push(run);
        }
        if replaced.end < frag.len {
            rebuilt.push(Fragment::unmapped(
                frag.len - replaced.end,
                frag.backing.offset(replaced.end),
            ));
        }
        rebuilt.append(right);
        self.fragments = rebuilt;
        self.epoch += 1;
        true
    }

    /// The buffer's runs in virtual-offset order. Cloning the map first (it
    /// is a cheap copy-on-write snapshot) lets background jobs walk this
    /// without holding any lock.
    pub fn runs(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    /// Backing-file ranges of the runs intersecting `vrange`, merged when
    /// touching, capped at `cap` entries.
    pub fn file_ranges_in(&self, vrange: Range<u64>, cap: usize) -> Vec<Range<u64>> {
        let mut out: Vec<Range<u64>> = Vec::new();
        let mut cursor = self.fragments.cursor::<VirtualOffset>();
        cursor.seek(&VirtualOffset(vrange.start), Bias::Right);
        while let Some(frag) = cursor.item() {
            let start = cursor.start().0;
            if start >= vrange.end {
                break;
            }
            let lo = vrange.start.max(start) - start;
            let hi = vrange.end.min(start + frag.len) - start;
            if let Some(file_range) = frag.file_range(lo..hi) {
                match out.last_mut() {
                    Some(last) if last.end == file_range.start => last.end = file_range.end,
                    _ => {
                        if out.len() == cap {
                            break;
                        }
                        out.push(file_range);
                    }
                }
            }
            cursor.next();
        }
        out
    }

    // ---- internals shared with the iterator ----

    pub(crate) fn fragments(&self) -> &SumTree<Fragment> {
        &self.fragments
    }

    /// Compose layout over `range`, returning (delta over mapped parts,
    /// fully-mapped?, missing ranges).
    fn forward_delta(
        &self,
        range: Range<u64>,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) -> (LayoutDelta, bool, Vec<Range<u64>>) {
        let mut st = SpanAgg {
            range,
            source,
            widths,
            delta: LayoutDelta::ZERO,
            mapped: true,
            missing: Vec::new(),
        };
        let mut scratch = Vec::new();
        agg_walk(&self.fragments, 0, &mut st, &mut scratch);
        let mapped = st.mapped && st.missing.is_empty();
        (st.delta, mapped, st.missing)
    }

    /// Absolute column of `offset` within its line.
    fn column_of(
        &self,
        offset: u64,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) -> Result<f64, Vec<Range<u64>>> {
        let line_start = match self.line_start_back(offset, 1, source) {
            BackOutcome::Found(ls) => ls,
            BackOutcome::Top { .. } => 0,
            BackOutcome::Blocked { missing, .. } => {
                return Err(missing.into_iter().collect());
            }
        };
        match self.forward_delta(line_start..offset, source, widths) {
            (delta, true, _) => Ok(delta.x),
            (_, false, missing) => Err(missing),
        }
    }

    fn seek_forward(
        &self,
        base: u64,
        target: SpatialDelta,
        rounding: Rounding,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) -> Located {
        let mut st = SeekFwd {
            base,
            target,
            rounding,
            source,
            widths,
            acc: LayoutDelta::ZERO,
            floor: Located {
                offset: base,
                achieved: SpatialDelta::ZERO,
                missing: None,
            },
            done: None,
        };
        let mut scratch = Vec::new();
        let _ = seek_walk(&self.fragments, 0, &mut st, &mut scratch);
        st.done.unwrap_or(st.floor)
    }

    fn seek_backward(
        &self,
        base: u64,
        target: SpatialDelta,
        rounding: Rounding,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) -> Located {
        let lines_up = (-target.lines) as u64;

        // Start of the line `target.lines` above base: just past the
        // (lines_up + 1)-th newline walking left.
        let line_start = match self.line_start_back(base, lines_up + 1, source) {
            BackOutcome::Found(ls) => ls,
            BackOutcome::Top { newlines_seen } => {
                if newlines_seen < lines_up {
                    // The target line is above the top of the buffer.
                    let (achieved, missing) = self.achieved_between(base, 0, source, widths);
                    return Located {
                        offset: 0,
                        achieved,
                        missing,
                    };
                }
                0
            }
            BackOutcome::Blocked { at, seen, missing } => {
                return Located {
                    offset: at,
                    achieved: SpatialDelta::new(-(seen as i64), 0.0),
                    missing,
                };
            }
        };

        // Column target within that line. For same-line moves the target x
        // is relative to base's column; otherwise it is already absolute.
        let target_col = if target.lines == 0 {
            match self.forward_delta(line_start..base, source, widths) {
                (delta, true, _) => delta.x + target.x,
                (_, false, missing) => {
                    return Located {
                        offset: base,
                        achieved: SpatialDelta::ZERO,
                        missing: missing.into_iter().next(),
                    };
                }
            }
        } else {
            target.x
        };

        if target_col < 0.0 {
            // Before the start of the target line; the nearest positions are
            // the line start and the newline that precedes it.
            let offset = match rounding {
                Rounding::Floor => line_start.saturating_sub(1),
                Rounding::Ceil | Rounding::Round => line_start,
            };
            let (achieved, missing) = self.achieved_between(base, offset, source, widths);
            return Located {
                offset,
                achieved,
                missing,
            };
        }

        // Rounding decisions depend only on distances within the line, so
        // they are valid in line-start-relative coordinates.
        let found = self.seek_forward(
            line_start,
            SpatialDelta::new(0, target_col),
            rounding,
            source,
            widths,
        );
        let (achieved, missing) = self.achieved_between(base, found.offset, source, widths);
        Located {
            offset: found.offset,
            achieved,
            missing: found.missing.or(missing),
        }
    }

    fn achieved_between(
        &self,
        base: u64,
        offset: u64,
        source: &dyn ByteSource,
        widths: &WidthTable,
    ) -> (SpatialDelta, Option<Range<u64>>) {
        match self.spatial_delta(base, offset, source, widths) {
            DeltaOutcome::Mapped(d) => (d, None),
            DeltaOutcome::Partial { approx, missing } => (approx, missing.into_iter().next()),
        }
    }

    /// Walk left from `limit` until `need` newlines have been seen; yields
    /// the position just past the last one.
    fn line_start_back(&self, limit: u64, need: u64, source: &dyn ByteSource) -> BackOutcome {
        let mut st = BackState {
            limit,
            need,
            seen: 0,
            source,
        };
        let mut scratch = Vec::new();
        match back_walk(&self.fragments, 0, &mut st, &mut scratch) {
            ControlFlow::Break(stop) => stop,
            ControlFlow::Continue(()) => BackOutcome::Top {
                newlines_seen: st.seen,
            },
        }
    }

    /// Check internal invariants; returns a description of the first
    /// violation found. Violations are fatal to the owning buffer.
    pub fn verify(&self) -> Result<(), String> {
        verify_node(&self.fragments).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum BackOutcome {
    Found(u64),
    /// Fewer than `need` newlines exist above the limit.
    Top { newlines_seen: u64 },
    /// An unknown region interrupted the walk at `at`.
    Blocked {
        at: u64,
        seen: u64,
        missing: Option<Range<u64>>,
    },
}

// ---- walkers ----

fn run_bytes<'a>(
    frag: &'a Fragment,
    rel: Range<u64>,
    source: &dyn ByteSource,
    scratch: &'a mut Vec<u8>,
) -> Result<&'a [u8], Option<Range<u64>>> {
    if let Some(bytes) = frag.literal_bytes(rel.clone()) {
        return Ok(bytes);
    }
    let file_range = frag
        .file_range(rel)
        .expect("a run is either literal or file-backed");
    scratch.clear();
    match source.read(file_range.clone(), scratch) {
        SourceStatus::Complete => Ok(scratch.as_slice()),
        SourceStatus::Unavailable => Err(Some(file_range)),
        SourceStatus::Failed => Err(None),
    }
}

fn push_missing(missing: &mut Vec<Range<u64>>, range: Option<Range<u64>>) {
    let Some(range) = range else { return };
    if missing.len() >= MAX_MISSING {
        return;
    }
    if let Some(last) = missing.last_mut() {
        if last.end == range.start {
            last.end = range.end;
            return;
        }
    }
    missing.push(range);
}

struct SpanAgg<'a> {
    range: Range<u64>,
    source: &'a dyn ByteSource,
    widths: &'a WidthTable,
    delta: LayoutDelta,
    mapped: bool,
    missing: Vec<Range<u64>>,
}

fn agg_walk(tree: &SumTree<Fragment>, node_start: u64, st: &mut SpanAgg, scratch: &mut Vec<u8>) {
    let summary = tree.summary();
    let node_end = node_start + summary.len;
    if node_end <= st.range.start || node_start >= st.range.end {
        return;
    }
    if st.range.start <= node_start && node_end <= st.range.end {
        if summary.mapped {
            st.delta = st.delta.then(summary.delta);
            return;
        }
        if st.missing.len() >= MAX_MISSING {
            st.mapped = false;
            return;
        }
    }
    if let Some(children) = tree.internal_children() {
        let mut start = node_start;
        for child in children {
            agg_walk(child, start, st, scratch);
            start += child.summary().len;
        }
    } else if let Some((items, _)) = tree.leaf_entries() {
        let mut start = node_start;
        for frag in items {
            agg_frag(frag, start, st, scratch);
            start += frag.len;
        }
    }
}

fn agg_frag(frag: &Fragment, frag_start: u64, st: &mut SpanAgg, scratch: &mut Vec<u8>) {
    let frag_end = frag_start + frag.len;
    let lo = st.range.start.max(frag_start);
    let hi = st.range.end.min(frag_end);
    if lo >= hi {
        return;
    }
    match frag.kind {
        Kind::Resident { delta, .. } => {
            if lo == frag_start && hi == frag_end {
                st.delta = st.delta.then(delta);
                return;
            }
            let rel = lo - frag_start..hi - frag_start;
            match run_bytes(frag, rel, st.source, scratch) {
                Ok(bytes) => {
                    let (delta, _) = layout_span(bytes, st.widths);
                    st.delta = st.delta.then(delta);
                }
                Err(miss) => {
                    st.mapped = false;
                    push_missing(&mut st.missing, miss);
                }
            }
        }
        Kind::Unmapped => {
            st.mapped = false;
            push_missing(&mut st.missing, frag.file_range(lo - frag_start..hi - frag_start));
        }
    }
}

struct SeekFwd<'a> {
    base: u64,
    target: SpatialDelta,
    rounding: Rounding,
    source: &'a dyn ByteSource,
    widths: &'a WidthTable,
    /// Layout composed over `[base, current position)`.
    acc: LayoutDelta,
    /// Best known position with spatial ≤ target.
    floor: Located,
    done: Option<Located>,
}

fn seek_walk(
    tree: &SumTree<Fragment>,
    node_start: u64,
    st: &mut SeekFwd,
    scratch: &mut Vec<u8>,
) -> ControlFlow<()> {
    let summary = tree.summary();
    let node_end = node_start + summary.len;
    if node_end <= st.base {
        return ControlFlow::Continue(());
    }
    if node_start >= st.base && summary.mapped {
        let composed = st.acc.then(summary.delta);
        if SpatialDelta::forward(composed).total_cmp(&st.target) == Ordering::Less {
            st.acc = composed;
            st.floor = Located {
                offset: node_end,
                achieved: SpatialDelta::forward(composed),
                missing: None,
            };
            return ControlFlow::Continue(());
        }
    }
    if let Some(children) = tree.internal_children() {
        let mut start = node_start;
        for child in children {
            seek_walk(child, start, st, scratch)?;
            start += child.summary().len;
        }
        ControlFlow::Continue(())
    } else if let Some((items, _)) = tree.leaf_entries() {
        let mut start = node_start;
        for frag in items {
            seek_frag(frag, start, st, scratch)?;
            start += frag.len;
        }
        ControlFlow::Continue(())
    } else {
        ControlFlow::Continue(())
    }
}

fn seek_frag(
    frag: &Fragment,
    frag_start: u64,
    st: &mut SeekFwd,
    scratch: &mut Vec<u8>,
) -> ControlFlow<()> {
    let frag_end = frag_start + frag.len;
    if frag_end <= st.base {
        return ControlFlow::Continue(());
    }
    let from = st.base.max(frag_start);

    let delta = match frag.kind {
        Kind::Unmapped => {
            st.done = Some(Located {
                offset: from,
                achieved: SpatialDelta::forward(st.acc),
                missing: frag.file_range(from - frag_start..frag.len),
            });
            return ControlFlow::Break(());
        }
        Kind::Resident { delta, .. } => delta,
    };

    if from == frag_start {
        let composed = st.acc.then(delta);
        if SpatialDelta::forward(composed).total_cmp(&st.target) == Ordering::Less {
            st.acc = composed;
            st.floor = Located {
                offset: frag_end,
                achieved: SpatialDelta::forward(composed),
                missing: None,
            };
            return ControlFlow::Continue(());
        }
    }

    let rel = from - frag_start..frag.len;
    let bytes = match run_bytes(frag, rel, st.source, scratch) {
        Ok(bytes) => bytes,
        Err(miss) => {
            st.done = Some(Located {
                offset: from,
                achieved: SpatialDelta::forward(st.acc),
                missing: miss,
            });
            return ControlFlow::Break(());
        }
    };

    // The target falls at or inside this run; refine character by character.
    let mut acc = st.acc;
    let mut off = from;
    let mut i = 0usize;
    loop {
        let here = SpatialDelta::forward(acc);
        match here.total_cmp(&st.target) {
            Ordering::Less | Ordering::Equal => {
                if here.total_cmp(&st.target) == Ordering::Equal && st.rounding == Rounding::Ceil {
                    st.done = Some(Located {
                        offset: off,
                        achieved: here,
                        missing: None,
                    });
                    return ControlFlow::Break(());
                }
                st.floor = Located {
                    offset: off,
                    achieved: here,
                    missing: None,
                };
            }
            Ordering::Greater => {
                let ceil = Located {
                    offset: off,
                    achieved: here,
                    missing: None,
                };
                st.done = Some(match st.rounding {
                    Rounding::Floor => st.floor.clone(),
                    Rounding::Ceil => ceil,
                    Rounding::Round => {
                        let floor_gap = st.floor.achieved.distance_to(&st.target);
                        let ceil_gap = here.distance_to(&st.target);
                        if floor_gap <= ceil_gap {
                            st.floor.clone()
                        } else {
                            ceil
                        }
                    }
                });
                return ControlFlow::Break(());
            }
        }
        if off == frag_end {
            st.acc = acc;
            return ControlFlow::Continue(());
        }
        let (c, adv) = decode_utf8(&bytes[i..]);
        let c = c.unwrap_or(REPLACEMENT_CHAR);
        if c == '\n' {
            acc.lines += 1;
            acc.x = 0.0;
        } else {
            acc.x += st.widths.advance_for(c);
        }
        off += adv as u64;
        i += adv;
    }
}

struct BackState<'a> {
    limit: u64,
    need: u64,
    seen: u64,
    source: &'a dyn ByteSource,
}

fn back_walk(
    tree: &SumTree<Fragment>,
    node_start: u64,
    st: &mut BackState,
    scratch: &mut Vec<u8>,
) -> ControlFlow<BackOutcome> {
    let summary = tree.summary();
    let node_end = node_start + summary.len;
    if node_start >= st.limit {
        return ControlFlow::Continue(());
    }
    if node_end <= st.limit && summary.mapped && st.seen + summary.delta.lines < st.need {
        st.seen += summary.delta.lines;
        return ControlFlow::Continue(());
    }
    if let Some(children) = tree.internal_children() {
        let mut starts = Vec::with_capacity(children.len());
        let mut start = node_start;
        for child in children {
            starts.push(start);
            start += child.summary().len;
        }
        for (child, child_start) in children.iter().zip(starts).rev() {
            back_walk(child, child_start, st, scratch)?;
        }
        ControlFlow::Continue(())
    } else if let Some((items, _)) = tree.leaf_entries() {
        let mut starts = Vec::with_capacity(items.len());
        let mut start = node_start;
        for frag in items {
            starts.push(start);
            start += frag.len;
        }
        for (frag, frag_start) in items.iter().zip(starts).rev() {
            back_frag(frag, frag_start, st, scratch)?;
        }
        ControlFlow::Continue(())
    } else {
        ControlFlow::Continue(())
    }
}

fn back_frag(
    frag: &Fragment,
    frag_start: u64,
    st: &mut BackState,
    scratch: &mut Vec<u8>,
) -> ControlFlow<BackOutcome> {
    if frag_start >= st.limit {
        return ControlFlow::Continue(());
    }
    let upto = st.limit.min(frag_start + frag.len) - frag_start;

    match frag.kind {
        Kind::Unmapped => ControlFlow::Break(BackOutcome::Blocked {
            at: frag_start + upto,
            seen: st.seen,
            missing: frag.file_range(0..upto),
        }),
        Kind::Resident { delta, .. } => {
            if upto == frag.len && delta.lines == 0 {
                return ControlFlow::Continue(());
            }
            if upto == frag.len && st.seen + delta.lines < st.need {
                st.seen += delta.lines;
                return ControlFlow::Continue(());
            }
            let bytes = match run_bytes(frag, 0..upto, st.source, scratch) {
                Ok(bytes) => bytes,
                Err(missing) => {
                    return ControlFlow::Break(BackOutcome::Blocked {
                        at: frag_start + upto,
                        seen: st.seen,
                        missing,
                    });
                }
            };
            let count = bytes.iter().filter(|&&b| b == b'\n').count() as u64;
            if st.seen + count < st.need {
                st.seen += count;
                return ControlFlow::Continue(());
            }
            // The (need - seen)-th newline from the right of this portion.
            let mut remaining = st.need - st.seen;
            for (i, &b) in bytes.iter().enumerate().rev() {
                if b == b'\n' {
                    remaining -= 1;
                    if remaining == 0 {
                        return ControlFlow::Break(BackOutcome::Found(frag_start + i as u64 + 1));
                    }
                }
            }
            unreachable!("newline count said the target was here");
        }
    }
}

fn mapped_left(tree: &SumTree<Fragment>, node_start: u64, limit: u64) -> Option<u64> {
    let summary = tree.summary();
    if node_start >= limit || summary.mapped {
        return None;
    }
    if let Some(children) = tree.internal_children() {
        let mut starts = Vec::with_capacity(children.len());
        let mut start = node_start;
        for child in children {
            starts.push(start);
            start += child.summary().len;
        }
        for (child, child_start) in children.iter().zip(starts).rev() {
            if let Some(stop) = mapped_left(child, child_start, limit) {
                return Some(stop);
            }
        }
        None
    } else {
        let (items, _) = tree.leaf_entries()?;
        let mut starts = Vec::with_capacity(items.len());
        let mut start = node_start;
        for frag in items {
            starts.push(start);
            start += frag.len;
        }
        for (frag, frag_start) in items.iter().zip(starts).rev() {
            if frag_start >= limit {
                continue;
            }
            if !frag.is_mapped() {
                return Some((frag_start + frag.len).min(limit));
            }
        }
        None
    }
}

fn mapped_right(tree: &SumTree<Fragment>, node_start: u64, limit: u64) -> Option<u64> {
    let summary = tree.summary();
    let node_end = node_start + summary.len;
    if node_end <= limit || summary.mapped {
        return None;
    }
    if let Some(children) = tree.internal_children() {
        let mut start = node_start;
        for child in children {
            if let Some(stop) = mapped_right(child, start, limit) {
                return Some(stop);
            }
            start += child.summary().len;
        }
        None
    } else {
        let (items, _) = tree.leaf_entries()?;
        let mut start = node_start;
        for frag in items {
            let frag_end = start + frag.len;
            if frag_end > limit && !frag.is_mapped() {
                return Some(start.max(limit));
            }
            start = frag_end;
        }
        None
    }
}

fn width_walk(tree: &SumTree<Fragment>, node_start: u64, range: &Range<u64>, out: &mut f64) {
    let summary = tree.summary();
    let node_end = node_start + summary.len;
    if node_end <= range.start || node_start >= range.end {
        return;
    }
    if range.start <= node_start && node_end <= range.end {
        *out = out.max(summary.max_width);
        return;
    }
    if let Some(children) = tree.internal_children() {
        let mut start = node_start;
        for child in children {
            width_walk(child, start, range, out);
            start += child.summary().len;
        }
    } else if let Some((items, _)) = tree.leaf_entries() {
        let mut start = node_start;
        for frag in items {
            let frag_end = start + frag.len;
            if range.start <= start && frag_end <= range.end {
                if let Kind::Resident { widest, .. } = frag.kind {
                    *out = out.max(widest);
                }
            }
            start = frag_end;
        }
    }
}

fn find_unmapped(
    tree: &SumTree<Fragment>,
    node_start: u64,
    from: u64,
    filter: &mut dyn FnMut(&Fragment, u64) -> Option<ScanTicket>,
) -> Option<ScanTicket> {
    let summary = tree.summary();
    let node_end = node_start + summary.len;
    if node_end <= from || summary.mapped {
        return None;
    }
    if let Some(children) = tree.internal_children() {
        let mut start = node_start;
        for child in children {
            if let Some(ticket) = find_unmapped(child, start, from, filter) {
                return Some(ticket);
            }
            start += child.summary().len;
        }
        None
    } else {
        let (items, _) = tree.leaf_entries()?;
        let mut start = node_start;
        for frag in items {
            let frag_end = start + frag.len;
            if frag_end > from && !frag.is_mapped() {
                if let Some(ticket) = filter(frag, start) {
                    return Some(ticket);
                }
            }
            start = frag_end;
        }
        None
    }
}

fn verify_node(tree: &SumTree<Fragment>) -> Result<crate::fragment::FragmentSummary, String> {
    use crate::fragment::FragmentSummary;
    use crate::sum_tree::Item as _;
    use crate::sum_tree::Summary as _;

    let mut composed = FragmentSummary::default();
    if let Some(children) = tree.internal_children() {
        for child in children {
            composed.add(&verify_node(child)?);
        }
    } else if let Some((items, summaries)) = tree.leaf_entries() {
        for (frag, stored) in items.iter().zip(summaries) {
            let fresh = frag.summary();
            if fresh.len != stored.len || fresh.mapped != stored.mapped {
                return Err(format!(
                    "stale leaf summary: {:?} recorded as {:?}",
                    fresh, stored
                ));
            }
            composed.add(&fresh);
        }
    }
    let summary = tree.summary();
    if composed.len != summary.len
        || composed.mapped != summary.mapped
        || composed.delta.lines != summary.delta.lines
        || (composed.delta.x - summary.delta.x).abs() > 1e-6
    {
        return Err(format!(
            "node summary {:?} disagrees with children {:?}",
            summary, composed
        ));
    }
    Ok(composed)
}

// ---- splitting ----

fn split_at(
    tree: &SumTree<Fragment>,
    offset: u64,
    source: &dyn ByteSource,
    widths: &WidthTable,
    scratch: &mut Vec<u8>,
) -> (SumTree<Fragment>, SumTree<Fragment>) {
    let mut left = tree.slice_to::<VirtualOffset, _>(&VirtualOffset(offset), Bias::Right);
    let right = tree.suffix_from::<VirtualOffset, _>(&VirtualOffset(offset), Bias::Right);
    let left_len = left.summary().len;
    if left_len == offset {
        return (left, right);
    }

    // `offset` falls inside the first fragment of `right`; carve it.
    let frag = right
        .iter()
        .next()
        .expect("split offset beyond tree length")
        .clone();
    let cut = offset - left_len;
    let (head, tail) = split_fragment(&frag, cut, source, widths, scratch);
    let rest = right.suffix_from::<VirtualOffset, _>(&VirtualOffset(frag.len), Bias::Right);
    left.push(head);
    let mut new_right = SumTree::new();
    new_right.push(tail);
    new_right.append(rest);
    (left, new_right)
}

/// Cut a fragment at `cut` (0 < cut < len). A resident run whose bytes are
/// not at hand degrades to unmapped; the scan restores it later.
fn split_fragment(
    frag: &Fragment,
    cut: u64,
    source: &dyn ByteSource,
    widths: &WidthTable,
    scratch: &mut Vec<u8>,
) -> (Fragment, Fragment) {
    debug_assert!(cut > 0 && cut < frag.len);
    let unmapped_halves = || {
        (
            Fragment::unmapped(cut, frag.backing.clone()),
            Fragment::unmapped(frag.len - cut, frag.backing.offset(cut)),
        )
    };
    match frag.kind {
        Kind::Unmapped => unmapped_halves(),
        Kind::Resident { .. } => match run_bytes(frag, 0..frag.len, source, scratch) {
            Ok(bytes) => {
                let (head, tail) = bytes.split_at(cut as usize);
                let (head_delta, head_widest) = layout_span(head, widths);
                let (tail_delta, tail_widest) = layout_span(tail, widths);
                (
                    Fragment::resident(cut, frag.backing.clone(), head_delta, head_widest),
                    Fragment::resident(
                        frag.len - cut,
                        frag.backing.offset(cut),
                        tail_delta,
                        tail_widest,
                    ),
                )
            }
            Err(_) => unmapped_halves(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::WidthTable;
    use proptest::prelude::*;
    use std::sync::Arc;

    /// A backing file whose bytes are all at hand.
    struct FullSource(Vec<u8>);

    impl ByteSource for FullSource {
        fn read(&self, file_range: Range<u64>, out: &mut Vec<u8>) -> SourceStatus {
            if file_range.end <= self.0.len() as u64 {
                out.extend_from_slice(&self.0[file_range.start as usize..file_range.end as usize]);
                SourceStatus::Complete
            } else {
                SourceStatus::Unavailable
            }
        }
    }

    fn widths() -> WidthTable {
        WidthTable::uniform(1.0, 4)
    }

    fn literal_map(text: &str, widths: &WidthTable) -> Linemap {
        let mut map = Linemap::new();
        map.insert_literal(0, Arc::from(text.as_bytes()), &NoSource, widths)
            .unwrap();
        map.verify().unwrap();
        map
    }

    fn mapped(outcome: DeltaOutcome) -> SpatialDelta {
        match outcome {
            DeltaOutcome::Mapped(d) => d,
            other => panic!("expected a mapped delta, got {other:?}"),
        }
    }

    #[test]
    fn empty_and_tiny_buffers() {
        let w = widths();
        let map = Linemap::new();
        assert_eq!(map.len(), 0);
        assert_eq!(
            map.spatial_delta(0, 0, &NoSource, &w),
            DeltaOutcome::Mapped(SpatialDelta::ZERO)
        );
        let at = map.offset_at(0, SpatialDelta::new(3, 7.0), Rounding::Floor, &NoSource, &w);
        assert_eq!(at.offset, 0);

        let map = literal_map("x", &w);
        assert_eq!(map.len(), 1);
        let d = mapped(map.spatial_delta(0, 1, &NoSource, &w));
        assert_eq!((d.lines, d.x), (0, 1.0));
    }

    #[test]
    fn forward_deltas_match_layout() {
        let w = widths();
        let map = literal_map("abcd\nefghij\nklm", &w);
        let d = mapped(map.spatial_delta(0, 7, &NoSource, &w));
        assert_eq!((d.lines, d.x), (1, 2.0));
        let d = mapped(map.spatial_delta(2, 12, &NoSource, &w));
        assert_eq!((d.lines, d.x), (2, 0.0));
        let d = mapped(map.spatial_delta(5, 11, &NoSource, &w));
        assert_eq!((d.lines, d.x), (0, 6.0));
    }

    #[test]
    fn backward_deltas_report_absolute_columns() {
        let w = widths();
        let map = literal_map("abcd\nefghij\nklm", &w);
        // Same line: plain negative advance.
        let d = mapped(map.spatial_delta(11, 5, &NoSource, &w));
        assert_eq!((d.lines, d.x), (0, -6.0));
        // Across a line: x is the absolute column of the destination.
        let d = mapped(map.spatial_delta(7, 2, &NoSource, &w));
        assert_eq!((d.lines, d.x), (-1, 2.0));
    }

    #[test]
    fn offset_at_rounds_within_a_line() {
        let w = widths();
        let map = literal_map("abcd\nefghij\nklm", &w);
        // Target halfway through 'f' (offset 6 is at x=1 of line 1).
        let target = SpatialDelta::new(1, 1.4);
        let floor = map.offset_at(0, target, Rounding::Floor, &NoSource, &w);
        let round = map.offset_at(0, target, Rounding::Round, &NoSource, &w);
        let ceil = map.offset_at(0, target, Rounding::Ceil, &NoSource, &w);
        assert_eq!(floor.offset, 6);
        assert_eq!(round.offset, 6);
        assert_eq!(ceil.offset, 7);
        assert_eq!(floor.achieved, SpatialDelta::new(1, 1.0));
        assert_eq!(ceil.achieved, SpatialDelta::new(1, 2.0));

        let round_up = map.offset_at(0, SpatialDelta::new(1, 1.6), Rounding::Round, &NoSource, &w);
        assert_eq!(round_up.offset, 7);
    }

    #[test]
    fn offset_at_clamps_past_the_end() {
        let w = widths();
        let map = literal_map("ab\ncd", &w);
        for rounding in [Rounding::Floor, Rounding::Round, Rounding::Ceil] {
            let at = map.offset_at(0, SpatialDelta::new(9, 0.0), rounding, &NoSource, &w);
            assert_eq!(at.offset, 5, "{rounding:?}");
            assert_eq!(at.achieved, SpatialDelta::new(1, 2.0));
            assert_eq!(at.missing, None);
        }
    }

    #[test]
    fn offset_at_searches_backward() {
        let w = widths();
        let map = literal_map("abcd\nefghij\nklm", &w);
        // From 'k' (offset 12, line 2) one line up, column 2 -> 'g'.
        let at = map.offset_at(12, SpatialDelta::new(-1, 2.0), Rounding::Round, &NoSource, &w);
        assert_eq!(at.offset, 7);
        assert_eq!(at.achieved, SpatialDelta::new(-1, 2.0));
        // Two lines up, column 1 -> 'b'.
        let at = map.offset_at(12, SpatialDelta::new(-2, 1.0), Rounding::Round, &NoSource, &w);
        assert_eq!(at.offset, 1);
        // Same line, negative advance.
        let at = map.offset_at(9, SpatialDelta::new(0, -3.0), Rounding::Round, &NoSource, &w);
        assert_eq!(at.offset, 6);
        assert_eq!(at.achieved, SpatialDelta::new(0, -3.0));
        // Above the top of the buffer clamps to zero.
        let at = map.offset_at(12, SpatialDelta::new(-9, 4.0), Rounding::Floor, &NoSource, &w);
        assert_eq!(at.offset, 0);
        assert_eq!(at.achieved, SpatialDelta::new(-2, 0.0));
    }

    #[test]
    fn backward_target_past_line_end() {
        let w = widths();
        let map = literal_map("abcd\nefghij\nklm", &w);
        // One line up from 'k', column 100: the line is only 6 wide.
        let floor = map.offset_at(12, SpatialDelta::new(-1, 100.0), Rounding::Floor, &NoSource, &w);
        assert_eq!(floor.offset, 11); // at the newline ending "efghij"
        let ceil = map.offset_at(12, SpatialDelta::new(-1, 100.0), Rounding::Ceil, &NoSource, &w);
        assert_eq!(ceil.offset, 12);
    }

    #[test]
    fn huge_open_is_unmapped_and_partial() {
        let w = widths();
        let map = Linemap::open(1 << 40);
        assert_eq!(map.len(), 1 << 40);
        assert!(!map.is_fully_mapped());

        match map.spatial_delta(0, 1_000_000_000_000, &NoSource, &w) {
            DeltaOutcome::Partial { missing, .. } => {
                assert_eq!(missing, vec![0..1_000_000_000_000]);
            }
            other => panic!("expected partial, got {other:?}"),
        }

        let at = map.offset_at(0, SpatialDelta::new(5, 0.0), Rounding::Floor, &NoSource, &w);
        assert_eq!(at.offset, 0);
        assert!(at.missing.is_some());
    }

    #[test]
    fn scan_resolves_a_window_and_queries_sharpen() {
        let w = widths();
        let file: Vec<u8> = b"0123456\n".repeat(1024); // 8 KiB, 1024 lines
        let source = FullSource(file.clone());
        let mut map = Linemap::open(file.len() as u64);

        let ticket = map.next_unmapped_in_window(0..2048, 0).unwrap();
        assert_eq!(ticket.replace, 0..2048);
        let runs = build_runs(&file[..2048], &Backing::File(0), &w);
        assert!(map.commit_scan(&ticket, 0..2048, runs));
        map.verify().unwrap();

        let d = mapped(map.spatial_delta(0, 2000, &source, &w));
        assert_eq!((d.lines, d.x), (250, 0.0));

        // Past the resolved window the buffer is still unknown.
        match map.spatial_delta(0, 4096, &source, &w) {
            DeltaOutcome::Partial { missing, .. } => assert_eq!(missing, vec![2048..4096]),
            other => panic!("expected partial, got {other:?}"),
        }

        // Resolving the same window again is a no-op: nothing matches.
        assert!(map.next_unmapped_in_window(0..2048, 0).is_none());
    }

    #[test]
    fn scan_commit_is_discarded_after_an_edit() {
        let w = widths();
        let file: Vec<u8> = b"abcdefgh".repeat(512);
        let mut map = Linemap::open(file.len() as u64);

        let ticket = map.next_unmapped_in_window(0..1024, 0).unwrap();
        // An edit lands before the scan commits.
        map.insert_literal(100, Arc::from(&b"zz"[..]), &NoSource, &w)
            .unwrap();
        let runs = build_runs(&file[..1024], &Backing::File(0), &w);
        assert!(!map.commit_scan(&ticket, 0..1024, runs));

        // The freshly split unmapped pieces are scannable under new ids.
        let again = map.next_unmapped_in_window(0..1024, 0).unwrap();
        assert_ne!(again.id, ticket.id);
        let runs = build_runs(&file[..again.replace.end as usize], &Backing::File(0), &w);
        let replace = again.replace.clone();
        assert!(map.commit_scan(&again, replace, runs));
        map.verify().unwrap();
    }

    #[test]
    fn tabs_compose_across_fragment_boundaries() {
        let w = widths();
        // One long line, tabs throughout, big enough to span several runs;
        // the 8 KiB cuts land mid-line.
        let text = "seg\tment ".repeat(2000);
        let map = literal_map(&text, &w);
        let (whole, _) = crate::layout::layout_span(text.as_bytes(), &w);

        let d = mapped(map.spatial_delta(0, map.len(), &NoSource, &w));
        assert_eq!(d.lines, 0);
        assert!((d.x - whole.x).abs() < 1e-6);

        // Partition at a run boundary composes to the same delta.
        let left = mapped(map.spatial_delta(0, 8192, &NoSource, &w));
        let right = mapped(map.spatial_delta(8192, map.len(), &NoSource, &w));
        assert!((left.x + right.x - whole.x).abs() < 1e-6);

        // And a spatial target beyond the first cut round-trips exactly.
        let probe = 10_000u64;
        let delta = mapped(map.spatial_delta(0, probe, &NoSource, &w));
        let back = map.offset_at(0, delta, Rounding::Round, &NoSource, &w);
        assert_eq!(back.offset, probe);
    }

    #[test]
    fn insert_adds_a_line_between_queries() {
        let w = widths();
        let text = "a".repeat(200);
        let mut map = literal_map(&text, &w);
        let before = mapped(map.spatial_delta(0, 100, &NoSource, &w));
        map.insert_literal(100, Arc::from(&b"hello\n"[..]), &NoSource, &w)
            .unwrap();
        map.verify().unwrap();
        let after = mapped(map.spatial_delta(0, 106, &NoSource, &w));
        assert_eq!(after.lines, before.lines + 1);
        assert_eq!(after.x, 0.0);
        assert_eq!(map.len(), 206);
    }

    #[test]
    fn delete_shifts_content_under_a_sticky_target() {
        let mut w = widths();
        w.set_advance('z', 0.0); // combining-mark style zero advance
        let text: String = ["a".repeat(50), "z".repeat(100), "b".repeat(150)].concat();
        let mut map = literal_map(&text, &w);

        let at_200 = mapped(map.spatial_delta(0, 200, &NoSource, &w));
        map.delete(50..150, &NoSource, &w).unwrap();
        map.verify().unwrap();
        assert_eq!(map.len(), 200);

        let relocated = map.offset_at(0, at_200, Rounding::Floor, &NoSource, &w);
        assert_eq!(relocated.offset, 100);
    }

    #[test]
    fn deferred_paste_keeps_tail_queries_exact() {
        let w = widths();
        let text = "tail content\nwith lines\n".repeat(8);
        let mut map = literal_map(&text, &w);
        let tail_delta = mapped(map.spatial_delta(24, 48, &NoSource, &w));

        let paste: u64 = 30 << 30;
        map.insert_deferred(0, Backing::File(0), paste, &NoSource, &w)
            .unwrap();
        map.verify().unwrap();
        assert_eq!(map.len(), paste + text.len() as u64);

        // Spans that avoid the unmapped front are still exact.
        let d = mapped(map.spatial_delta(paste + 24, paste + 48, &NoSource, &w));
        assert_eq!(d, tail_delta);
        // Spans crossing it are partial.
        assert!(!map.spatial_delta(0, paste + 24, &NoSource, &w).is_mapped());
    }

    #[test]
    fn adjacent_unmapped_runs_stay_separate() {
        let w = widths();
        let mut map = literal_map("abcdef", &w);
        map.insert_deferred(3, Backing::File(1000), 10, &NoSource, &w)
            .unwrap();
        map.insert_deferred(3, Backing::File(5000), 20, &NoSource, &w)
            .unwrap();
        map.verify().unwrap();
        assert_eq!(map.len(), 6 + 30);

        // Both provenances survive: each is independently scannable.
        assert!(map.next_unmapped_in_window(1000..1010, 0).is_some());
        assert!(map.next_unmapped_in_window(5000..5020, 0).is_some());
        // Deleting across their junction leaves the remainders distinct.
        map.delete(20..26, &NoSource, &w).unwrap();
        map.verify().unwrap();
        assert!(map.next_unmapped_in_window(1000..1010, 0).is_some());
        assert!(map.next_unmapped_in_window(5000..5020, 0).is_some());
    }

    #[test]
    fn empty_edits_are_identities() {
        let w = widths();
        let mut map = literal_map("some\ntext", &w);
        let before = mapped(map.spatial_delta(0, map.len(), &NoSource, &w));
        map.insert_literal(4, Arc::from(&b""[..]), &NoSource, &w)
            .unwrap();
        map.delete(4..4, &NoSource, &w).unwrap();
        let after = mapped(map.spatial_delta(0, map.len(), &NoSource, &w));
        assert_eq!(before, after);
        assert_eq!(map.len(), 9);
    }

    #[test]
    fn edits_at_the_extremes() {
        let w = widths();
        let mut map = literal_map("middle", &w);
        map.insert_literal(0, Arc::from(&b"start\n"[..]), &NoSource, &w)
            .unwrap();
        let len = map.len();
        map.insert_literal(len, Arc::from(&b"\nend"[..]), &NoSource, &w)
            .unwrap();
        map.verify().unwrap();
        let d = mapped(map.spatial_delta(0, map.len(), &NoSource, &w));
        assert_eq!((d.lines, d.x), (2, 3.0));

        assert!(map
            .insert_literal(map.len() + 1, Arc::from(&b"x"[..]), &NoSource, &w)
            .is_err());
        let bad = map.len() + 1;
        assert!(map.delete(0..bad, &NoSource, &w).is_err());
    }

    #[test]
    fn neighborhood_tracks_unmapped_islands() {
        let w = widths();
        let mut map = literal_map(&"a".repeat(100), &w);
        assert_eq!(map.mapped_neighborhood(40), 0..100);

        map.insert_deferred(50, Backing::File(0), 10, &NoSource, &w)
            .unwrap();
        assert_eq!(map.mapped_neighborhood(20), 0..50);
        assert_eq!(map.mapped_neighborhood(80), 60..110);
        // Inside the unmapped run the neighborhood collapses.
        assert_eq!(map.mapped_neighborhood(55), 55..55);
    }

    #[test]
    fn width_bound_is_a_lower_bound() {
        let w = widths();
        let map = literal_map("short\nmuch longer line here\nmid\n", &w);
        let bound = map.max_line_width_lower_bound(0..map.len());
        assert!(bound > 0.0);
        assert!(bound <= 21.0); // "much longer line here"
        // A range that excludes the long line bounds lower.
        let narrow = map.max_line_width_lower_bound(0..6);
        assert!(narrow <= 5.0);
    }

    #[test]
    fn char_boundaries_are_validated_when_known() {
        let w = widths();
        let map = literal_map("aé日", &w); // 'é' at 1..3, '日' at 3..6
        assert_eq!(map.is_char_boundary(0, &NoSource), Some(true));
        assert_eq!(map.is_char_boundary(2, &NoSource), Some(false));
        assert_eq!(map.is_char_boundary(3, &NoSource), Some(true));
        assert_eq!(map.is_char_boundary(4, &NoSource), Some(false));
        assert_eq!(map.is_char_boundary(6, &NoSource), Some(true));

        let unmapped = Linemap::open(100);
        assert_eq!(unmapped.is_char_boundary(50, &NoSource), None);
    }

    proptest! {
        /// Round-tripping through spatial space recovers the exact offset on
        /// fully resident buffers, in both directions.
        #[test]
        fn offset_at_round_trips(
            text in "[a-z \\té日\\n]{1,200}",
            a_frac in 0.0f64..1.0,
            b_frac in 0.0f64..1.0,
        ) {
            let w = widths();
            let map = literal_map(&text, &w);
            let to_boundary = |frac: f64| {
                let mut off = (text.len() as f64 * frac) as usize;
                while off < text.len() && !text.is_char_boundary(off) {
                    off += 1;
                }
                off as u64
            };
            let a = to_boundary(a_frac);
            let b = to_boundary(b_frac);

            let delta = mapped(map.spatial_delta(a, b, &NoSource, &w));
            let back = map.offset_at(a, delta, Rounding::Round, &NoSource, &w);
            prop_assert_eq!(back.offset, b, "a={} b={} delta={:?}", a, b, delta);
            prop_assert_eq!(back.missing, None);
        }

        /// Floor ≤ Round ≤ Ceil, always.
        #[test]
        fn rounding_is_monotone(
            text in "[a-z\\t\\n]{1,200}",
            base_frac in 0.0f64..1.0,
            lines in 0i64..6,
            x in 0.0f64..30.0,
        ) {
            let w = widths();
            let map = literal_map(&text, &w);
            let base = (text.len() as f64 * base_frac) as u64;
            let target = SpatialDelta::new(lines, x);
            let floor = map.offset_at(base, target, Rounding::Floor, &NoSource, &w);
            let round = map.offset_at(base, target, Rounding::Round, &NoSource, &w);
            let ceil = map.offset_at(base, target, Rounding::Ceil, &NoSource, &w);
            prop_assert!(floor.offset <= round.offset);
            prop_assert!(round.offset <= ceil.offset);
        }

        /// spatial_delta over a fully resident span equals the composition
        /// over any split point.
        #[test]
        fn delta_composes_over_partitions(
            text in "[a-z\\t\\n]{2,200}",
            a_frac in 0.0f64..1.0,
            m_frac in 0.0f64..1.0,
            b_frac in 0.0f64..1.0,
        ) {
            let w = widths();
            let map = literal_map(&text, &w);
            let len = text.len() as u64;
            let mut points = [
                (len as f64 * a_frac) as u64,
                (len as f64 * m_frac) as u64,
                (len as f64 * b_frac) as u64,
            ];
            points.sort_unstable();
            let [a, m, b] = points;

            let whole = mapped(map.spatial_delta(a, b, &NoSource, &w));
            let left = mapped(map.spatial_delta(a, m, &NoSource, &w));
            let right = mapped(map.spatial_delta(m, b, &NoSource, &w));
            let composed = LayoutDelta { lines: left.lines as u64, x: left.x }
                .then(LayoutDelta { lines: right.lines as u64, x: right.x });
            prop_assert_eq!(whole.lines as u64, composed.lines);
            prop_assert!((whole.x - composed.x).abs() < 1e-9);
        }
    }
}
