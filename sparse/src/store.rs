//! The sparse store: non-blocking read windows over resident data, a
//! prioritized hot set for the loader, and best-effort LRU eviction.

use crate::{segment::SegmentSet, ChangeSignal};
use smallvec::SmallVec;
use std::{ops::Range, sync::Arc};
use tracing::warn;

/// Priority class of a hot-set range. Lower values load first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HotClass {
    /// Data the user is looking at right now.
    Viewport,
    /// Margin around the viewport.
    Prefetch,
    /// Anything the façade merely suspects will be useful.
    Speculative,
}

/// A file range the loader must keep resident.
#[derive(Debug, Clone)]
pub struct HotRange {
    pub range: Range<u64>,
    pub class: HotClass,
}

/// Result of a non-blocking read against the store.
pub enum ReadWindow<'a> {
    /// Longest contiguous resident run at the requested offset.
    Resident(&'a [u8]),
    /// Nothing resident there yet.
    Missing,
    /// The offset lies in a sticky failed region; it will never load.
    Failed,
}

impl ReadWindow<'_> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            ReadWindow::Resident(b) => b,
            _ => &[],
        }
    }
}

/// Shared between the interactive thread and the loader under one mutex.
/// Every method here is O(log S) or better except the loader-only scans.
pub struct SparseStore {
    segments: SegmentSet,
    hot: SmallVec<[HotRange; 4]>,
    failed: Vec<Range<u64>>,
    budget: usize,
    budget_exceeded: bool,
    clock: u64,
    file_len: u64,
    signal: Arc<ChangeSignal>,
}

impl SparseStore {
    pub fn new(file_len: u64, budget: usize, signal: Arc<ChangeSignal>) -> Self {
        Self {
            segments: SegmentSet::default(),
            hot: SmallVec::new(),
            failed: Vec::new(),
            budget,
            budget_exceeded: false,
            clock: 0,
            file_len,
            signal,
        }
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn epoch(&self) -> u64 {
        self.signal.current()
    }

    pub fn signal(&self) -> &Arc<ChangeSignal> {
        &self.signal
    }

    /// Longest contiguous resident run starting at `offset`.
    pub fn read_forward(&mut self, offset: u64) -> ReadWindow<'_> {
        if self.failed_covering(offset).is_some() {
            return ReadWindow::Failed;
        }
        self.clock += 1;
        let now = self.clock;
        match self.segments.available_from(offset, now) {
            Some(bytes) => ReadWindow::Resident(bytes),
            None => ReadWindow::Missing,
        }
    }

    /// Longest contiguous resident run ending at `offset` (exclusive).
    /// Yields the window's start offset alongside the bytes.
    pub fn read_backward(&mut self, offset: u64) -> (u64, ReadWindow<'_>) {
        if offset > 0 && self.failed_covering(offset - 1).is_some() {
            return (offset, ReadWindow::Failed);
        }
        self.clock += 1;
        let now = self.clock;
        match self.segments.available_to(offset, now) {
            Some((start, bytes)) => (start, ReadWindow::Resident(bytes)),
            None => (offset, ReadWindow::Missing),
        }
    }

    /// Replace the hot set. Ranges are clamped to the file; overlapping or
    /// touching ranges merge, keeping the higher-priority class.
    pub fn set_hot_set(&mut self, ranges: impl IntoIterator<Item = HotRange>) {
        let mut clamped: SmallVec<[HotRange; 4]> = SmallVec::new();
        for mut hot in ranges {
            hot.range.end = hot.range.end.min(self.file_len);
            hot.range.start = hot.range.start.min(hot.range.end);
            if !hot.range.is_empty() {
                clamped.push(hot);
            }
        }
        clamped.sort_by_key(|h| h.range.start);

        self.hot.clear();
        for hot in clamped {
            match self.hot.last_mut() {
                Some(last) if hot.range.start <= last.range.end => {
                    last.range.end = last.range.end.max(hot.range.end);
                    last.class = last.class.min(hot.class);
                }
                _ => self.hot.push(hot),
            }
        }
        self.hot.sort_by_key(|h| (h.class, h.range.start));
        self.update_budget_flag();
    }

    pub fn hot_set(&self) -> &[HotRange] {
        &self.hot
    }

    pub fn set_memory_budget(&mut self, bytes: usize) {
        self.budget = bytes;
        self.update_budget_flag();
    }

    /// True while the pinned hot set alone cannot fit in the budget.
    pub fn budget_exceeded(&self) -> bool {
        self.budget_exceeded
    }

    fn update_budget_flag(&mut self) {
        let pinned: u64 = self.hot.iter().map(|h| h.range.end - h.range.start).sum();
        let exceeded = pinned > self.budget as u64;
        if exceeded && !self.budget_exceeded {
            warn!(pinned, budget = self.budget, "hot set exceeds memory budget");
        }
        self.budget_exceeded = exceeded;
    }

    // ---- loader side ----

    /// Commit freshly loaded bytes and advance the epoch.
    pub fn commit(&mut self, start: u64, bytes: Vec<u8>) {
        self.clock += 1;
        self.segments.insert(start, bytes, self.clock);
        self.signal.bump();
    }

    /// Record a sticky failed region and advance the epoch so observers
    /// re-query and see it.
    pub fn mark_failed(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        self.failed.retain(|f| {
            if f.start <= merged.end && merged.start <= f.end {
                merged.start = merged.start.min(f.start);
                merged.end = merged.end.max(f.end);
                false
            } else {
                true
            }
        });
        let at = self
            .failed
            .partition_point(|f| f.start < merged.start);
        self.failed.insert(at, merged);
        self.signal.bump();
    }

    /// Highest-priority hot sub-range that is neither resident nor failed.
    pub fn next_missing(&self) -> Option<(Range<u64>, HotClass)> {
        for hot in &self.hot {
            if let Some(gap) = self.first_gap_in(hot.range.clone()) {
                return Some((gap, hot.class));
            }
        }
        None
    }

    fn first_gap_in(&self, range: Range<u64>) -> Option<Range<u64>> {
        let mut pos = range.start;
        while pos < range.end {
            if let Some((start, seg)) = self.segments.find_covering(pos) {
                pos = start + seg.len();
                continue;
            }
            if let Some(failed) = self.failed_covering(pos) {
                pos = failed.end;
                continue;
            }
            let end = range
                .end
                .min(self.segments.next_start_after(pos).unwrap_or(u64::MAX))
                .min(self.next_failed_after(pos).unwrap_or(u64::MAX));
            return Some(pos..end);
        }
        None
    }

    fn failed_covering(&self, offset: u64) -> Option<&Range<u64>> {
        let i = self.failed.partition_point(|f| f.end <= offset);
        self.failed.get(i).filter(|f| f.start <= offset)
    }

    fn next_failed_after(&self, offset: u64) -> Option<u64> {
        let i = self.failed.partition_point(|f| f.start <= offset);
        self.failed.get(i).map(|f| f.start)
    }

    /// Evict one cold segment if the store is over budget. Returns false when
    /// nothing (more) can be evicted.
    pub fn evict_step(&mut self) -> bool {
        if self.segments.total_bytes() <= self.budget {
            return false;
        }
        let hot = &self.hot;
        let freed = self
            .segments
            .evict_lru(|seg| hot.iter().any(|h| h.range.start < seg.end && seg.start < h.range.end));
        match freed {
            Some(bytes) => {
                self.signal.bump();
                tracing::debug!(bytes, "evicted cold segment");
                true
            }
            None => false,
        }
    }

    pub fn resident_bytes(&self) -> usize {
        self.segments.total_bytes()
    }

    #[cfg(test)]
    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(file_len: u64, budget: usize) -> SparseStore {
        SparseStore::new(file_len, budget, Arc::new(ChangeSignal::new()))
    }

    #[test]
    fn read_forward_reports_missing_then_resident() {
        let mut s = store(100, 1 << 20);
        assert!(matches!(s.read_forward(10), ReadWindow::Missing));
        let before = s.epoch();
        s.commit(10, b"abcdef".to_vec());
        assert!(s.epoch() > before);
        assert_eq!(s.read_forward(12).bytes(), b"cdef");
    }

    #[test]
    fn read_backward_reports_window_start() {
        let mut s = store(100, 1 << 20);
        s.commit(10, b"abcdef".to_vec());
        let (start, win) = s.read_backward(14);
        assert_eq!(start, 10);
        assert_eq!(win.bytes(), b"abcd");
        let (_, win) = s.read_backward(10);
        assert!(matches!(win, ReadWindow::Missing));
    }

    #[test]
    fn hot_gaps_come_out_by_priority() {
        let mut s = store(1000, 1 << 20);
        s.set_hot_set([
            HotRange { range: 500..600, class: HotClass::Prefetch },
            HotRange { range: 0..100, class: HotClass::Viewport },
        ]);
        let (gap, class) = s.next_missing().unwrap();
        assert_eq!(gap, 0..100);
        assert_eq!(class, HotClass::Viewport);

        s.commit(0, vec![0; 40]);
        let (gap, _) = s.next_missing().unwrap();
        assert_eq!(gap, 40..100);

        s.commit(40, vec![0; 60]);
        let (gap, class) = s.next_missing().unwrap();
        assert_eq!(gap, 500..600);
        assert_eq!(class, HotClass::Prefetch);
        s.commit(500, vec![0; 100]);
        assert!(s.next_missing().is_none());
    }

    #[test]
    fn failed_regions_are_sticky_and_skipped() {
        let mut s = store(1000, 1 << 20);
        s.set_hot_set([HotRange { range: 0..100, class: HotClass::Viewport }]);
        s.mark_failed(0..50);
        assert!(matches!(s.read_forward(10), ReadWindow::Failed));
        let (gap, _) = s.next_missing().unwrap();
        assert_eq!(gap, 50..100);
        // Commits elsewhere do not clear the failure.
        s.commit(50, vec![0; 50]);
        assert!(matches!(s.read_forward(0), ReadWindow::Failed));
        assert!(s.next_missing().is_none());
    }

    #[test]
    fn eviction_respects_hot_pin_and_budget() {
        let mut s = store(1000, 100);
        s.set_hot_set([HotRange { range: 0..64, class: HotClass::Viewport }]);
        s.commit(0, vec![0; 64]);
        s.commit(200, vec![0; 64]);
        assert!(s.resident_bytes() > 100);
        assert!(s.evict_step());
        assert_eq!(s.resident_bytes(), 64);
        assert!(s.read_forward(0).bytes().len() == 64);
        assert!(matches!(s.read_forward(200), ReadWindow::Missing));
        assert!(!s.evict_step());
    }

    #[test]
    fn budget_flag_tracks_hot_set_size() {
        let mut s = store(1000, 100);
        assert!(!s.budget_exceeded());
        s.set_hot_set([HotRange { range: 0..500, class: HotClass::Viewport }]);
        assert!(s.budget_exceeded());
        s.set_memory_budget(1 << 20);
        assert!(!s.budget_exceeded());
    }

    #[test]
    fn hot_ranges_clamp_to_file() {
        let mut s = store(50, 1 << 20);
        s.set_hot_set([HotRange { range: 40..500, class: HotClass::Viewport }]);
        let (gap, _) = s.next_missing().unwrap();
        assert_eq!(gap, 40..50);
    }
}
