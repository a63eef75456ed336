//! Ordered container of non-touching resident file ranges.

use std::collections::BTreeMap;
use std::ops::Range;

/// A contiguous resident byte range.
///
/// Two segments never touch or overlap; [`SegmentSet::insert`] merges any
/// neighbour that would.
pub(crate) struct Segment {
    pub bytes: Vec<u8>,
    /// LRU stamp; larger is more recent.
    pub last_use: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Segments keyed by their start offset.
#[derive(Default)]
pub(crate) struct SegmentSet {
    map: BTreeMap<u64, Segment>,
    total: usize,
}

impl SegmentSet {
    /// The segment covering `offset`, if any.
    pub fn find_covering(&self, offset: u64) -> Option<(u64, &Segment)> {
        let (&start, seg) = self.map.range(..=offset).next_back()?;
        (start + seg.len() > offset).then_some((start, seg))
    }

    pub fn find_covering_mut(&mut self, offset: u64) -> Option<(u64, &mut Segment)> {
        let (&start, _) = self.map.range(..=offset).next_back()?;
        let seg = self.map.get_mut(&start)?;
        (start + seg.bytes.len() as u64 > offset).then_some((start, seg))
    }

    /// Start of the first segment beginning strictly after `offset`.
    pub fn next_start_after(&self, offset: u64) -> Option<u64> {
        self.map
            .range((std::ops::Bound::Excluded(offset), std::ops::Bound::Unbounded))
            .next()
            .map(|(&s, _)| s)
    }

    /// Insert bytes at `start`, merging with any touching or overlapping
    /// neighbour. The backing file is immutable, so overlapping content is
    /// identical by construction and either copy may win.
    pub fn insert(&mut self, mut start: u64, mut bytes: Vec<u8>, now: u64) {
        if bytes.is_empty() {
            return;
        }
        let mut end = start + bytes.len() as u64;

        if let Some((&pstart, pseg)) = self.map.range(..=start).next_back() {
            let pend = pstart + pseg.len();
            if pend >= end {
                // Fully inside an existing segment; just refresh its stamp.
                self.map.get_mut(&pstart).unwrap().last_use = now;
                return;
            }
            if pend >= start {
                let mut merged = self.map.remove(&pstart).unwrap();
                self.total -= merged.bytes.len();
                merged.bytes.truncate((start - pstart) as usize);
                merged.bytes.extend_from_slice(&bytes);
                start = pstart;
                bytes = merged.bytes;
                end = start + bytes.len() as u64;
            }
        }

        while let Some((&nstart, _)) = self.map.range(start..).next() {
            if nstart > end {
                break;
            }
            let nseg = self.map.remove(&nstart).unwrap();
            self.total -= nseg.bytes.len();
            let nend = nstart + nseg.len();
            if nend > end {
                bytes.extend_from_slice(&nseg.bytes[(end - nstart) as usize..]);
                end = nend;
            }
        }

        self.total += bytes.len();
        self.map.insert(start, Segment { bytes, last_use: now });
    }

    /// Longest resident slice starting at `offset`.
    pub fn available_from(&mut self, offset: u64, now: u64) -> Option<&[u8]> {
        let (start, seg) = self.find_covering_mut(offset)?;
        seg.last_use = now;
        Some(&seg.bytes[(offset - start) as usize..])
    }

    /// Longest resident slice ending at `offset` (exclusive). Returns the
    /// window's start offset alongside the bytes.
    pub fn available_to(&mut self, offset: u64, now: u64) -> Option<(u64, &[u8])> {
        if offset == 0 {
            return None;
        }
        let (start, seg) = self.find_covering_mut(offset - 1)?;
        seg.last_use = now;
        Some((start, &seg.bytes[..(offset - start) as usize]))
    }

    /// Drop the least recently used segment for which `pinned` is false.
    /// Returns the number of bytes freed.
    pub fn evict_lru(&mut self, pinned: impl Fn(Range<u64>) -> bool) -> Option<usize> {
        let victim = self
            .map
            .iter()
            .filter(|(&s, seg)| !pinned(s..s + seg.len()))
            .min_by_key(|(_, seg)| seg.last_use)
            .map(|(&s, _)| s)?;
        let seg = self.map.remove(&victim).unwrap();
        self.total -= seg.bytes.len();
        Some(seg.bytes.len())
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Segment)> {
        self.map.iter().map(|(&s, seg)| (s, seg))
    }
}
