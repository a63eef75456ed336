//! The pure layout model: incremental UTF-8 decoding, character advances,
//! and line/column deltas.
//!
//! Layout of a byte span is a [`LayoutDelta`] -- how many lines the span
//! crosses and where it leaves the pen within the final line. Deltas compose
//! associatively over splits that respect UTF-8 boundaries, which is what
//! lets the linemap summarize whole subtrees without looking at bytes.
//!
//! [`LayoutState`] carries the only cross-chunk context there is: up to three
//! trailing bytes of a partial code point, plus the running delta. Feeding
//! chunks through [`layout_of`] therefore gives byte-for-byte identical
//! results no matter how the input is split.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub const REPLACEMENT_CHAR: char = char::REPLACEMENT_CHARACTER;

/// (lines crossed, trailing x) over some byte span.
///
/// `x` is the pen position within the span's final line when `lines > 0`,
/// and a pure advance relative to the span's start otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LayoutDelta {
    pub lines: u64,
    pub x: f64,
}

impl LayoutDelta {
    pub const ZERO: Self = Self { lines: 0, x: 0.0 };

    /// Monoid composition: a newline in `next` resets the column.
    pub fn then(self, next: Self) -> Self {
        if next.lines == 0 {
            Self {
                lines: self.lines,
                x: self.x + next.x,
            }
        } else {
            Self {
                lines: self.lines + next.lines,
                x: next.x,
            }
        }
    }
}

/// Difference of two spatial coordinates, in line/font-height units.
///
/// Ordered lexicographically: a position further down always compares
/// greater, regardless of column.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpatialDelta {
    pub lines: i64,
    pub x: f64,
}

impl SpatialDelta {
    pub const ZERO: Self = Self { lines: 0, x: 0.0 };

    pub fn new(lines: i64, x: f64) -> Self {
        Self { lines, x }
    }

    pub fn forward(delta: LayoutDelta) -> Self {
        Self {
            lines: delta.lines as i64,
            x: delta.x,
        }
    }

    pub fn total_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.lines
            .cmp(&other.lines)
            .then(self.x.total_cmp(&other.x))
    }

    /// Magnitude of the gap to `other`, for rounding decisions.
    pub fn distance_to(&self, other: &Self) -> (u64, f64) {
        (
            self.lines.abs_diff(other.lines),
            (self.x - other.x).abs(),
        )
    }
}

/// Per-code-point advances, in font-height units.
///
/// The editor shell builds this from real font metrics; the core only needs
/// the table. Every code point -- tabs included -- has a fixed advance, so a
/// character's width never depends on what precedes it and layout deltas
/// stay associative.
#[derive(Debug, Clone)]
pub struct WidthTable {
    advances: FxHashMap<char, f64>,
    default_advance: f64,
}

impl Default for WidthTable {
    fn default() -> Self {
        Self::uniform(0.5, 4)
    }
}

impl WidthTable {
    /// Every character `advance` wide, tabs `tab_columns` characters wide.
    pub fn uniform(advance: f64, tab_columns: u32) -> Self {
        let mut advances = FxHashMap::default();
        advances.insert('\t', advance * tab_columns as f64);
        Self {
            advances,
            default_advance: advance,
        }
    }

    pub fn set_advance(&mut self, c: char, advance: f64) {
        self.advances.insert(c, advance);
    }

    pub fn advance_for(&self, c: char) -> f64 {
        *self.advances.get(&c).unwrap_or(&self.default_advance)
    }
}

/// Cross-chunk layout context: the running delta, the widest line completed
/// strictly inside the scanned span, and at most three bytes of a partial
/// code point.
#[derive(Debug, Clone, Default)]
pub struct LayoutState {
    delta: LayoutDelta,
    widest: f64,
    pending: SmallVec<[u8; 4]>,
}

impl LayoutState {
    pub fn delta(&self) -> LayoutDelta {
        self.delta
    }

    /// Widest line whose start and end both lie inside the scanned span.
    /// Lines clipped by the span's edges are not counted, so this is always
    /// a valid lower bound.
    pub fn widest(&self) -> f64 {
        self.widest
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decode any carried partial code point as malformed input. Call once
    /// at the true end of the scanned bytes.
    pub fn flush(&mut self, widths: &WidthTable) {
        let pending = std::mem::take(&mut self.pending);
        let mut rest: &[u8] = &pending;
        while !rest.is_empty() {
            let (c, adv) = decode_utf8(rest);
            self.advance_char(c.unwrap_or(REPLACEMENT_CHAR), widths);
            rest = &rest[adv..];
        }
    }

    fn advance_char(&mut self, c: char, widths: &WidthTable) {
        if c == '\n' {
            if self.delta.lines > 0 {
                // The first line of the span started outside it; its width
                // is unknowable here.
                self.widest = self.widest.max(self.delta.x);
            }
            self.delta.lines += 1;
            self.delta.x = 0.0;
        } else {
            self.delta.x += widths.advance_for(c);
        }
    }
}

/// Lay out `bytes`, threading `state` across chunk boundaries.
pub fn layout_of(bytes: &[u8], mut state: LayoutState, widths: &WidthTable) -> LayoutState {
    let mut input = bytes;

    if !state.pending.is_empty() {
        // Stitch the carried bytes to the head of this chunk; 8 extra bytes
        // cover any code point starting inside the pending prefix.
        let pend_len = state.pending.len();
        let take = input.len().min(8);
        let mut stitched: SmallVec<[u8; 4]> = state.pending.clone();
        stitched.extend_from_slice(&input[..take]);
        state.pending.clear();

        let mut i = 0;
        while i < pend_len {
            let rest = &stitched[i..];
            if take == input.len() && is_partial_char(rest) {
                state.pending.extend_from_slice(rest);
                return state;
            }
            let (c, adv) = decode_utf8(rest);
            state.advance_char(c.unwrap_or(REPLACEMENT_CHAR), widths);
            i += adv;
        }
        input = &input[i - pend_len..];
    }

    let mut i = 0;
    while i < input.len() {
        let rest = &input[i..];
        if is_partial_char(rest) {
            state.pending.extend_from_slice(rest);
            return state;
        }
        let (c, adv) = decode_utf8(rest);
        state.advance_char(c.unwrap_or(REPLACEMENT_CHAR), widths);
        i += adv;
    }
    state
}

/// Lay out a complete, standalone byte span.
pub fn layout_span(bytes: &[u8], widths: &WidthTable) -> (LayoutDelta, f64) {
    let mut state = layout_of(bytes, LayoutState::default(), widths);
    state.flush(widths);
    (state.delta(), state.widest())
}

/// True when `bytes` is a proper prefix of a single multi-byte code point.
fn is_partial_char(bytes: &[u8]) -> bool {
    let need = utf8_seq_len(bytes[0]);
    need >= 2 && bytes.len() < need && bytes[1..].iter().all(|&b| is_utf8_cont(b))
}

pub fn is_utf8_cont(b: u8) -> bool {
    b & 0b1100_0000 == 0b1000_0000
}

/// Declared sequence length of a UTF-8 lead byte. Continuation and invalid
/// lead bytes count as one, matching how the decoder consumes them.
pub fn utf8_seq_len(b: u8) -> usize {
    if b & 0b1000_0000 == 0 {
        1
    } else if b & 0b0100_0000 == 0 {
        1
    } else if b & 0b0010_0000 == 0 {
        2
    } else if b & 0b0001_0000 == 0 {
        3
    } else {
        4
    }
}

/// Decode one code point from a non-empty slice. Malformed input yields
/// `Err(lead_byte)` and consumes a single byte; the caller substitutes
/// U+FFFD.
pub fn decode_utf8(b: &[u8]) -> (Result<char, u8>, usize) {
    debug_assert!(!b.is_empty());
    let lead = b[0];
    let need = utf8_seq_len(lead);
    if need == 1 {
        if lead < 0x80 {
            return (Ok(lead as char), 1);
        }
        return (Err(lead), 1);
    }
    if b.len() < need || !b[1..need].iter().all(|&c| is_utf8_cont(c)) {
        return (Err(lead), 1);
    }
    let mut value = (lead as u32) & (0x7F >> need);
    for &c in &b[1..need] {
        value = value << 6 | (c as u32 & 0b0011_1111);
    }
    // Reject overlong encodings and surrogates.
    const MIN: [u32; 5] = [0, 0, 0x80, 0x800, 0x1_0000];
    if value < MIN[need] {
        return (Err(lead), 1);
    }
    match char::from_u32(value) {
        Some(c) => (Ok(c), need),
        None => (Err(lead), 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn w() -> WidthTable {
        WidthTable::uniform(1.0, 4)
    }

    #[test]
    fn ascii_lines_and_columns() {
        let (delta, widest) = layout_span(b"ab\ncdef\ng", &w());
        assert_eq!(delta.lines, 2);
        assert_eq!(delta.x, 1.0);
        assert_eq!(widest, 4.0); // "cdef", the only line wholly inside
    }

    #[test]
    fn composition_resets_column_on_newline() {
        let a = LayoutDelta { lines: 0, x: 3.0 };
        let b = LayoutDelta { lines: 2, x: 1.0 };
        let c = LayoutDelta { lines: 0, x: 2.0 };
        assert_eq!(a.then(b), LayoutDelta { lines: 2, x: 1.0 });
        assert_eq!(a.then(c), LayoutDelta { lines: 0, x: 5.0 });
        assert_eq!(a.then(LayoutDelta::ZERO), a);
        assert_eq!(LayoutDelta::ZERO.then(b), b);
    }

    #[test]
    fn tabs_have_a_fixed_advance() {
        let widths = w();
        let (delta, _) = layout_span(b"a\tb", &widths);
        assert_eq!(delta.x, 6.0); // 1 + 4 + 1
        let (delta, _) = layout_span(b"\t", &widths);
        assert_eq!(delta.x, 4.0);
    }

    #[test]
    fn tab_layout_is_split_invariant() {
        // A tab's advance never depends on its column, so composing the
        // deltas of the two halves matches the whole at every split point,
        // including splits that land between a tab and the text before it.
        let widths = w();
        let bytes = b"ab\tc\tdef\tg";
        let whole = layout_span(bytes, &widths).0;
        for split in 0..=bytes.len() {
            let left = layout_span(&bytes[..split], &widths).0;
            let right = layout_span(&bytes[split..], &widths).0;
            assert_eq!(left.then(right), whole, "split at {split}");
        }
    }

    #[test]
    fn multibyte_split_across_chunks() {
        let text = "aé日b".as_bytes();
        let whole = layout_span(text, &w()).0;
        for split in 0..=text.len() {
            let state = layout_of(&text[..split], LayoutState::default(), &w());
            let mut state = layout_of(&text[split..], state, &w());
            state.flush(&w());
            assert_eq!(state.delta(), whole, "split at {split}");
        }
    }

    #[test]
    fn malformed_bytes_become_replacement_chars() {
        let widths = w();
        // A stray continuation byte and a truncated lead each cost one
        // replacement advance.
        let (delta, _) = layout_span(&[b'a', 0x80, b'b'], &widths);
        assert_eq!(delta.x, 3.0);
        let (delta, _) = layout_span(&[0xE2, 0x82], &widths); // truncated €
        assert_eq!(delta.x, 2.0);
    }

    #[test]
    fn decode_rejects_overlong_and_surrogates() {
        assert!(decode_utf8(&[0xC0, 0x80]).0.is_err()); // overlong NUL
        assert!(decode_utf8(&[0xED, 0xA0, 0x80]).0.is_err()); // surrogate
        assert_eq!(decode_utf8("€".as_bytes()).0.unwrap(), '€');
        assert_eq!(decode_utf8("𝄞".as_bytes()), (Ok('𝄞'), 4));
    }

    #[test]
    fn widest_ignores_edge_lines() {
        // Only "mid" is wholly inside; the clipped first and last lines are
        // not counted even though they are longer.
        let (_, widest) = layout_span(b"longtail\nmid\nlonglong", &w());
        assert_eq!(widest, 3.0);
        let (_, widest) = layout_span(b"no newline at all", &w());
        assert_eq!(widest, 0.0);
    }

    proptest! {
        /// State-threaded layout is exact under any split, byte-aligned or not.
        #[test]
        fn chunking_is_invisible(text in "\\PC*\\PC*", split in 0usize..64) {
            let widths = w();
            let bytes = text.as_bytes();
            let split = split.min(bytes.len());
            let whole = layout_span(bytes, &widths);

            let state = layout_of(&bytes[..split], LayoutState::default(), &widths);
            let mut state = layout_of(&bytes[split..], state, &widths);
            state.flush(&widths);
            prop_assert_eq!(state.delta(), whole.0);
            prop_assert_eq!(state.widest(), whole.1);
        }

        /// Fragment-style composition (fresh state per part) matches the
        /// whole for char-boundary splits, tabs included.
        #[test]
        fn delta_monoid_matches_whole(text in "[a-zA-Z0-9 \\té日\\n]{0,80}", frac in 0.0f64..1.0) {
            let widths = w();
            let bytes = text.as_bytes();
            let mut split = (bytes.len() as f64 * frac) as usize;
            while split < bytes.len() && !text.is_char_boundary(split) {
                split += 1;
            }
            let whole = layout_span(bytes, &widths).0;
            let left = layout_span(&bytes[..split], &widths).0;
            let right = layout_span(&bytes[split..], &widths).0;
            let composed = left.then(right);
            prop_assert_eq!(whole.lines, composed.lines);
            prop_assert!((whole.x - composed.x).abs() < 1e-9);
        }
    }
}
