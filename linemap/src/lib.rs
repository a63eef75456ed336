//! Ordered index between virtual byte offsets and spatial (line, column)
//! positions, built for buffers far larger than RAM.
//!
//! The linemap tolerates partial knowledge: regions whose bytes have never
//! been inspected occupy offset space as *unmapped* runs, and every query
//! degrades to a best-effort answer plus the file ranges that would refine
//! it. A background pass converts unmapped runs to resident ones as their
//! bytes arrive; the interactive thread never waits for it.

pub mod fragment;
pub mod iter;
pub mod layout;
pub mod sum_tree;
pub mod tree;

pub use fragment::{
    build_runs, Backing, Fragment, FragmentId, FragmentSummary, VirtualOffset, MAX_FRAGMENT_BYTES,
};
pub use iter::{CharItem, Chars, Direction, Glyph};
pub use layout::{
    decode_utf8, is_utf8_cont, layout_of, layout_span, utf8_seq_len, LayoutDelta, LayoutState,
    SpatialDelta, WidthTable, REPLACEMENT_CHAR,
};
pub use tree::{
    ByteSource, DeltaOutcome, Linemap, Located, NoSource, Rounding, ScanTicket, SourceStatus,
    TreeError,
};
