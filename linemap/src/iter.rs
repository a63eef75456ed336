//! Lazy character cursor over the linemap.
//!
//! Advancing across an unmapped run (or a resident run whose bytes are not
//! at hand) yields an [`Glyph::Unknown`] sentinel covering the rest of the
//! run; once the loader fills the gap, a fresh cursor sees characters.

use crate::{
    fragment::{Kind, VirtualOffset},
    layout::{decode_utf8, is_utf8_cont, REPLACEMENT_CHAR},
    sum_tree::Bias,
    tree::{ByteSource, Linemap, SourceStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Glyph {
    Char(char),
    /// `len` bytes whose content is not currently known.
    Unknown { len: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharItem {
    /// Virtual offset of the glyph's first byte.
    pub offset: u64,
    pub glyph: Glyph,
}

pub struct Chars<'a> {
    map: &'a Linemap,
    source: &'a dyn ByteSource,
    direction: Direction,
    pos: u64,
    buf: Vec<u8>,
    buf_start: u64,
    buf_valid: bool,
}

impl Linemap {
    pub fn iter_chars<'a>(
        &'a self,
        offset: u64,
        direction: Direction,
        source: &'a dyn ByteSource,
    ) -> Chars<'a> {
        Chars {
            map: self,
            source,
            direction,
            pos: offset.min(self.len()),
            buf: Vec::new(),
            buf_start: 0,
            buf_valid: false,
        }
    }
}

impl Chars<'_> {
    /// Load the run covering `offset` into the local buffer, or produce the
    /// sentinel for it.
    fn fill(&mut self, offset: u64) -> Option<CharItem> {
        let mut cursor = self.map.fragments().cursor::<VirtualOffset>();
        cursor.seek(&VirtualOffset(offset), Bias::Right);
        let frag = cursor.item().expect("iterator offset within the buffer");
        let frag_start = cursor.start().0;
        let frag_end = frag_start + frag.len;

        if let Kind::Unmapped = frag.kind {
            return Some(self.sentinel(frag_start, frag_end));
        }

        self.buf.clear();
        if let Some(bytes) = frag.literal_bytes(0..frag.len) {
            self.buf.extend_from_slice(bytes);
        } else {
            let file_range = frag.file_range(0..frag.len).expect("file-backed run");
            if self.source.read(file_range, &mut self.buf) != SourceStatus::Complete {
                return Some(self.sentinel(frag_start, frag_end));
            }
        }
        self.buf_start = frag_start;
        self.buf_valid = true;
        None
    }

    fn sentinel(&mut self, frag_start: u64, frag_end: u64) -> CharItem {
        self.buf_valid = false;
        match self.direction {
            Direction::Forward => {
                let item = CharItem {
                    offset: self.pos,
                    glyph: Glyph::Unknown {
                        len: frag_end - self.pos,
                    },
                };
                self.pos = frag_end;
                item
            }
            Direction::Backward => {
                let item = CharItem {
                    offset: frag_start,
                    glyph: Glyph::Unknown {
                        len: self.pos - frag_start,
                    },
                };
                self.pos = frag_start;
                item
            }
        }
    }

    fn in_buf(&self, offset: u64) -> bool {
        self.buf_valid && offset >= self.buf_start && offset < self.buf_start + self.buf.len() as u64
    }

    fn next_forward(&mut self) -> Option<CharItem> {
        if self.pos >= self.map.len() {
            return None;
        }
        if !self.in_buf(self.pos) {
            if let Some(sentinel) = self.fill(self.pos) {
                return Some(sentinel);
            }
        }
        let rel = (self.pos - self.buf_start) as usize;
        let (c, adv) = decode_utf8(&self.buf[rel..]);
        let item = CharItem {
            offset: self.pos,
            glyph: Glyph::Char(c.unwrap_or(REPLACEMENT_CHAR)),
        };
        self.pos += adv as u64;
        Some(item)
    }

    fn next_backward(&mut self) -> Option<CharItem> {
        if self.pos == 0 {
            return None;
        }
        if !self.in_buf(self.pos - 1) {
            if let Some(sentinel) = self.fill(self.pos - 1) {
                return Some(sentinel);
            }
        }
        let rel = (self.pos - self.buf_start) as usize;
        let mut start = rel - 1;
        while start > 0 && rel - start < 4 && is_utf8_cont(self.buf[start]) {
            start -= 1;
        }
        if let (Ok(c), adv) = decode_utf8(&self.buf[start..rel]) {
            if adv == rel - start {
                self.pos = self.buf_start + start as u64;
                return Some(CharItem {
                    offset: self.pos,
                    glyph: Glyph::Char(c),
                });
            }
        }
        // Malformed tail; consume one byte as a replacement glyph.
        self.pos -= 1;
        Some(CharItem {
            offset: self.pos,
            glyph: Glyph::Char(REPLACEMENT_CHAR),
        })
    }
}

impl Iterator for Chars<'_> {
    type Item = CharItem;

    fn next(&mut self) -> Option<CharItem> {
        match self.direction {
            Direction::Forward => self.next_forward(),
            Direction::Backward => self.next_backward(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fragment::Backing,
        layout::WidthTable,
        tree::{Linemap, NoSource},
    };
    use std::sync::Arc;

    fn literal_map(text: &str) -> Linemap {
        let widths = WidthTable::default();
        let mut map = Linemap::new();
        map.insert_literal(0, Arc::from(text.as_bytes()), &NoSource, &widths)
            .unwrap();
        map
    }

    #[test]
    fn forward_yields_each_char() {
        let map = literal_map("aé\n日");
        let got: Vec<_> = map
            .iter_chars(0, Direction::Forward, &NoSource)
            .map(|item| match item.glyph {
                Glyph::Char(c) => (item.offset, c),
                Glyph::Unknown { .. } => panic!("fully literal buffer"),
            })
            .collect();
        assert_eq!(got, vec![(0, 'a'), (1, 'é'), (3, '\n'), (4, '日')]);
    }

    #[test]
    fn backward_reverses_forward() {
        let map = literal_map("aé\n日x");
        let forward: Vec<_> = map.iter_chars(0, Direction::Forward, &NoSource).collect();
        let mut backward: Vec<_> = map
            .iter_chars(map.len(), Direction::Backward, &NoSource)
            .collect();
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn unmapped_run_is_a_single_sentinel() {
        let widths = WidthTable::default();
        let mut map = literal_map("ab");
        map.insert_deferred(1, Backing::File(500), 1000, &NoSource, &widths)
            .unwrap();

        let got: Vec<_> = map.iter_chars(0, Direction::Forward, &NoSource).collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].glyph, Glyph::Char('a'));
        assert_eq!(got[1], CharItem {
            offset: 1,
            glyph: Glyph::Unknown { len: 1000 },
        });
        assert_eq!(got[2], CharItem {
            offset: 1001,
            glyph: Glyph::Char('b'),
        });
    }

    #[test]
    fn starts_mid_buffer() {
        let map = literal_map("hello");
        let first = map.iter_chars(2, Direction::Forward, &NoSource).next();
        assert_eq!(first.unwrap().glyph, Glyph::Char('l'));
        let first = map.iter_chars(2, Direction::Backward, &NoSource).next();
        assert_eq!(first.unwrap().glyph, Glyph::Char('e'));
    }
}
