//! Position values exchanged with the shell and renderer.
//!
//! A position is a tagged variant rather than a family of interchangeable
//! types: an exact byte offset, a spatially anchored point, or a viewport
//! rectangle. Conversions between them are explicit operations on the
//! buffer, since they may be approximate while data is still loading.

use tarn_linemap::SpatialDelta;

/// A point in the buffer anchored at a reference offset.
///
/// The anchor only moves on deliberate jumps (go-to-offset); smooth
/// scrolling adjusts the delta, so the view stays still as surrounding data
/// loads in.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BufferPosition {
    /// Reference virtual offset.
    pub base: u64,
    /// Spatial distance from the anchor's position.
    pub delta: SpatialDelta,
}

impl BufferPosition {
    pub fn at_offset(base: u64) -> Self {
        Self {
            base,
            delta: SpatialDelta::ZERO,
        }
    }

    /// The same anchor, nudged by `by`.
    pub fn offset_by(self, by: SpatialDelta) -> Self {
        Self {
            base: self.base,
            delta: SpatialDelta::new(self.delta.lines + by.lines, self.delta.x + by.x),
        }
    }
}

/// A rectangular view into the buffer. Not a linear byte range: it is
/// literally a rectangle in line/column space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BufferRect {
    /// Top-left corner.
    pub corner: BufferPosition,
    /// Extent in lines and font-height units.
    pub size: SpatialDelta,
}

impl BufferRect {
    /// Clamp a position into this rectangle, preserving its anchor.
    pub fn clamp(&self, mut pos: BufferPosition) -> BufferPosition {
        debug_assert_eq!(pos.base, self.corner.base);
        let lines = pos
            .delta
            .lines
            .clamp(self.corner.delta.lines, self.corner.delta.lines + self.size.lines);
        let x = pos
            .delta
            .x
            .clamp(self.corner.delta.x, self.corner.delta.x + self.size.x);
        pos.delta = SpatialDelta::new(lines, x);
        pos
    }
}

/// The tagged union of position-like values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Position {
    Offset(u64),
    At(BufferPosition),
    Rect(BufferRect),
}

impl From<u64> for Position {
    fn from(offset: u64) -> Self {
        Position::Offset(offset)
    }
}

impl From<BufferPosition> for Position {
    fn from(pos: BufferPosition) -> Self {
        Position::At(pos)
    }
}

impl From<BufferRect> for Position {
    fn from(rect: BufferRect) -> Self {
        Position::Rect(rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_confines_to_the_rect() {
        let rect = BufferRect {
            corner: BufferPosition {
                base: 100,
                delta: SpatialDelta::new(10, 2.0),
            },
            size: SpatialDelta::new(40, 80.0),
        };
        let inside = rect.clamp(BufferPosition {
            base: 100,
            delta: SpatialDelta::new(20, 40.0),
        });
        assert_eq!(inside.delta, SpatialDelta::new(20, 40.0));

        let outside = rect.clamp(BufferPosition {
            base: 100,
            delta: SpatialDelta::new(90, 1.0),
        });
        assert_eq!(outside.delta, SpatialDelta::new(50, 2.0));
    }

    #[test]
    fn offset_by_accumulates() {
        let pos = BufferPosition::at_offset(7)
            .offset_by(SpatialDelta::new(2, 1.0))
            .offset_by(SpatialDelta::new(-1, 0.5));
        assert_eq!(pos.base, 7);
        assert_eq!(pos.delta, SpatialDelta::new(1, 1.5));
    }
}
