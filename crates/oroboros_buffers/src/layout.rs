//! # Vertex Layouts
//!
//! The closed set of vertex kinds the sub-allocator understands.
//!
//! Every kind is identified by a [`VertexLayout`] tag. Stride and input
//! elements come from a static table indexed by that tag, so no per-type
//! dispatch is needed at runtime:
//!
//! ```text
//! VertexLayout::PositionColor ──► LAYOUT_TABLE[1] ──► stride 28
//!                                                 └─► POSITION, COLOR
//! ```
//!
//! Item lists travel as a [`VertexStream`], a tagged union of typed vectors.

use std::fmt;
use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::error::{range_end, BufferError, BufferResult};

// =============================================================================
// INPUT ELEMENTS
// =============================================================================

/// Format of a single input element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementFormat {
    /// Two 32-bit floats.
    Float32x2,
    /// Three 32-bit floats.
    Float32x3,
    /// Four 32-bit floats.
    Float32x4,
    /// One 32-bit unsigned integer.
    Uint32,
    /// Four 32-bit unsigned integers.
    Uint32x4,
}

impl ElementFormat {
    /// Size of the element in bytes.
    #[must_use]
    pub const fn size(self) -> u32 {
        match self {
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 | Self::Uint32x4 => 16,
            Self::Uint32 => 4,
        }
    }
}

/// Whether an element advances per vertex or per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepRate {
    /// Advances once per vertex.
    Vertex,
    /// Advances once per instance.
    Instance,
}

/// One entry of an input layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputElement {
    /// Shader semantic name.
    pub semantic: &'static str,
    /// Semantic index (for matrices split over several rows).
    pub semantic_index: u32,
    /// Element format.
    pub format: ElementFormat,
    /// Input slot the element is read from.
    pub input_slot: u32,
    /// Byte offset inside one item.
    pub offset: u32,
    /// Step rate.
    pub step: StepRate,
}

/// Static description of one element, before a slot is assigned.
pub(crate) struct ElementEntry {
    pub(crate) semantic: &'static str,
    pub(crate) semantic_index: u32,
    pub(crate) format: ElementFormat,
    pub(crate) offset: u32,
}

impl ElementEntry {
    pub(crate) const fn new(semantic: &'static str, semantic_index: u32, format: ElementFormat, offset: u32) -> Self {
        Self { semantic, semantic_index, format, offset }
    }

    pub(crate) const fn at_slot(&self, input_slot: u32, step: StepRate) -> InputElement {
        InputElement {
            semantic: self.semantic,
            semantic_index: self.semantic_index,
            format: self.format,
            input_slot,
            offset: self.offset,
            step,
        }
    }
}

struct LayoutEntry {
    name: &'static str,
    stride: u32,
    elements: &'static [ElementEntry],
}

/// Stride and elements per layout, indexed by `VertexLayout as usize`.
static LAYOUT_TABLE: [LayoutEntry; 4] = [
    LayoutEntry {
        name: "position",
        stride: 12,
        elements: &[ElementEntry::new("POSITION", 0, ElementFormat::Float32x3, 0)],
    },
    LayoutEntry {
        name: "position_color",
        stride: 28,
        elements: &[
            ElementEntry::new("POSITION", 0, ElementFormat::Float32x3, 0),
            ElementEntry::new("COLOR", 0, ElementFormat::Float32x4, 12),
        ],
    },
    LayoutEntry {
        name: "position_normal_uv",
        stride: 32,
        elements: &[
            ElementEntry::new("POSITION", 0, ElementFormat::Float32x3, 0),
            ElementEntry::new("NORMAL", 0, ElementFormat::Float32x3, 12),
            ElementEntry::new("TEXCOORD", 0, ElementFormat::Float32x2, 24),
        ],
    },
    LayoutEntry {
        name: "skinned",
        stride: 64,
        elements: &[
            ElementEntry::new("POSITION", 0, ElementFormat::Float32x3, 0),
            ElementEntry::new("NORMAL", 0, ElementFormat::Float32x3, 12),
            ElementEntry::new("TEXCOORD", 0, ElementFormat::Float32x2, 24),
            ElementEntry::new("BLENDINDICES", 0, ElementFormat::Uint32x4, 32),
            ElementEntry::new("BLENDWEIGHT", 0, ElementFormat::Float32x4, 48),
        ],
    },
];

// =============================================================================
// LAYOUT TAG
// =============================================================================

/// Vertex layout tag. Part of the compatibility key of a vertex group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum VertexLayout {
    /// Position only.
    Position = 0,
    /// Position and RGBA color.
    PositionColor = 1,
    /// Position, normal and texture coordinates.
    PositionNormalUv = 2,
    /// Position, normal, texture coordinates, joint indices and weights.
    Skinned = 3,
}

impl VertexLayout {
    /// Every supported layout.
    pub const ALL: [Self; 4] = [Self::Position, Self::PositionColor, Self::PositionNormalUv, Self::Skinned];

    fn entry(self) -> &'static LayoutEntry {
        &LAYOUT_TABLE[self as usize]
    }

    /// Size of one item in bytes.
    #[must_use]
    pub fn stride(self) -> u32 {
        self.entry().stride
    }

    /// Stable lowercase name (used in buffer labels and config files).
    #[must_use]
    pub fn name(self) -> &'static str {
        self.entry().name
    }

    /// Input elements of this layout, read from `slot` at vertex rate.
    #[must_use]
    pub fn input_elements(self, slot: u32) -> Vec<InputElement> {
        self.entry()
            .elements
            .iter()
            .map(|e| e.at_slot(slot, StepRate::Vertex))
            .collect()
    }
}

impl fmt::Display for VertexLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// VERTEX ITEMS
// =============================================================================

/// Position-only vertex.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PositionVertex {
    /// Position [x, y, z].
    pub position: [f32; 3],
}

/// Colored vertex (debug lines, UI).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PositionColorVertex {
    /// Position [x, y, z].
    pub position: [f32; 3],
    /// Color [r, g, b, a].
    pub color: [f32; 4],
}

/// Lit, textured vertex.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PositionNormalUvVertex {
    /// Position [x, y, z].
    pub position: [f32; 3],
    /// Normal [nx, ny, nz].
    pub normal: [f32; 3],
    /// Texture coordinates [u, v].
    pub uv: [f32; 2],
}

/// Skinned vertex, rewritten by the animation updaters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SkinnedVertex {
    /// Position [x, y, z].
    pub position: [f32; 3],
    /// Normal [nx, ny, nz].
    pub normal: [f32; 3],
    /// Texture coordinates [u, v].
    pub uv: [f32; 2],
    /// Joint indices.
    pub joints: [u32; 4],
    /// Joint weights.
    pub weights: [f32; 4],
}

// =============================================================================
// VERTEX STREAM
// =============================================================================

/// Typed item list of a single layout.
#[derive(Debug, Clone, PartialEq)]
pub enum VertexStream {
    /// [`PositionVertex`] items.
    Position(Vec<PositionVertex>),
    /// [`PositionColorVertex`] items.
    PositionColor(Vec<PositionColorVertex>),
    /// [`PositionNormalUvVertex`] items.
    PositionNormalUv(Vec<PositionNormalUvVertex>),
    /// [`SkinnedVertex`] items.
    Skinned(Vec<SkinnedVertex>),
}

/// Runs `$body` with `$items` bound to the inner vector, whatever the variant.
macro_rules! each_stream {
    ($stream:expr, $items:ident => $body:expr) => {
        match $stream {
            VertexStream::Position($items) => $body,
            VertexStream::PositionColor($items) => $body,
            VertexStream::PositionNormalUv($items) => $body,
            VertexStream::Skinned($items) => $body,
        }
    };
}

impl VertexStream {
    /// Creates an empty stream of the given layout.
    #[must_use]
    pub const fn empty(layout: VertexLayout) -> Self {
        match layout {
            VertexLayout::Position => Self::Position(Vec::new()),
            VertexLayout::PositionColor => Self::PositionColor(Vec::new()),
            VertexLayout::PositionNormalUv => Self::PositionNormalUv(Vec::new()),
            VertexLayout::Skinned => Self::Skinned(Vec::new()),
        }
    }

    /// Layout tag of the items.
    #[must_use]
    pub const fn layout(&self) -> VertexLayout {
        match self {
            Self::Position(_) => VertexLayout::Position,
            Self::PositionColor(_) => VertexLayout::PositionColor,
            Self::PositionNormalUv(_) => VertexLayout::PositionNormalUv,
            Self::Skinned(_) => VertexLayout::Skinned,
        }
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        each_stream!(self, items => items.len())
    }

    /// Returns true if there are no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes of the items.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        each_stream!(self, items => bytemuck::cast_slice(items))
    }

    /// Moves every item of `other` to the end of `self`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LayoutMismatch`] if the layouts differ.
    pub fn append(&mut self, other: Self) -> BufferResult<()> {
        let (expected, found) = (self.layout(), other.layout());
        match (self, other) {
            (Self::Position(a), Self::Position(mut b)) => a.append(&mut b),
            (Self::PositionColor(a), Self::PositionColor(mut b)) => a.append(&mut b),
            (Self::PositionNormalUv(a), Self::PositionNormalUv(mut b)) => a.append(&mut b),
            (Self::Skinned(a), Self::Skinned(mut b)) => a.append(&mut b),
            _ => return Err(BufferError::LayoutMismatch { expected, found }),
        }
        Ok(())
    }

    /// Removes the items in `range`, shifting later items down.
    pub fn remove_range(&mut self, range: Range<usize>) {
        each_stream!(self, items => {
            items.drain(range);
        });
    }

    /// Replaces items starting at `offset` with the items of `data`.
    ///
    /// # Errors
    ///
    /// Fails on layout mismatch or if the range reaches past the end.
    pub fn overwrite(&mut self, offset: usize, data: &Self) -> BufferResult<()> {
        let (expected, found) = (self.layout(), data.layout());
        let end = range_end(offset, data.len(), self.len())?;
        match (self, data) {
            (Self::Position(a), Self::Position(b)) => a[offset..end].copy_from_slice(b),
            (Self::PositionColor(a), Self::PositionColor(b)) => a[offset..end].copy_from_slice(b),
            (Self::PositionNormalUv(a), Self::PositionNormalUv(b)) => a[offset..end].copy_from_slice(b),
            (Self::Skinned(a), Self::Skinned(b)) => a[offset..end].copy_from_slice(b),
            _ => return Err(BufferError::LayoutMismatch { expected, found }),
        }
        Ok(())
    }
}

impl From<Vec<PositionVertex>> for VertexStream {
    fn from(items: Vec<PositionVertex>) -> Self {
        Self::Position(items)
    }
}

impl From<Vec<PositionColorVertex>> for VertexStream {
    fn from(items: Vec<PositionColorVertex>) -> Self {
        Self::PositionColor(items)
    }
}

impl From<Vec<PositionNormalUvVertex>> for VertexStream {
    fn from(items: Vec<PositionNormalUvVertex>) -> Self {
        Self::PositionNormalUv(items)
    }
}

impl From<Vec<SkinnedVertex>> for VertexStream {
    fn from(items: Vec<SkinnedVertex>) -> Self {
        Self::Skinned(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides_match_item_sizes() {
        assert_eq!(VertexLayout::Position.stride() as usize, std::mem::size_of::<PositionVertex>());
        assert_eq!(VertexLayout::PositionColor.stride() as usize, std::mem::size_of::<PositionColorVertex>());
        assert_eq!(
            VertexLayout::PositionNormalUv.stride() as usize,
            std::mem::size_of::<PositionNormalUvVertex>()
        );
        assert_eq!(VertexLayout::Skinned.stride() as usize, std::mem::size_of::<SkinnedVertex>());
    }

    #[test]
    fn test_elements_are_packed() {
        // The last element must end exactly at the stride.
        for layout in VertexLayout::ALL {
            let elements = layout.input_elements(0);
            let end = elements.iter().map(|e| e.offset + e.format.size()).max().unwrap();
            assert_eq!(end, layout.stride(), "{layout}");
        }
    }

    #[test]
    fn test_elements_carry_slot() {
        let elements = VertexLayout::Skinned.input_elements(4);
        assert_eq!(elements.len(), 5);
        assert!(elements.iter().all(|e| e.input_slot == 4 && e.step == StepRate::Vertex));
    }

    #[test]
    fn test_append_and_remove_range() {
        let mut stream = VertexStream::from(vec![PositionVertex { position: [0.0; 3] }; 4]);
        stream.append(VertexStream::from(vec![PositionVertex { position: [1.0; 3] }; 2])).unwrap();
        assert_eq!(stream.len(), 6);

        stream.remove_range(0..4);
        assert_eq!(stream.len(), 2);
        assert_eq!(stream, VertexStream::from(vec![PositionVertex { position: [1.0; 3] }; 2]));
    }

    #[test]
    fn test_append_rejects_other_layout() {
        let mut stream = VertexStream::empty(VertexLayout::Position);
        let err = stream.append(VertexStream::from(vec![SkinnedVertex::default()])).unwrap_err();
        assert_eq!(
            err,
            BufferError::LayoutMismatch { expected: VertexLayout::Position, found: VertexLayout::Skinned }
        );
    }

    #[test]
    fn test_overwrite_bounds() {
        let mut stream = VertexStream::from(vec![PositionVertex::default(); 3]);
        let patch = VertexStream::from(vec![PositionVertex { position: [9.0; 3] }; 2]);

        stream.overwrite(1, &patch).unwrap();
        assert_eq!(stream.as_bytes().len(), 36);

        let err = stream.overwrite(2, &patch).unwrap_err();
        assert_eq!(err, BufferError::RangeOutOfBounds { offset: 2, end: 4, len: 3 });
    }

    #[test]
    fn test_overwrite_offset_near_usize_max() {
        let mut stream = VertexStream::from(vec![PositionVertex::default(); 3]);
        let patch = VertexStream::from(vec![PositionVertex::default()]);

        let err = stream.overwrite(usize::MAX, &patch).unwrap_err();
        assert_eq!(err, BufferError::RangeOutOfBounds { offset: usize::MAX, end: usize::MAX, len: 3 });
    }

    #[test]
    fn test_layout_names_round_trip_through_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            layout: VertexLayout,
        }
        let parsed: Wrapper = toml::from_str("layout = \"position_normal_uv\"").unwrap();
        assert_eq!(parsed.layout, VertexLayout::PositionNormalUv);
    }
}
