//! Shared instancing buffer.
//!
//! One physical buffer serves every vertex group. Its capacity is the sum of
//! the instance demand declared by all vertex descriptors, so it is rebuilt
//! whenever any vertex group is reallocated.

use bytemuck::{Pod, Zeroable};

use crate::backend::{BufferData, BufferHandle, VertexBinding};
use crate::layout::{ElementEntry, ElementFormat, InputElement, StepRate};

/// Per-draw instance record.
///
/// Memory layout is 16-byte aligned rows (80 bytes total).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// World transform, row-major.
    pub transform: [[f32; 4]; 4],
    /// Tint color [r, g, b, a].
    pub color: [f32; 4],
}

impl InstanceRecord {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Identity transform, white tint.
    pub const IDENTITY: Self = Self {
        transform: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
        color: [1.0; 4],
    };

    /// Creates a record translated to `position`.
    #[must_use]
    pub fn at(position: [f32; 3]) -> Self {
        let mut record = Self::IDENTITY;
        record.transform[3] = [position[0], position[1], position[2], 1.0];
        record
    }

    /// Sets the tint color.
    #[must_use]
    pub fn with_color(mut self, r: f32, g: f32, b: f32, a: f32) -> Self {
        self.color = [r, g, b, a];
        self
    }

    /// Input elements of the record, read from `slot` at instance rate.
    #[must_use]
    pub fn input_elements(slot: u32) -> Vec<InputElement> {
        INSTANCE_ELEMENTS
            .iter()
            .map(|e| e.at_slot(slot, StepRate::Instance))
            .collect()
    }

    /// Stride as handed to the backend.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn stride() -> u32 {
        Self::SIZE as u32
    }
}

impl Default for InstanceRecord {
    fn default() -> Self {
        Self::IDENTITY
    }
}

static INSTANCE_ELEMENTS: [ElementEntry; 5] = [
    ElementEntry::new("INSTANCE_TRANSFORM", 0, ElementFormat::Float32x4, 0),
    ElementEntry::new("INSTANCE_TRANSFORM", 1, ElementFormat::Float32x4, 16),
    ElementEntry::new("INSTANCE_TRANSFORM", 2, ElementFormat::Float32x4, 32),
    ElementEntry::new("INSTANCE_TRANSFORM", 3, ElementFormat::Float32x4, 48),
    ElementEntry::new("INSTANCE_COLOR", 0, ElementFormat::Float32x4, 64),
];

/// State of the shared instancing buffer.
#[derive(Debug, Default)]
pub(crate) struct InstancingBuffer {
    handle: Option<BufferHandle>,
    capacity: usize,
}

impl InstancingBuffer {
    /// Physical buffer, if demand was non-zero at the last reallocation.
    pub(crate) const fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    /// Capacity in records.
    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Swaps in a new allocation, returning the previous handle for destruction.
    pub(crate) fn replace(&mut self, handle: Option<BufferHandle>, capacity: usize) -> Option<BufferHandle> {
        self.capacity = if handle.is_some() { capacity } else { 0 };
        std::mem::replace(&mut self.handle, handle)
    }

    /// Takes the handle for teardown.
    pub(crate) fn take(&mut self) -> Option<BufferHandle> {
        self.capacity = 0;
        self.handle.take()
    }

    /// Binding every vertex group receives at its instancing slot.
    pub(crate) const fn binding(&self) -> VertexBinding {
        VertexBinding {
            buffer: self.handle,
            stride: InstanceRecord::stride(),
            offset: 0,
        }
    }
}

/// Byte view of a record slice for upload.
pub(crate) fn record_data(records: &[InstanceRecord]) -> BufferData<'_> {
    BufferData::new(bytemuck::cast_slice(records), InstanceRecord::stride())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size() {
        // 4 rows of transform + 1 color row, 16 bytes each
        assert_eq!(InstanceRecord::SIZE, 80);
        assert_eq!(InstanceRecord::stride(), 80);
    }

    #[test]
    fn test_elements_are_instance_rate() {
        let elements = InstanceRecord::input_elements(3);
        assert_eq!(elements.len(), 5);
        assert!(elements.iter().all(|e| e.step == StepRate::Instance && e.input_slot == 3));
        let end = elements.iter().map(|e| e.offset + e.format.size()).max().unwrap();
        assert_eq!(end as usize, InstanceRecord::SIZE);
    }

    #[test]
    fn test_replace_tracks_capacity() {
        let mut buffer = InstancingBuffer::default();
        assert_eq!(buffer.replace(Some(BufferHandle::new(1)), 10), None);
        assert_eq!(buffer.capacity(), 10);

        let old = buffer.replace(None, 4);
        assert_eq!(old, Some(BufferHandle::new(1)));
        assert_eq!(buffer.capacity(), 0);
        assert_eq!(buffer.binding().buffer, None);
    }

    #[test]
    fn test_translation() {
        let record = InstanceRecord::at([1.0, 2.0, 3.0]).with_color(1.0, 0.0, 0.0, 1.0);
        assert_eq!(record.transform[3], [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(record_data(&[record]).item_count(), 1);
    }
}
