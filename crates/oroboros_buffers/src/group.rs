//! # Sub-Allocation Groups
//!
//! A group is the logical content of one physical buffer: a flat item list
//! plus the descriptors that own consecutive ranges of it.
//!
//! ## Invariants
//!
//! - `descriptors[0].offset == 0`
//! - `descriptors[i].offset == descriptors[i - 1].offset + descriptors[i - 1].count`
//! - `to_allocate_size() == sum(descriptor.count)`
//!
//! Groups are never destroyed. A group whose descriptors have all been
//! removed keeps its slot and is reused by the next add with the same key;
//! reallocating it simply yields no physical buffer.

use std::ops::Range;

use tracing::debug;

use crate::backend::{BufferData, BufferHandle, VertexBinding};
use crate::descriptor::Descriptor;
use crate::error::{range_end, BufferError, BufferResult};
use crate::layout::{VertexLayout, VertexStream};

// =============================================================================
// ITEM STREAMS
// =============================================================================

/// Flat item storage of a group.
pub trait ItemStream: Send {
    /// Number of items.
    fn len(&self) -> usize;

    /// Returns true if there are no items.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of one item in bytes.
    fn stride(&self) -> u32;

    /// Raw bytes of all items.
    fn as_bytes(&self) -> &[u8];

    /// Moves every item of `other` to the end.
    ///
    /// # Errors
    ///
    /// Fails if `other` is not compatible with this stream.
    fn append(&mut self, other: Self) -> BufferResult<()>
    where
        Self: Sized;

    /// Removes the items in `range`.
    fn remove_range(&mut self, range: Range<usize>);

    /// Replaces items starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails on incompatible data or if the range reaches past the end.
    fn overwrite(&mut self, offset: usize, data: &Self) -> BufferResult<()>
    where
        Self: Sized;

    /// Payload for the backend.
    fn data(&self) -> BufferData<'_> {
        BufferData::new(self.as_bytes(), self.stride())
    }
}

impl ItemStream for VertexStream {
    fn len(&self) -> usize {
        VertexStream::len(self)
    }

    fn stride(&self) -> u32 {
        self.layout().stride()
    }

    fn as_bytes(&self) -> &[u8] {
        VertexStream::as_bytes(self)
    }

    fn append(&mut self, other: Self) -> BufferResult<()> {
        VertexStream::append(self, other)
    }

    fn remove_range(&mut self, range: Range<usize>) {
        VertexStream::remove_range(self, range);
    }

    fn overwrite(&mut self, offset: usize, data: &Self) -> BufferResult<()> {
        VertexStream::overwrite(self, offset, data)
    }
}

/// 32-bit index list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStream(pub Vec<u32>);

impl From<Vec<u32>> for IndexStream {
    fn from(indices: Vec<u32>) -> Self {
        Self(indices)
    }
}

impl ItemStream for IndexStream {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn stride(&self) -> u32 {
        4
    }

    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.0)
    }

    fn append(&mut self, mut other: Self) -> BufferResult<()> {
        self.0.append(&mut other.0);
        Ok(())
    }

    fn remove_range(&mut self, range: Range<usize>) {
        self.0.drain(range);
    }

    fn overwrite(&mut self, offset: usize, data: &Self) -> BufferResult<()> {
        let end = range_end(offset, data.0.len(), self.0.len())?;
        self.0[offset..end].copy_from_slice(&data.0);
        Ok(())
    }
}

// =============================================================================
// KEYS
// =============================================================================

/// Compatibility key of a vertex group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexKey {
    /// Vertex layout.
    pub layout: VertexLayout,
    /// Writable buffer.
    pub dynamic: bool,
}

/// Compatibility key of an index group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexKey {
    /// Writable buffer.
    pub dynamic: bool,
}

// =============================================================================
// GROUP
// =============================================================================

/// Logical content of one physical buffer.
pub struct SubAllocationGroup<S, K> {
    key: K,
    items: S,
    descriptors: Vec<Descriptor>,
    /// Instance demand of member descriptors (vertex groups only).
    instances: usize,
    /// Items present in the last physical allocation.
    allocated_size: usize,
    /// A physical allocation pass has run at least once.
    allocated: bool,
    /// Structural change since the last allocation.
    reallocation_needed: bool,
    buffer: Option<BufferHandle>,
    instancing: VertexBinding,
}

/// Group of vertex data.
pub type VertexGroup = SubAllocationGroup<VertexStream, VertexKey>;

/// Group of index data.
pub type IndexGroup = SubAllocationGroup<IndexStream, IndexKey>;

impl<S: ItemStream, K: Copy> SubAllocationGroup<S, K> {
    /// Creates an empty, never-allocated group.
    pub fn new(key: K, items: S) -> Self {
        Self {
            key,
            items,
            descriptors: Vec::new(),
            instances: 0,
            allocated_size: 0,
            allocated: false,
            reallocation_needed: false,
            buffer: None,
            instancing: VertexBinding::default(),
        }
    }

    /// Compatibility key.
    pub fn key(&self) -> K {
        self.key
    }

    /// Flat item list.
    pub fn items(&self) -> &S {
        &self.items
    }

    /// Member descriptors in offset order.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Declared instance demand.
    pub fn instances(&self) -> usize {
        self.instances
    }

    /// Items present in the last physical allocation.
    pub fn allocated_size(&self) -> usize {
        self.allocated_size
    }

    /// Items currently in the logical list.
    pub fn to_allocate_size(&self) -> usize {
        self.items.len()
    }

    /// Whether a physical allocation pass has ever run.
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Needs a physical allocation before it can be bound.
    pub fn is_dirty(&self) -> bool {
        !self.allocated || self.reallocation_needed
    }

    /// Current physical buffer.
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    /// Geometry binding at the group's own slot.
    pub fn geometry_binding(&self) -> VertexBinding {
        VertexBinding {
            buffer: self.buffer,
            stride: self.items.stride(),
            offset: 0,
        }
    }

    /// Instancing binding at the group's instancing slot.
    pub fn instancing_binding(&self) -> VertexBinding {
        self.instancing
    }

    /// Checks the contiguity and conservation invariants.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 0;
        for descriptor in &self.descriptors {
            if descriptor.offset() != expected {
                return false;
            }
            expected += descriptor.count();
        }
        expected == self.items.len()
    }

    /// Appends `items` under `descriptor` and binds it to `slot`.
    ///
    /// # Errors
    ///
    /// Fails if `items` are incompatible with the group.
    pub fn apply_add(&mut self, slot: usize, descriptor: &Descriptor, items: S, instances: usize) -> BufferResult<()> {
        let offset = self.items.len();
        let count = items.len();
        self.items.append(items)?;
        descriptor.bind(slot, offset, count);
        self.descriptors.push(descriptor.clone());
        self.instances = self.instances.saturating_add(instances);
        Ok(())
    }

    /// Splices the descriptor's range out and reflows later offsets.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::UnknownDescriptor`] if the descriptor is not a
    /// member of this group.
    pub fn apply_remove(&mut self, descriptor: &Descriptor, instances: usize) -> BufferResult<()> {
        let Some(position) = self.descriptors.iter().position(|d| d.same_as(descriptor)) else {
            return Err(BufferError::UnknownDescriptor { id: descriptor.id().to_owned() });
        };

        let offset = descriptor.offset();
        self.items.remove_range(offset..offset + descriptor.count());
        self.descriptors.remove(position);
        self.reflow(position);

        self.instances = self.instances.saturating_sub(instances);
        self.reallocation_needed = true;
        descriptor.release();
        Ok(())
    }

    /// Reassigns offsets of every descriptor from `start` on.
    fn reflow(&mut self, start: usize) {
        let mut offset = match start.checked_sub(1).and_then(|i| self.descriptors.get(i)) {
            Some(prev) => prev.offset() + prev.count(),
            None => 0,
        };
        for descriptor in &self.descriptors[start..] {
            descriptor.set_offset(offset);
            offset += descriptor.count();
        }
    }

    /// Flags a structural change.
    pub fn mark_reallocation_needed(&mut self) {
        self.reallocation_needed = true;
    }

    /// Detaches the physical buffer for destruction.
    pub fn take_buffer(&mut self) -> Option<BufferHandle> {
        self.buffer.take()
    }

    /// Records a completed physical allocation.
    pub fn mark_allocated(&mut self, buffer: Option<BufferHandle>) {
        self.buffer = buffer;
        self.allocated = true;
        self.allocated_size = self.items.len();
        self.reallocation_needed = false;
    }

    /// Points the instancing slot at the shared buffer.
    pub fn set_instancing_binding(&mut self, binding: VertexBinding) {
        self.instancing = binding;
    }

    /// Overwrites allocated items in the CPU mirror.
    ///
    /// # Errors
    ///
    /// Fails if the range reaches past `allocated_size`.
    pub fn overwrite(&mut self, offset: usize, data: &S) -> BufferResult<()> {
        range_end(offset, data.len(), self.allocated_size)?;
        self.items.overwrite(offset, data)
    }
}

impl VertexGroup {
    /// Vertex layout of the group.
    pub fn layout(&self) -> VertexLayout {
        self.key.layout
    }
}

// =============================================================================
// GROUP TABLE
// =============================================================================

/// Every group owned by a manager, plus per-category dirty flags.
#[derive(Default)]
pub(crate) struct GroupTable {
    pub(crate) vertex: Vec<VertexGroup>,
    pub(crate) index: Vec<IndexGroup>,
    /// A vertex group's logical size diverged from its allocation.
    pub(crate) vertex_dirty: bool,
    /// An index group's logical size diverged from its allocation.
    pub(crate) index_dirty: bool,
    /// A group was created since the last allocation pass.
    pub(crate) needs_allocation: bool,
}

impl GroupTable {
    /// Slot of the vertex group for `key`, creating it if needed.
    ///
    /// Returns `(slot, existed)`.
    pub(crate) fn vertex_slot(&mut self, key: VertexKey) -> (usize, bool) {
        if let Some(slot) = self.vertex.iter().position(|g| g.key() == key) {
            return (slot, true);
        }
        self.vertex.push(VertexGroup::new(key, VertexStream::empty(key.layout)));
        let slot = self.vertex.len() - 1;
        debug!("created vertex group {} ({}, dynamic={})", slot, key.layout, key.dynamic);
        (slot, false)
    }

    /// Slot of the index group for `key`, creating it if needed.
    ///
    /// Returns `(slot, existed)`.
    pub(crate) fn index_slot(&mut self, key: IndexKey) -> (usize, bool) {
        if let Some(slot) = self.index.iter().position(|g| g.key() == key) {
            return (slot, true);
        }
        self.index.push(IndexGroup::new(key, IndexStream::default()));
        let slot = self.index.len() - 1;
        debug!("created index group {} (dynamic={})", slot, key.dynamic);
        (slot, false)
    }

    /// Sum of instance demand over all vertex groups.
    pub(crate) fn total_instances(&self) -> usize {
        self.vertex.iter().map(VertexGroup::instances).fold(0, usize::saturating_add)
    }

    /// The next commit must scan vertex groups.
    pub(crate) fn vertex_pass_needed(&self) -> bool {
        self.vertex_dirty || self.needs_allocation
    }

    /// The next commit must scan index groups.
    pub(crate) fn index_pass_needed(&self) -> bool {
        self.index_dirty || self.needs_allocation
    }

    /// Resets the category flags once an allocation pass has run.
    pub(crate) fn clear_category_flags(&mut self) {
        self.vertex_dirty = false;
        self.index_dirty = false;
        self.needs_allocation = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DataKind;
    use crate::layout::PositionVertex;

    fn vertices(n: usize) -> VertexStream {
        VertexStream::from(vec![PositionVertex::default(); n])
    }

    fn group() -> VertexGroup {
        VertexGroup::new(
            VertexKey { layout: VertexLayout::Position, dynamic: false },
            VertexStream::empty(VertexLayout::Position),
        )
    }

    #[test]
    fn test_add_assigns_consecutive_offsets() {
        let mut g = group();
        let a = Descriptor::new("a".into(), DataKind::Vertex);
        let b = Descriptor::new("b".into(), DataKind::Vertex);

        g.apply_add(0, &a, vertices(100), 0).unwrap();
        g.apply_add(0, &b, vertices(50), 2).unwrap();

        assert_eq!((a.offset(), a.count()), (0, 100));
        assert_eq!((b.offset(), b.count()), (100, 50));
        assert_eq!(g.to_allocate_size(), 150);
        assert_eq!(g.instances(), 2);
        assert!(g.is_contiguous());
    }

    #[test]
    fn test_remove_reflows_later_descriptors() {
        let mut g = group();
        let ds: Vec<_> = (0..4).map(|i| Descriptor::new(format!("d{i}"), DataKind::Vertex)).collect();
        for (i, d) in ds.iter().enumerate() {
            g.apply_add(0, d, vertices(10 * (i + 1)), 1).unwrap();
        }

        g.apply_remove(&ds[1], 1).unwrap();

        assert_eq!(ds[0].offset(), 0);
        assert_eq!(ds[2].offset(), 10);
        assert_eq!(ds[3].offset(), 40);
        assert_eq!(g.to_allocate_size(), 80);
        assert_eq!(g.instances(), 3);
        assert!(g.is_contiguous());
        assert!(!ds[1].is_bound());
    }

    #[test]
    fn test_remove_unknown_descriptor() {
        let mut g = group();
        let stranger = Descriptor::new("stranger".into(), DataKind::Vertex);
        let err = g.apply_remove(&stranger, 0).unwrap_err();
        assert_eq!(err, BufferError::UnknownDescriptor { id: "stranger".into() });
    }

    #[test]
    fn test_dirty_transitions() {
        let mut g = group();
        assert!(g.is_dirty());

        g.mark_allocated(None);
        assert!(!g.is_dirty());

        g.mark_reallocation_needed();
        assert!(g.is_dirty());
    }

    #[test]
    fn test_overwrite_limited_to_allocation() {
        let mut g = IndexGroup::new(IndexKey { dynamic: true }, IndexStream::default());
        let d = Descriptor::new("i".into(), DataKind::Index);
        g.apply_add(0, &d, IndexStream(vec![0, 1, 2, 3]), 0).unwrap();

        // Nothing allocated yet.
        assert!(g.overwrite(0, &IndexStream(vec![9])).is_err());

        g.mark_allocated(Some(BufferHandle::new(1)));
        g.overwrite(2, &IndexStream(vec![7, 8])).unwrap();
        assert_eq!(g.items().0, vec![0, 1, 7, 8]);

        assert_eq!(
            g.overwrite(usize::MAX - 1, &IndexStream(vec![7, 8, 9])),
            Err(BufferError::RangeOutOfBounds { offset: usize::MAX - 1, end: usize::MAX, len: 4 })
        );
        let mut items = g.items().clone();
        assert!(items.overwrite(usize::MAX, &IndexStream(vec![1])).is_err());
    }

    #[test]
    fn test_table_reuses_slots() {
        let mut table = GroupTable::default();
        let key = VertexKey { layout: VertexLayout::Skinned, dynamic: true };
        assert_eq!(table.vertex_slot(key), (0, false));
        assert_eq!(table.vertex_slot(key), (0, true));
        assert_eq!(table.index_slot(IndexKey { dynamic: false }), (0, false));
        assert_eq!(table.index_slot(IndexKey { dynamic: true }), (1, false));
    }
}
