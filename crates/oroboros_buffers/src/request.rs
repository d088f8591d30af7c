//! Queued mutations.
//!
//! Producers never touch groups directly. `add_*`/`remove_*` package their
//! intent as a request; the committing thread applies requests in FIFO
//! order. No reordering or coalescing happens, so an add immediately
//! followed by a remove of the same descriptor is two structural edits.

use tracing::debug;

use crate::descriptor::{DataKind, Descriptor, DescriptorState};
use crate::error::{BufferError, BufferResult};
use crate::group::{GroupTable, IndexKey, IndexStream, ItemStream, VertexKey};
use crate::layout::VertexStream;

/// Contract shared by vertex and index requests.
pub(crate) trait Mutation {
    /// Applies the request to the group table. Marks it processed even on error.
    fn apply(&mut self, groups: &mut GroupTable) -> BufferResult<()>;

    /// Whether `apply` has run.
    fn is_processed(&self) -> bool;
}

/// Add or remove of vertex data.
pub(crate) struct VertexRequest {
    descriptor: Descriptor,
    /// Items and mutability for adds, `None` for removes.
    payload: Option<(VertexStream, bool)>,
    instances: usize,
    processed: bool,
}

impl VertexRequest {
    pub(crate) fn add(descriptor: Descriptor, items: VertexStream, dynamic: bool, instances: usize) -> Self {
        Self { descriptor, payload: Some((items, dynamic)), instances, processed: false }
    }

    pub(crate) fn remove(descriptor: Descriptor, instances: usize) -> Self {
        Self { descriptor, payload: None, instances, processed: false }
    }

    fn apply_add(&self, groups: &mut GroupTable, items: VertexStream, dynamic: bool) -> BufferResult<()> {
        if items.is_empty() {
            debug!("empty vertex add for {} ignored", self.descriptor.id());
            self.descriptor.mark_empty();
            return Ok(());
        }

        let (slot, existed) = groups.vertex_slot(VertexKey { layout: items.layout(), dynamic });
        let group = &mut groups.vertex[slot];
        group.apply_add(slot, &self.descriptor, items, self.instances)?;
        if existed {
            group.mark_reallocation_needed();
        } else {
            groups.needs_allocation = true;
        }
        if group.allocated_size() != group.to_allocate_size() {
            groups.vertex_dirty = true;
        }
        Ok(())
    }
}

impl Mutation for VertexRequest {
    fn apply(&mut self, groups: &mut GroupTable) -> BufferResult<()> {
        self.processed = true;
        match self.payload.take() {
            Some((items, dynamic)) => self.apply_add(groups, items, dynamic),
            None => {
                let slot = resolve_removal(&self.descriptor, DataKind::Vertex)?;
                let Some(slot) = slot else { return Ok(()) };
                let group = groups.vertex.get_mut(slot).ok_or_else(|| unknown(&self.descriptor))?;
                group.apply_remove(&self.descriptor, self.instances)?;
                if group.allocated_size() != group.to_allocate_size() {
                    groups.vertex_dirty = true;
                }
                Ok(())
            }
        }
    }

    fn is_processed(&self) -> bool {
        self.processed
    }
}

/// Add or remove of index data.
pub(crate) struct IndexRequest {
    descriptor: Descriptor,
    payload: Option<(IndexStream, bool)>,
    processed: bool,
}

impl IndexRequest {
    pub(crate) fn add(descriptor: Descriptor, indices: IndexStream, dynamic: bool) -> Self {
        Self { descriptor, payload: Some((indices, dynamic)), processed: false }
    }

    pub(crate) fn remove(descriptor: Descriptor) -> Self {
        Self { descriptor, payload: None, processed: false }
    }

    fn apply_add(&self, groups: &mut GroupTable, indices: IndexStream, dynamic: bool) -> BufferResult<()> {
        if indices.is_empty() {
            debug!("empty index add for {} ignored", self.descriptor.id());
            self.descriptor.mark_empty();
            return Ok(());
        }

        let (slot, existed) = groups.index_slot(IndexKey { dynamic });
        let group = &mut groups.index[slot];
        group.apply_add(slot, &self.descriptor, indices, 0)?;
        if existed {
            group.mark_reallocation_needed();
        } else {
            groups.needs_allocation = true;
        }
        if group.allocated_size() != group.to_allocate_size() {
            groups.index_dirty = true;
        }
        Ok(())
    }
}

impl Mutation for IndexRequest {
    fn apply(&mut self, groups: &mut GroupTable) -> BufferResult<()> {
        self.processed = true;
        match self.payload.take() {
            Some((indices, dynamic)) => self.apply_add(groups, indices, dynamic),
            None => {
                let slot = resolve_removal(&self.descriptor, DataKind::Index)?;
                let Some(slot) = slot else { return Ok(()) };
                let group = groups.index.get_mut(slot).ok_or_else(|| unknown(&self.descriptor))?;
                group.apply_remove(&self.descriptor, 0)?;
                if group.allocated_size() != group.to_allocate_size() {
                    groups.index_dirty = true;
                }
                Ok(())
            }
        }
    }

    fn is_processed(&self) -> bool {
        self.processed
    }
}

/// Any queued request.
pub(crate) enum Request {
    Vertex(VertexRequest),
    Index(IndexRequest),
}

impl Mutation for Request {
    fn apply(&mut self, groups: &mut GroupTable) -> BufferResult<()> {
        match self {
            Self::Vertex(request) => request.apply(groups),
            Self::Index(request) => request.apply(groups),
        }
    }

    fn is_processed(&self) -> bool {
        match self {
            Self::Vertex(request) => request.is_processed(),
            Self::Index(request) => request.is_processed(),
        }
    }
}

fn unknown(descriptor: &Descriptor) -> BufferError {
    BufferError::UnknownDescriptor { id: descriptor.id().to_owned() }
}

/// Decides where a removal applies.
///
/// `Ok(None)` means the descriptor owns nothing and only needs releasing.
fn resolve_removal(descriptor: &Descriptor, expected: DataKind) -> BufferResult<Option<usize>> {
    if descriptor.kind() != expected {
        return Err(BufferError::DescriptorKindMismatch {
            id: descriptor.id().to_owned(),
            expected,
            actual: descriptor.kind(),
        });
    }
    match descriptor.state() {
        DescriptorState::Bound { slot, .. } => Ok(Some(slot)),
        DescriptorState::Empty => {
            descriptor.release();
            Ok(None)
        }
        DescriptorState::Pending | DescriptorState::Released => Err(unknown(descriptor)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PositionColorVertex;

    fn add(table: &mut GroupTable, id: &str, n: usize, instances: usize) -> Descriptor {
        let d = Descriptor::new(id.into(), DataKind::Vertex);
        let items = VertexStream::from(vec![PositionColorVertex::default(); n]);
        let mut request = VertexRequest::add(d.clone(), items, false, instances);
        request.apply(table).unwrap();
        assert!(request.is_processed());
        d
    }

    #[test]
    fn test_first_add_creates_group() {
        let mut table = GroupTable::default();
        let d = add(&mut table, "a", 3, 0);

        assert_eq!(table.vertex.len(), 1);
        assert!(table.needs_allocation);
        assert!(table.vertex_dirty);
        assert_eq!(d.group_slot(), Some(0));
    }

    #[test]
    fn test_empty_add_is_noop() {
        let mut table = GroupTable::default();
        let d = add(&mut table, "empty", 0, 0);

        assert!(table.vertex.is_empty());
        assert_eq!(d.state(), DescriptorState::Empty);

        // Removing it only releases the handle.
        let mut remove = VertexRequest::remove(d.clone(), 0);
        remove.apply(&mut table).unwrap();
        assert_eq!(d.state(), DescriptorState::Released);
    }

    #[test]
    fn test_double_remove_is_unknown() {
        let mut table = GroupTable::default();
        let d = add(&mut table, "a", 3, 0);

        VertexRequest::remove(d.clone(), 0).apply(&mut table).unwrap();
        let err = VertexRequest::remove(d, 0).apply(&mut table).unwrap_err();
        assert_eq!(err, BufferError::UnknownDescriptor { id: "a".into() });
    }

    #[test]
    fn test_kind_mismatch() {
        let mut table = GroupTable::default();
        let d = add(&mut table, "v", 3, 0);

        let mut request = Request::Index(IndexRequest::remove(d));
        let err = request.apply(&mut table).unwrap_err();
        assert!(matches!(err, BufferError::DescriptorKindMismatch { expected: DataKind::Index, .. }));
        assert!(request.is_processed());
    }

    #[test]
    fn test_index_add_and_remove() {
        let mut table = GroupTable::default();
        let a = Descriptor::new("a".into(), DataKind::Index);
        let b = Descriptor::new("b".into(), DataKind::Index);
        IndexRequest::add(a.clone(), IndexStream(vec![0, 1, 2]), true).apply(&mut table).unwrap();
        IndexRequest::add(b.clone(), IndexStream(vec![2, 3, 0]), true).apply(&mut table).unwrap();
        assert_eq!(b.offset(), 3);

        IndexRequest::remove(a).apply(&mut table).unwrap();
        assert_eq!(b.offset(), 0);
        assert_eq!(table.index[0].items().0, vec![2, 3, 0]);
        assert!(table.index_dirty);
    }

    #[test]
    fn test_category_flags_follow_touched_kind() {
        let mut table = GroupTable::default();
        let v = add(&mut table, "v", 3, 0);
        table.vertex[0].mark_allocated(None);
        table.clear_category_flags();

        let i = Descriptor::new("i".into(), DataKind::Index);
        IndexRequest::add(i, IndexStream(vec![0, 1, 2]), false).apply(&mut table).unwrap();
        assert!(table.index_pass_needed());
        assert!(table.needs_allocation, "first index add creates a group");
        assert!(!table.vertex_dirty);

        table.index[0].mark_allocated(None);
        table.clear_category_flags();
        VertexRequest::remove(v, 0).apply(&mut table).unwrap();
        assert!(table.vertex_pass_needed());
        assert!(!table.index_pass_needed());
    }
}
