//! # Descriptors
//!
//! Caller-held handles into a range of a group's flat item list.
//!
//! A descriptor is handed out by `add_*` immediately, before its data has
//! been placed anywhere. The manager fills it in when the queued request is
//! applied at commit, and rewrites its offset whenever an earlier range of
//! the same group is removed. Producers only read it.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Which partition a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// Vertex data (grouped by layout and mutability).
    Vertex,
    /// Index data (grouped by mutability).
    Index,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vertex => "vertex",
            Self::Index => "index",
        })
    }
}

/// Lifecycle of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    /// Enqueued, not yet applied by a commit.
    Pending,
    /// Applied with no items. Owns nothing.
    Empty,
    /// Owns `count` items starting at `offset` in group `slot`.
    Bound {
        /// Slot of the owning group.
        slot: usize,
        /// Index of the first owned item.
        offset: usize,
        /// Number of owned items.
        count: usize,
    },
    /// Removed. Offset and count are meaningless.
    Released,
}

struct DescriptorInner {
    id: String,
    kind: DataKind,
    state: RwLock<DescriptorState>,
}

/// Shared handle to a sub-allocated range.
///
/// Clones refer to the same range. Equality is identity, not content.
#[derive(Clone)]
pub struct Descriptor {
    inner: Arc<DescriptorInner>,
}

impl Descriptor {
    pub(crate) fn new(id: String, kind: DataKind) -> Self {
        Self {
            inner: Arc::new(DescriptorInner {
                id,
                kind,
                state: RwLock::new(DescriptorState::Pending),
            }),
        }
    }

    /// Producer-supplied label.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Partition this descriptor belongs to.
    #[must_use]
    pub fn kind(&self) -> DataKind {
        self.inner.kind
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DescriptorState {
        *self.inner.state.read()
    }

    /// Slot of the owning group, once bound.
    #[must_use]
    pub fn group_slot(&self) -> Option<usize> {
        match self.state() {
            DescriptorState::Bound { slot, .. } => Some(slot),
            _ => None,
        }
    }

    /// Index of the first owned item (0 unless bound).
    #[must_use]
    pub fn offset(&self) -> usize {
        match self.state() {
            DescriptorState::Bound { offset, .. } => offset,
            _ => 0,
        }
    }

    /// Number of owned items (0 unless bound).
    #[must_use]
    pub fn count(&self) -> usize {
        match self.state() {
            DescriptorState::Bound { count, .. } => count,
            _ => 0,
        }
    }

    /// Returns true once a commit has placed this descriptor's data.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        matches!(self.state(), DescriptorState::Bound { .. })
    }

    /// Returns true if both handles refer to the same range.
    #[inline]
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn bind(&self, slot: usize, offset: usize, count: usize) {
        *self.inner.state.write() = DescriptorState::Bound { slot, offset, count };
    }

    pub(crate) fn set_offset(&self, new_offset: usize) {
        if let DescriptorState::Bound { offset, .. } = &mut *self.inner.state.write() {
            *offset = new_offset;
        }
    }

    pub(crate) fn mark_empty(&self) {
        *self.inner.state.write() = DescriptorState::Empty;
    }

    pub(crate) fn release(&self) {
        *self.inner.state.write() = DescriptorState::Released;
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Descriptor {}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let d = Descriptor::new("mesh".into(), DataKind::Vertex);
        assert_eq!(d.state(), DescriptorState::Pending);
        assert_eq!(d.group_slot(), None);

        d.bind(2, 10, 5);
        assert_eq!(d.group_slot(), Some(2));
        assert_eq!((d.offset(), d.count()), (10, 5));

        d.set_offset(0);
        assert_eq!(d.offset(), 0);

        d.release();
        assert_eq!(d.state(), DescriptorState::Released);
        assert_eq!(d.count(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let a = Descriptor::new("a".into(), DataKind::Index);
        let b = a.clone();
        a.bind(0, 3, 3);
        assert_eq!(b.offset(), 3);
        assert_eq!(a, b);

        let c = Descriptor::new("a".into(), DataKind::Index);
        assert_ne!(a, c);
    }

    #[test]
    fn test_set_offset_ignores_unbound() {
        let d = Descriptor::new("x".into(), DataKind::Vertex);
        d.mark_empty();
        d.set_offset(7);
        assert_eq!(d.state(), DescriptorState::Empty);
    }
}
