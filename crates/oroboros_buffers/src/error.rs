//! # Buffer Error Types
//!
//! All errors that can occur while sub-allocating GPU buffers.
//!
//! None of these are fatal. The render loop is expected to skip the
//! affected draw for a frame and retry after the next commit.

use thiserror::Error;

use crate::descriptor::DataKind;
use crate::layout::VertexLayout;

/// Errors that can occur in the buffer manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Operation attempted before the first successful commit.
    #[error("buffer manager not initialized: no commit has completed yet")]
    NotInitialized,

    /// Operation attempted on a group awaiting reallocation.
    #[error("{kind} group {slot} is awaiting reallocation")]
    GroupDirty {
        /// Vertex or index partition.
        kind: DataKind,
        /// Slot of the dirty group.
        slot: usize,
    },

    /// No group exists at the requested slot.
    #[error("no {kind} group at slot {slot}")]
    NoSuchGroup {
        /// Vertex or index partition.
        kind: DataKind,
        /// Requested slot.
        slot: usize,
    },

    /// The group exists but its last allocation produced no physical buffer.
    #[error("{kind} group {slot} has no physical buffer")]
    NoPhysicalBuffer {
        /// Vertex or index partition.
        kind: DataKind,
        /// Slot of the group.
        slot: usize,
    },

    /// No instancing buffer exists (total instance demand is zero).
    #[error("instancing buffer has not been allocated")]
    NoInstancingBuffer,

    /// Removal of a descriptor that is not present in its recorded group.
    #[error("unknown descriptor: {id}")]
    UnknownDescriptor {
        /// Producer-supplied label of the descriptor.
        id: String,
    },

    /// A vertex descriptor was routed through the index path or vice versa.
    #[error("descriptor {id} holds {actual} data, expected {expected}")]
    DescriptorKindMismatch {
        /// Producer-supplied label of the descriptor.
        id: String,
        /// Kind the operation expected.
        expected: DataKind,
        /// Kind the descriptor actually holds.
        actual: DataKind,
    },

    /// Item data does not match the layout of the target group.
    #[error("layout mismatch: group holds {expected}, got {found}")]
    LayoutMismatch {
        /// Layout of the group.
        expected: VertexLayout,
        /// Layout of the supplied data.
        found: VertexLayout,
    },

    /// A range write reaches past the allocated items of a group.
    #[error("range {offset}..{end} exceeds {len} allocated items")]
    RangeOutOfBounds {
        /// First item written.
        offset: usize,
        /// One past the last item written.
        end: usize,
        /// Items available.
        len: usize,
    },

    /// More instance records than the instancing buffer can hold.
    #[error("instancing overflow: capacity {capacity}, tried to write {requested}")]
    InstancingOverflow {
        /// Current capacity in records.
        capacity: usize,
        /// Records supplied.
        requested: usize,
    },

    /// The backend could not produce an input layout.
    #[error("backend failed to create input layout for technique {0}")]
    InputLayoutUnavailable(String),

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to read a configuration file.
    #[error("io error: {0}")]
    Io(String),
}

/// Result type for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// End of the item range `offset..offset + count`, checked against `len`.
pub(crate) fn range_end(offset: usize, count: usize, len: usize) -> BufferResult<usize> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(end),
        _ => Err(BufferError::RangeOutOfBounds { offset, end: offset.saturating_add(count), len }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BufferError::GroupDirty { kind: DataKind::Vertex, slot: 3 };
        assert_eq!(err.to_string(), "vertex group 3 is awaiting reallocation");

        let err = BufferError::LayoutMismatch {
            expected: VertexLayout::PositionColor,
            found: VertexLayout::Skinned,
        };
        assert_eq!(err.to_string(), "layout mismatch: group holds position_color, got skinned");
    }

    #[test]
    fn test_range_end() {
        assert_eq!(range_end(2, 3, 5), Ok(5));
        assert_eq!(range_end(0, 0, 0), Ok(0));
        assert_eq!(range_end(4, 2, 5), Err(BufferError::RangeOutOfBounds { offset: 4, end: 6, len: 5 }));
        assert_eq!(
            range_end(usize::MAX, 2, 5),
            Err(BufferError::RangeOutOfBounds { offset: usize::MAX, end: usize::MAX, len: 5 })
        );
    }
}
