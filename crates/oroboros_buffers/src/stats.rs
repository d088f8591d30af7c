//! Commit statistics and group snapshots.

use crate::error::BufferError;
use crate::layout::VertexLayout;

/// What a single commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Requests drained from the queue and applied.
    pub requests_applied: usize,
    /// This commit performed the initial full allocation.
    pub initialized: bool,
    /// Vertex groups given a new physical buffer.
    pub vertex_groups_reallocated: usize,
    /// Index groups given a new physical buffer.
    pub index_groups_reallocated: usize,
    /// The shared instancing buffer was rebuilt.
    pub instancing_reallocated: bool,
    /// Instancing capacity after the commit (records).
    pub instancing_capacity: usize,
    /// Structural errors raised while applying requests.
    pub errors: Vec<BufferError>,
}

impl CommitStats {
    /// Returns true if the commit changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.requests_applied == 0
            && !self.initialized
            && self.vertex_groups_reallocated == 0
            && self.index_groups_reallocated == 0
            && !self.instancing_reallocated
    }
}

/// Snapshot of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Slot of the group.
    pub slot: usize,
    /// Vertex layout (`None` for index groups).
    pub layout: Option<VertexLayout>,
    /// Writable buffer.
    pub dynamic: bool,
    /// A physical allocation pass has run.
    pub allocated: bool,
    /// Items in the last physical allocation.
    pub allocated_size: usize,
    /// Items in the logical list.
    pub to_allocate_size: usize,
    /// Declared instance demand.
    pub instances: usize,
    /// Member descriptors.
    pub descriptors: usize,
    /// Awaiting reallocation.
    pub dirty: bool,
    /// Offsets are contiguous and sum to the logical size.
    pub contiguous: bool,
}
