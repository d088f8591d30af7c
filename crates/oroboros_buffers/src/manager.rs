//! # Buffer Manager
//!
//! Owns every group, every physical buffer and the request queue.
//!
//! ## Threading
//!
//! ```text
//! producer threads ──add/remove──► [MPSC queue] ──drain──► commit (one thread)
//!                                                            │
//!                                        apply FIFO ─► reallocate dirty groups
//!                                                            │
//!                                        rebuild instancing ◄┘ (if any vertex group moved)
//! ```
//!
//! `add_*`/`remove_*` only send on the channel and never block on commit.
//! `commit` is not reentrant: a call that overlaps another is dropped and
//! returns `None`.
//!
//! ## State machine
//!
//! `Uninitialized ──first commit──► Initializing ──► Steady`
//!
//! The first commit allocates every group in full. Later commits only touch
//! groups that are dirty.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{Backend, IndexFormat, LayoutHandle, Topology, VertexBinding};
use crate::config::BufferManagerConfig;
use crate::descriptor::{DataKind, Descriptor};
use crate::error::{BufferError, BufferResult};
use crate::group::{GroupTable, IndexGroup, IndexKey, IndexStream, ItemStream, SubAllocationGroup, VertexGroup, VertexKey};
use crate::instancing::{record_data, InstanceRecord, InstancingBuffer};
use crate::layout::VertexStream;
use crate::request::{IndexRequest, Mutation, Request, VertexRequest};
use crate::stats::{CommitStats, GroupInfo};

/// Lifecycle of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No commit has run yet.
    Uninitialized,
    /// The first commit is allocating every group.
    Initializing,
    /// Groups are reallocated incrementally.
    Steady,
}

struct ManagerState<B> {
    backend: B,
    phase: Phase,
    groups: GroupTable,
    instancing: InstancingBuffer,
    /// Input layouts per (technique, vertex group slot).
    layouts: HashMap<(String, usize), LayoutHandle>,
}

/// Packs producer-owned chunks of render data into shared device buffers.
///
/// `BufferManager` is `Sync` when `B` is `Send`; share it behind an `Arc`
/// to let worker threads enqueue mutations.
pub struct BufferManager<B: Backend> {
    config: BufferManagerConfig,
    requests: Sender<Request>,
    pending: Receiver<Request>,
    in_progress: AtomicBool,
    state: Mutex<ManagerState<B>>,
}

/// Clears the commit flag when a commit ends.
struct CommitGuard<'a>(&'a AtomicBool);

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<B: Backend> BufferManager<B> {
    /// Creates a manager over `backend`, reserving the groups listed in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfig`] if `config` does not validate.
    pub fn new(backend: B, config: BufferManagerConfig) -> BufferResult<Self> {
        config.validate()?;
        Ok(Self::build(backend, config))
    }

    /// Creates a manager with the default configuration.
    pub fn with_defaults(backend: B) -> Self {
        Self::build(backend, BufferManagerConfig::default())
    }

    fn build(backend: B, config: BufferManagerConfig) -> Self {
        let mut groups = GroupTable::default();
        for reserved in &config.reserved_vertex_groups {
            groups.vertex_slot(VertexKey { layout: reserved.layout, dynamic: reserved.dynamic });
        }
        if config.reserve_index_groups {
            groups.index_slot(IndexKey { dynamic: false });
            groups.index_slot(IndexKey { dynamic: true });
        }

        let (requests, pending) = unbounded();
        Self {
            config,
            requests,
            pending,
            in_progress: AtomicBool::new(false),
            state: Mutex::new(ManagerState {
                backend,
                phase: Phase::Uninitialized,
                groups,
                instancing: InstancingBuffer::default(),
                layouts: HashMap::new(),
            }),
        }
    }

    // =========================================================================
    // ENQUEUE
    // =========================================================================

    /// Queues vertex data. The descriptor is bound at the next commit.
    ///
    /// `instances` is the per-draw instance demand this chunk adds to the
    /// shared instancing buffer.
    pub fn add_vertex_data(
        &self,
        id: impl Into<String>,
        items: impl Into<VertexStream>,
        dynamic: bool,
        instances: usize,
    ) -> Descriptor {
        let descriptor = Descriptor::new(id.into(), DataKind::Vertex);
        let request = VertexRequest::add(descriptor.clone(), items.into(), dynamic, instances);
        self.enqueue(Request::Vertex(request));
        descriptor
    }

    /// Queues index data. The descriptor is bound at the next commit.
    pub fn add_index_data(&self, id: impl Into<String>, indices: impl Into<IndexStream>, dynamic: bool) -> Descriptor {
        let descriptor = Descriptor::new(id.into(), DataKind::Index);
        let request = IndexRequest::add(descriptor.clone(), indices.into(), dynamic);
        self.enqueue(Request::Index(request));
        descriptor
    }

    /// Queues removal of vertex data, releasing `instances` of demand.
    pub fn remove_vertex_data(&self, descriptor: &Descriptor, instances: usize) {
        self.enqueue(Request::Vertex(VertexRequest::remove(descriptor.clone(), instances)));
    }

    /// Queues removal of index data.
    pub fn remove_index_data(&self, descriptor: &Descriptor) {
        self.enqueue(Request::Index(IndexRequest::remove(descriptor.clone())));
    }

    fn enqueue(&self, request: Request) {
        // The receiver lives as long as `self`, so sending cannot fail.
        let _ = self.requests.send(request);
    }

    // =========================================================================
    // COMMIT
    // =========================================================================

    /// Applies queued requests and reallocates what they made dirty.
    ///
    /// Returns `None` if another commit is already running.
    pub fn commit(&self) -> Option<CommitStats> {
        if self.in_progress.swap(true, Ordering::Acquire) {
            debug!("commit already in progress, dropping call");
            return None;
        }
        let _commit = CommitGuard(&self.in_progress);

        let mut guard = self.state.lock();
        let state: &mut ManagerState<B> = &mut guard;
        let mut stats = CommitStats::default();

        for mut request in self.pending.try_iter() {
            if let Err(err) = request.apply(&mut state.groups) {
                warn!("request rejected: {}", err);
                stats.errors.push(err);
            }
            debug_assert!(request.is_processed());
            stats.requests_applied += 1;
        }

        let prefix = self.config.label_prefix.as_str();
        if state.phase == Phase::Uninitialized {
            state.phase = Phase::Initializing;
            state.allocate_all(prefix, &mut stats);
            state.phase = Phase::Steady;
            info!(
                "buffer manager initialized: {} vertex groups, {} index groups, {} instances",
                state.groups.vertex.len(),
                state.groups.index.len(),
                state.instancing.capacity()
            );
        } else {
            state.reallocate_dirty(prefix, &mut stats);
        }

        state.groups.clear_category_flags();
        stats.instancing_capacity = state.instancing.capacity();

        if !stats.is_noop() {
            debug!(
                "commit: {} requests, {} vertex / {} index groups reallocated, instancing {}",
                stats.requests_applied,
                stats.vertex_groups_reallocated,
                stats.index_groups_reallocated,
                stats.instancing_capacity
            );
        }
        Some(stats)
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    /// Returns true if a commit has work to do.
    pub fn is_dirty(&self) -> bool {
        if !self.pending.is_empty() {
            return true;
        }
        let state = self.state.lock();
        state.phase != Phase::Steady || state.groups.vertex_pass_needed() || state.groups.index_pass_needed()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Requests enqueued since the last commit.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &BufferManagerConfig {
        &self.config
    }

    /// Capacity of the shared instancing buffer, in records.
    pub fn instancing_capacity(&self) -> usize {
        self.state.lock().instancing.capacity()
    }

    /// Snapshots of every vertex group in slot order.
    pub fn vertex_groups(&self) -> Vec<GroupInfo> {
        let state = self.state.lock();
        state
            .groups
            .vertex
            .iter()
            .enumerate()
            .map(|(slot, g)| group_info(slot, g, Some(g.layout()), g.key().dynamic))
            .collect()
    }

    /// Snapshots of every index group in slot order.
    pub fn index_groups(&self) -> Vec<GroupInfo> {
        let state = self.state.lock();
        state
            .groups
            .index
            .iter()
            .enumerate()
            .map(|(slot, g)| group_info(slot, g, None, g.key().dynamic))
            .collect()
    }

    /// Runs `f` with shared access to the backend.
    pub fn with_backend<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.state.lock().backend)
    }

    // =========================================================================
    // BINDING
    // =========================================================================

    /// Binds every vertex group (geometry at `2s`, instancing at `2s + 1`).
    ///
    /// # Errors
    ///
    /// Fails before the first commit or while any group is dirty.
    pub fn try_bind_vertex_groups(&self) -> BufferResult<()> {
        let mut guard = self.state.lock();
        let state: &mut ManagerState<B> = &mut guard;
        state.ensure_steady()?;
        state.ensure_clean()?;

        if state.groups.vertex.is_empty() {
            return Ok(());
        }
        let bindings: Vec<VertexBinding> = state
            .groups
            .vertex
            .iter()
            .flat_map(|g| [g.geometry_binding(), g.instancing_binding()])
            .collect();
        state.backend.bind_vertex_buffers(0, &bindings);
        Ok(())
    }

    /// Boolean form of [`try_bind_vertex_groups`](Self::try_bind_vertex_groups).
    pub fn bind_vertex_groups(&self) -> bool {
        report("bind_vertex_groups", self.try_bind_vertex_groups())
    }

    /// Binds the index group at `slot`.
    ///
    /// # Errors
    ///
    /// Fails before the first commit, for unknown or dirty slots, and for
    /// groups without a physical buffer.
    pub fn try_bind_index_group(&self, slot: usize) -> BufferResult<()> {
        let mut guard = self.state.lock();
        let state: &mut ManagerState<B> = &mut guard;
        state.ensure_steady()?;
        let group = clean_group(&state.groups.index, DataKind::Index, slot)?;
        let handle = group.buffer().ok_or(BufferError::NoPhysicalBuffer { kind: DataKind::Index, slot })?;
        state.backend.bind_index_buffer(Some(handle), IndexFormat::Uint32, 0);
        Ok(())
    }

    /// Boolean form of [`try_bind_index_group`](Self::try_bind_index_group).
    pub fn bind_index_group(&self, slot: usize) -> bool {
        report("bind_index_group", self.try_bind_index_group(slot))
    }

    /// Makes the input layout of vertex group `slot` current for `technique`.
    ///
    /// Layouts are created once per (technique, slot) and cached for the
    /// life of the manager. A slot's vertex layout never changes, so cached
    /// entries cannot go stale.
    ///
    /// # Errors
    ///
    /// Fails before the first commit, for unknown or dirty slots, and if the
    /// backend cannot build the layout.
    pub fn try_set_input_layout(&self, technique: &str, slot: usize, topology: Topology) -> BufferResult<()> {
        let mut guard = self.state.lock();
        let state: &mut ManagerState<B> = &mut guard;
        state.ensure_steady()?;
        let layout = clean_group(&state.groups.vertex, DataKind::Vertex, slot)?.layout();

        let key = (technique.to_owned(), slot);
        let handle = match state.layouts.get(&key) {
            Some(handle) => *handle,
            None => {
                let (geometry, instancing) = input_slots(slot);
                let mut elements = layout.input_elements(geometry);
                elements.extend(InstanceRecord::input_elements(instancing));
                let handle = state
                    .backend
                    .create_or_get_input_layout(technique, &elements)
                    .ok_or_else(|| BufferError::InputLayoutUnavailable(technique.to_owned()))?;
                debug!("created input layout for {} on vertex group {} ({})", technique, slot, layout);
                state.layouts.insert(key, handle);
                handle
            }
        };
        state.backend.set_input_layout(handle, topology);
        Ok(())
    }

    /// Boolean form of [`try_set_input_layout`](Self::try_set_input_layout).
    pub fn set_input_layout(&self, technique: &str, slot: usize, topology: Topology) -> bool {
        report("set_input_layout", self.try_set_input_layout(technique, slot, topology))
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Replaces the content of the shared instancing buffer.
    ///
    /// # Errors
    ///
    /// Fails before the first commit, when no instancing buffer exists, and
    /// when `records` exceed its capacity.
    pub fn try_write_instancing_data(&self, records: &[InstanceRecord]) -> BufferResult<()> {
        let mut guard = self.state.lock();
        let state: &mut ManagerState<B> = &mut guard;
        state.ensure_steady()?;
        let handle = state.instancing.handle().ok_or(BufferError::NoInstancingBuffer)?;
        let capacity = state.instancing.capacity();
        if records.len() > capacity {
            return Err(BufferError::InstancingOverflow { capacity, requested: records.len() });
        }
        state.backend.write_discard(handle, record_data(records));
        Ok(())
    }

    /// Boolean form of [`try_write_instancing_data`](Self::try_write_instancing_data).
    pub fn write_instancing_data(&self, records: &[InstanceRecord]) -> bool {
        report("write_instancing_data", self.try_write_instancing_data(records))
    }

    /// Overwrites allocated vertices of group `slot` starting at item `offset`.
    ///
    /// The group's own copy is updated too, so later reallocations keep the
    /// written data.
    ///
    /// # Errors
    ///
    /// Fails before the first commit, for unknown or dirty slots, on layout
    /// mismatch, when the range reaches past the allocation, and for groups
    /// without a physical buffer.
    pub fn try_write_vertex_range(&self, slot: usize, offset: usize, data: impl Into<VertexStream>) -> BufferResult<()> {
        let data = data.into();
        let mut guard = self.state.lock();
        let state: &mut ManagerState<B> = &mut guard;
        state.ensure_steady()?;
        clean_group(&state.groups.vertex, DataKind::Vertex, slot)?;

        let group = &mut state.groups.vertex[slot];
        if group.layout() != data.layout() {
            return Err(BufferError::LayoutMismatch { expected: group.layout(), found: data.layout() });
        }
        let handle = group.buffer().ok_or(BufferError::NoPhysicalBuffer { kind: DataKind::Vertex, slot })?;
        group.overwrite(offset, &data)?;
        state.backend.write_no_overwrite(handle, offset, data.data());
        Ok(())
    }

    /// Boolean form of [`try_write_vertex_range`](Self::try_write_vertex_range).
    pub fn write_vertex_range(&self, slot: usize, offset: usize, data: impl Into<VertexStream>) -> bool {
        report("write_vertex_range", self.try_write_vertex_range(slot, offset, data))
    }

    /// Overwrites allocated indices of group `slot` starting at item `offset`.
    ///
    /// # Errors
    ///
    /// As [`try_write_vertex_range`](Self::try_write_vertex_range), minus
    /// layout checks.
    pub fn try_write_index_range(&self, slot: usize, offset: usize, indices: &[u32]) -> BufferResult<()> {
        let data = IndexStream(indices.to_vec());
        let mut guard = self.state.lock();
        let state: &mut ManagerState<B> = &mut guard;
        state.ensure_steady()?;
        clean_group(&state.groups.index, DataKind::Index, slot)?;

        let group = &mut state.groups.index[slot];
        let handle = group.buffer().ok_or(BufferError::NoPhysicalBuffer { kind: DataKind::Index, slot })?;
        group.overwrite(offset, &data)?;
        state.backend.write_no_overwrite(handle, offset, data.data());
        Ok(())
    }

    /// Boolean form of [`try_write_index_range`](Self::try_write_index_range).
    pub fn write_index_range(&self, slot: usize, offset: usize, indices: &[u32]) -> bool {
        report("write_index_range", self.try_write_index_range(slot, offset, indices))
    }
}

impl<B: Backend> Drop for BufferManager<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut released = 0;
        for group in &mut state.groups.vertex {
            if let Some(handle) = group.take_buffer() {
                state.backend.destroy_buffer(handle);
                released += 1;
            }
        }
        for group in &mut state.groups.index {
            if let Some(handle) = group.take_buffer() {
                state.backend.destroy_buffer(handle);
                released += 1;
            }
        }
        if let Some(handle) = state.instancing.take() {
            state.backend.destroy_buffer(handle);
            released += 1;
        }
        debug!("buffer manager dropped, released {} buffers", released);
    }
}

// =============================================================================
// ALLOCATION
// =============================================================================

impl<B: Backend> ManagerState<B> {
    fn ensure_steady(&self) -> BufferResult<()> {
        if self.phase == Phase::Steady {
            Ok(())
        } else {
            Err(BufferError::NotInitialized)
        }
    }

    fn ensure_clean(&self) -> BufferResult<()> {
        if let Some(slot) = self.groups.vertex.iter().position(VertexGroup::is_dirty) {
            return Err(BufferError::GroupDirty { kind: DataKind::Vertex, slot });
        }
        if let Some(slot) = self.groups.index.iter().position(IndexGroup::is_dirty) {
            return Err(BufferError::GroupDirty { kind: DataKind::Index, slot });
        }
        Ok(())
    }

    /// First commit: every group in full, then instancing.
    fn allocate_all(&mut self, prefix: &str, stats: &mut CommitStats) {
        for slot in 0..self.groups.vertex.len() {
            self.reallocate_vertex(prefix, slot);
        }
        for slot in 0..self.groups.index.len() {
            self.reallocate_index(prefix, slot);
        }
        stats.initialized = true;
        stats.vertex_groups_reallocated = self.groups.vertex.len();
        stats.index_groups_reallocated = self.groups.index.len();

        let demand = self.groups.total_instances();
        if demand > 0 {
            self.rebuild_instancing(prefix, demand);
            stats.instancing_reallocated = true;
        }
        self.refresh_instancing_bindings();
    }

    /// Later commits: dirty groups only, in the categories flagged while
    /// applying requests.
    fn reallocate_dirty(&mut self, prefix: &str, stats: &mut CommitStats) {
        if self.groups.vertex_pass_needed() {
            for slot in 0..self.groups.vertex.len() {
                if self.groups.vertex[slot].is_dirty() {
                    self.reallocate_vertex(prefix, slot);
                    stats.vertex_groups_reallocated += 1;
                }
            }
        }

        if stats.vertex_groups_reallocated > 0 {
            let demand = self.groups.total_instances();
            self.rebuild_instancing(prefix, demand);
            self.refresh_instancing_bindings();
            stats.instancing_reallocated = true;
        }

        if self.groups.index_pass_needed() {
            for slot in 0..self.groups.index.len() {
                if self.groups.index[slot].is_dirty() {
                    self.reallocate_index(prefix, slot);
                    stats.index_groups_reallocated += 1;
                }
            }
        }
    }

    fn reallocate_vertex(&mut self, prefix: &str, slot: usize) {
        let group = &mut self.groups.vertex[slot];
        if let Some(old) = group.take_buffer() {
            self.backend.destroy_buffer(old);
        }
        let key = group.key();
        let label = format!("{prefix}:vertex:{slot}:{}:{}", key.layout, mutability(key.dynamic));
        let buffer = self.backend.create_vertex_buffer(&label, group.items().data(), key.dynamic);
        group.mark_allocated(buffer);
        debug!("allocated {} ({} items)", label, group.allocated_size());
    }

    fn reallocate_index(&mut self, prefix: &str, slot: usize) {
        let group = &mut self.groups.index[slot];
        if let Some(old) = group.take_buffer() {
            self.backend.destroy_buffer(old);
        }
        let key = group.key();
        let label = format!("{prefix}:index:{slot}:{}", mutability(key.dynamic));
        let buffer = self.backend.create_index_buffer(&label, group.items().data(), key.dynamic);
        group.mark_allocated(buffer);
        debug!("allocated {} ({} items)", label, group.allocated_size());
    }

    fn rebuild_instancing(&mut self, prefix: &str, demand: usize) {
        if let Some(old) = self.instancing.take() {
            self.backend.destroy_buffer(old);
        }
        let handle = if demand > 0 {
            let label = format!("{prefix}:instancing");
            self.backend.create_instancing_buffer(&label, demand, InstanceRecord::stride())
        } else {
            None
        };
        self.instancing.replace(handle, demand);
        debug!("instancing buffer sized to {} records", self.instancing.capacity());
    }

    fn refresh_instancing_bindings(&mut self) {
        let binding = self.instancing.binding();
        for group in &mut self.groups.vertex {
            group.set_instancing_binding(binding);
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn clean_group<S: ItemStream, K: Copy>(
    groups: &[SubAllocationGroup<S, K>],
    kind: DataKind,
    slot: usize,
) -> BufferResult<&SubAllocationGroup<S, K>> {
    let group = groups.get(slot).ok_or(BufferError::NoSuchGroup { kind, slot })?;
    if group.is_dirty() {
        return Err(BufferError::GroupDirty { kind, slot });
    }
    Ok(group)
}

fn group_info<S: ItemStream, K: Copy>(
    slot: usize,
    group: &SubAllocationGroup<S, K>,
    layout: Option<crate::layout::VertexLayout>,
    dynamic: bool,
) -> GroupInfo {
    GroupInfo {
        slot,
        layout,
        dynamic,
        allocated: group.is_allocated(),
        allocated_size: group.allocated_size(),
        to_allocate_size: group.to_allocate_size(),
        instances: group.instances(),
        descriptors: group.descriptors().len(),
        dirty: group.is_dirty(),
        contiguous: group.is_contiguous(),
    }
}

/// Input slots of vertex group `slot`: geometry, then instancing.
fn input_slots(slot: usize) -> (u32, u32) {
    let geometry = u32::try_from(slot * 2).unwrap_or(u32::MAX - 1);
    (geometry, geometry + 1)
}

const fn mutability(dynamic: bool) -> &'static str {
    if dynamic {
        "dynamic"
    } else {
        "static"
    }
}

fn report(operation: &str, result: BufferResult<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!("{} failed: {}", operation, err);
            false
        }
    }
}
