//! # Backend Capability
//!
//! The graphics device the manager drives. The manager decides *when* and
//! *how many items*; the backend owns bytes, memory and the actual API calls.
//!
//! ```text
//! BufferManager ──create/destroy/write──► Backend ──► GPU
//!       │                                    ▲
//!       └──────────bind/layout───────────────┘
//! ```
//!
//! Two implementations ship with the crate:
//! - [`WgpuBackend`] for real rendering
//! - [`RecordingBackend`] for headless runs and tests

pub mod recording;
pub mod wgpu_backend;

pub use recording::{BackendCall, BufferUsage, RecordedBuffer, RecordingBackend};
pub use wgpu_backend::WgpuBackend;

use crate::layout::InputElement;

/// Opaque handle to a physical buffer, issued by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(u64);

impl BufferHandle {
    /// Wraps a backend-specific id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the backend-specific id.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Opaque handle to an input layout, issued by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutHandle(u32);

impl LayoutHandle {
    /// Wraps a backend-specific id.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the backend-specific id.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Item payload handed to a backend: raw bytes plus the size of one item.
#[derive(Debug, Clone, Copy)]
pub struct BufferData<'a> {
    /// Tightly packed item bytes.
    pub bytes: &'a [u8],
    /// Size of one item in bytes.
    pub stride: u32,
}

impl<'a> BufferData<'a> {
    /// Creates a payload.
    #[must_use]
    pub const fn new(bytes: &'a [u8], stride: u32) -> Self {
        Self { bytes, stride }
    }

    /// Number of whole items in the payload.
    #[must_use]
    pub fn item_count(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.bytes.len() / self.stride as usize
        }
    }

    /// Returns true if there is nothing to upload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One vertex buffer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexBinding {
    /// Buffer to bind (`None` leaves the slot unbound).
    pub buffer: Option<BufferHandle>,
    /// Size of one item in bytes.
    pub stride: u32,
    /// Byte offset of the first item.
    pub offset: u64,
}

/// Index element format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    /// 16-bit indices.
    Uint16,
    /// 32-bit indices.
    Uint32,
}

/// Primitive topology used with an input layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Topology {
    /// Independent points.
    PointList,
    /// Independent lines.
    LineList,
    /// Connected lines.
    LineStrip,
    /// Independent triangles.
    #[default]
    TriangleList,
    /// Connected triangles.
    TriangleStrip,
}

/// Buffer creation, update and binding, as consumed by the manager.
///
/// Creation returns `None` for empty payloads. The manager is the only
/// caller of `destroy_buffer` and never passes the same handle twice.
pub trait Backend: Send {
    /// Creates a vertex buffer holding `data`.
    fn create_vertex_buffer(&mut self, label: &str, data: BufferData<'_>, dynamic: bool) -> Option<BufferHandle>;

    /// Creates an index buffer holding `data`.
    fn create_index_buffer(&mut self, label: &str, data: BufferData<'_>, dynamic: bool) -> Option<BufferHandle>;

    /// Creates a writable instancing buffer of `capacity` records of `stride` bytes.
    fn create_instancing_buffer(&mut self, label: &str, capacity: usize, stride: u32) -> Option<BufferHandle>;

    /// Destroys a buffer.
    fn destroy_buffer(&mut self, handle: BufferHandle);

    /// Replaces the whole content of a buffer.
    fn write_discard(&mut self, handle: BufferHandle, data: BufferData<'_>);

    /// Writes `data` starting at item `first_item`, leaving other items intact.
    fn write_no_overwrite(&mut self, handle: BufferHandle, first_item: usize, data: BufferData<'_>);

    /// Binds consecutive vertex buffer slots starting at `first_slot`.
    fn bind_vertex_buffers(&mut self, first_slot: u32, bindings: &[VertexBinding]);

    /// Binds the index buffer.
    fn bind_index_buffer(&mut self, handle: Option<BufferHandle>, format: IndexFormat, offset: u64);

    /// Creates the input layout for `technique`, or returns the existing one.
    fn create_or_get_input_layout(&mut self, technique: &str, elements: &[InputElement]) -> Option<LayoutHandle>;

    /// Makes `layout` current with the given topology.
    fn set_input_layout(&mut self, layout: LayoutHandle, topology: Topology);
}
