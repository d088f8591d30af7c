//! In-memory backend.
//!
//! Keeps a CPU copy of every buffer and a log of every call. Used for
//! headless servers and tools that run the allocator without a GPU, and for
//! asserting exactly which backend work a commit performed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Backend, BufferData, BufferHandle, IndexFormat, LayoutHandle, Topology, VertexBinding};
use crate::layout::InputElement;

/// What a recorded buffer was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Vertex group storage.
    Vertex,
    /// Index group storage.
    Index,
    /// Shared instancing storage.
    Instancing,
}

/// A live buffer as seen by the recording backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBuffer {
    /// Label passed at creation.
    pub label: String,
    /// Usage.
    pub usage: BufferUsage,
    /// Whether it was created writable.
    pub dynamic: bool,
    /// Size of one item in bytes.
    pub stride: u32,
    /// Capacity in items.
    pub capacity: usize,
    /// Current content.
    pub bytes: Vec<u8>,
}

/// One call received by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// `create_vertex_buffer`.
    CreateVertexBuffer {
        /// Label.
        label: String,
        /// Items in the payload.
        items: usize,
        /// Writable.
        dynamic: bool,
    },
    /// `create_index_buffer`.
    CreateIndexBuffer {
        /// Label.
        label: String,
        /// Items in the payload.
        items: usize,
        /// Writable.
        dynamic: bool,
    },
    /// `create_instancing_buffer`.
    CreateInstancingBuffer {
        /// Label.
        label: String,
        /// Capacity in records.
        capacity: usize,
    },
    /// `destroy_buffer`.
    DestroyBuffer(BufferHandle),
    /// `write_discard`.
    WriteDiscard {
        /// Target.
        handle: BufferHandle,
        /// Items written.
        items: usize,
    },
    /// `write_no_overwrite`.
    WriteNoOverwrite {
        /// Target.
        handle: BufferHandle,
        /// First item written.
        first_item: usize,
        /// Items written.
        items: usize,
    },
    /// `bind_vertex_buffers`.
    BindVertexBuffers {
        /// First slot.
        first_slot: u32,
        /// Bindings, in slot order.
        bindings: Vec<VertexBinding>,
    },
    /// `bind_index_buffer`.
    BindIndexBuffer {
        /// Buffer bound.
        handle: Option<BufferHandle>,
        /// Index format.
        format: IndexFormat,
    },
    /// `create_or_get_input_layout`.
    CreateInputLayout {
        /// Technique key.
        technique: String,
        /// Elements supplied.
        elements: Vec<InputElement>,
    },
    /// `set_input_layout`.
    SetInputLayout {
        /// Layout made current.
        layout: LayoutHandle,
        /// Topology.
        topology: Topology,
    },
}

#[derive(Default)]
struct Recording {
    next_buffer: u64,
    buffers: HashMap<BufferHandle, RecordedBuffer>,
    layouts: HashMap<(String, Vec<InputElement>), LayoutHandle>,
    calls: Vec<BackendCall>,
}

impl Recording {
    fn insert(&mut self, buffer: RecordedBuffer) -> BufferHandle {
        self.next_buffer += 1;
        let handle = BufferHandle::new(self.next_buffer);
        self.buffers.insert(handle, buffer);
        handle
    }
}

/// Backend that records calls instead of talking to a GPU.
///
/// Clones share the same recording, so a test can keep one clone while the
/// manager owns the other.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingBackend {
    /// Creates an empty recording backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.lock().calls.clone()
    }

    /// Number of calls received so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Forgets the call log (buffers are kept).
    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// Looks up a live buffer.
    #[must_use]
    pub fn buffer(&self, handle: BufferHandle) -> Option<RecordedBuffer> {
        self.inner.lock().buffers.get(&handle).cloned()
    }

    /// All live buffers of a given usage, ordered by handle.
    #[must_use]
    pub fn live_buffers(&self, usage: BufferUsage) -> Vec<(BufferHandle, RecordedBuffer)> {
        let recording = self.inner.lock();
        let mut buffers: Vec<_> = recording
            .buffers
            .iter()
            .filter(|(_, b)| b.usage == usage)
            .map(|(h, b)| (*h, b.clone()))
            .collect();
        buffers.sort_by_key(|(h, _)| *h);
        buffers
    }

    /// Total number of live buffers.
    #[must_use]
    pub fn live_buffer_count(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    fn create(&mut self, label: &str, data: BufferData<'_>, dynamic: bool, usage: BufferUsage) -> Option<BufferHandle> {
        let mut recording = self.inner.lock();
        let items = data.item_count();
        recording.calls.push(match usage {
            BufferUsage::Index => BackendCall::CreateIndexBuffer { label: label.to_owned(), items, dynamic },
            _ => BackendCall::CreateVertexBuffer { label: label.to_owned(), items, dynamic },
        });
        if data.is_empty() {
            return None;
        }
        Some(recording.insert(RecordedBuffer {
            label: label.to_owned(),
            usage,
            dynamic,
            stride: data.stride,
            capacity: items,
            bytes: data.bytes.to_vec(),
        }))
    }
}

impl Backend for RecordingBackend {
    fn create_vertex_buffer(&mut self, label: &str, data: BufferData<'_>, dynamic: bool) -> Option<BufferHandle> {
        self.create(label, data, dynamic, BufferUsage::Vertex)
    }

    fn create_index_buffer(&mut self, label: &str, data: BufferData<'_>, dynamic: bool) -> Option<BufferHandle> {
        self.create(label, data, dynamic, BufferUsage::Index)
    }

    fn create_instancing_buffer(&mut self, label: &str, capacity: usize, stride: u32) -> Option<BufferHandle> {
        let mut recording = self.inner.lock();
        recording.calls.push(BackendCall::CreateInstancingBuffer { label: label.to_owned(), capacity });
        let size = capacity.checked_mul(stride as usize).filter(|size| *size > 0)?;
        Some(recording.insert(RecordedBuffer {
            label: label.to_owned(),
            usage: BufferUsage::Instancing,
            dynamic: true,
            stride,
            capacity,
            bytes: vec![0; size],
        }))
    }

    fn destroy_buffer(&mut self, handle: BufferHandle) {
        let mut recording = self.inner.lock();
        recording.calls.push(BackendCall::DestroyBuffer(handle));
        recording.buffers.remove(&handle);
    }

    fn write_discard(&mut self, handle: BufferHandle, data: BufferData<'_>) {
        let mut recording = self.inner.lock();
        recording.calls.push(BackendCall::WriteDiscard { handle, items: data.item_count() });
        if let Some(buffer) = recording.buffers.get_mut(&handle) {
            let len = data.bytes.len().min(buffer.bytes.len());
            buffer.bytes[..len].copy_from_slice(&data.bytes[..len]);
            buffer.bytes[len..].fill(0);
        }
    }

    fn write_no_overwrite(&mut self, handle: BufferHandle, first_item: usize, data: BufferData<'_>) {
        let mut recording = self.inner.lock();
        recording.calls.push(BackendCall::WriteNoOverwrite { handle, first_item, items: data.item_count() });
        if let Some(buffer) = recording.buffers.get_mut(&handle) {
            let range = first_item
                .checked_mul(data.stride as usize)
                .and_then(|start| Some(start..start.checked_add(data.bytes.len())?));
            if let Some(target) = range.and_then(|range| buffer.bytes.get_mut(range)) {
                target.copy_from_slice(data.bytes);
            }
        }
    }

    fn bind_vertex_buffers(&mut self, first_slot: u32, bindings: &[VertexBinding]) {
        self.inner
            .lock()
            .calls
            .push(BackendCall::BindVertexBuffers { first_slot, bindings: bindings.to_vec() });
    }

    fn bind_index_buffer(&mut self, handle: Option<BufferHandle>, format: IndexFormat, _offset: u64) {
        self.inner.lock().calls.push(BackendCall::BindIndexBuffer { handle, format });
    }

    fn create_or_get_input_layout(&mut self, technique: &str, elements: &[InputElement]) -> Option<LayoutHandle> {
        let mut recording = self.inner.lock();
        recording.calls.push(BackendCall::CreateInputLayout {
            technique: technique.to_owned(),
            elements: elements.to_vec(),
        });
        if elements.is_empty() {
            return None;
        }
        let next = LayoutHandle::new(u32::try_from(recording.layouts.len()).unwrap_or(u32::MAX));
        Some(*recording.layouts.entry((technique.to_owned(), elements.to_vec())).or_insert(next))
    }

    fn set_input_layout(&mut self, layout: LayoutHandle, topology: Topology) {
        self.inner.lock().calls.push(BackendCall::SetInputLayout { layout, topology });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_creates_nothing() {
        let mut backend = RecordingBackend::new();
        assert!(backend.create_vertex_buffer("v", BufferData::new(&[], 12), false).is_none());
        assert!(backend.create_instancing_buffer("i", 0, 80).is_none());
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn test_writes_land_in_place() {
        let mut backend = RecordingBackend::new();
        let handle = backend.create_index_buffer("i", BufferData::new(&[0u8; 16], 4), true).unwrap();

        backend.write_no_overwrite(handle, 2, BufferData::new(&[1, 1, 1, 1], 4));
        let buffer = backend.buffer(handle).unwrap();
        assert_eq!(&buffer.bytes[8..12], &[1, 1, 1, 1]);
        assert_eq!(&buffer.bytes[..8], &[0; 8]);

        backend.destroy_buffer(handle);
        assert!(backend.buffer(handle).is_none());
    }

    #[test]
    fn test_layouts_keyed_by_technique_and_elements() {
        let mut backend = RecordingBackend::new();
        let slot0 = crate::layout::VertexLayout::Position.input_elements(0);
        let slot2 = crate::layout::VertexLayout::Position.input_elements(2);

        let a = backend.create_or_get_input_layout("lit", &slot0).unwrap();
        assert_eq!(backend.create_or_get_input_layout("lit", &slot0), Some(a));
        assert_ne!(backend.create_or_get_input_layout("lit", &slot2), Some(a));
        assert_ne!(backend.create_or_get_input_layout("unlit", &slot0), Some(a));
        assert!(backend.create_or_get_input_layout("lit", &[]).is_none());
    }

    #[test]
    fn test_clones_share_log() {
        let mut backend = RecordingBackend::new();
        let observer = backend.clone();
        backend.bind_index_buffer(None, IndexFormat::Uint32, 0);
        assert_eq!(observer.calls(), vec![BackendCall::BindIndexBuffer { handle: None, format: IndexFormat::Uint32 }]);
    }
}
