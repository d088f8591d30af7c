//! wgpu implementation of [`Backend`].
//!
//! wgpu has no immediate-mode binding, so binds are recorded and replayed
//! onto a render pass:
//!
//! ```ignore
//! manager.bind_vertex_groups();
//! manager.set_input_layout("lit", group, Topology::TriangleList);
//! let bound = manager.with_backend(WgpuBackend::bound);
//! let mut pass = encoder.begin_render_pass(&desc);
//! bound.apply(&mut pass);
//! ```
//!
//! Input layouts become `wgpu::VertexBufferLayout`s for pipeline creation,
//! one per input slot, with shader locations assigned in element order.
//! A layout is rebased so its lowest input slot is pass slot 0, and a
//! snapshot only carries the bindings the current layout reads. A pass
//! therefore never uses more slots than one layout spans, and layouts
//! spanning more than `max_vertex_buffers` slots are refused.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;
use wgpu::util::DeviceExt;

use super::{Backend, BufferData, BufferHandle, IndexFormat, LayoutHandle, Topology, VertexBinding};
use crate::layout::{ElementFormat, InputElement, StepRate};

/// Attributes read from one input slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotLayout {
    /// Bytes between consecutive items.
    pub array_stride: wgpu::BufferAddress,
    /// Per vertex or per instance.
    pub step_mode: wgpu::VertexStepMode,
    /// Attributes of the slot.
    pub attributes: Vec<wgpu::VertexAttribute>,
}

/// A created input layout.
#[derive(Debug, Clone)]
pub struct InputLayout {
    /// Technique it was created for.
    pub technique: String,
    /// Bound input slot that becomes pass slot 0.
    pub first_slot: u32,
    /// One entry per pass slot, `None` for unused slots.
    pub slots: Vec<Option<SlotLayout>>,
}

impl InputLayout {
    /// Buffer layouts for `wgpu::VertexState::buffers`.
    ///
    /// Unused slots get an empty layout so slot numbers line up.
    #[must_use]
    pub fn buffer_layouts(&self) -> Vec<wgpu::VertexBufferLayout<'_>> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Some(slot) => wgpu::VertexBufferLayout {
                    array_stride: slot.array_stride,
                    step_mode: slot.step_mode,
                    attributes: &slot.attributes,
                },
                None => wgpu::VertexBufferLayout {
                    array_stride: 0,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &[],
                },
            })
            .collect()
    }
}

/// Buffers bound at the time of the snapshot, ready for a render pass.
#[derive(Debug, Default)]
pub struct BoundBuffers {
    vertex: Vec<(u32, Arc<wgpu::Buffer>, wgpu::BufferAddress)>,
    index: Option<(Arc<wgpu::Buffer>, wgpu::IndexFormat, wgpu::BufferAddress)>,
}

impl BoundBuffers {
    /// Sets the snapshot's vertex and index buffers on `pass`.
    pub fn apply<'a>(&'a self, pass: &mut wgpu::RenderPass<'a>) {
        for (slot, buffer, offset) in &self.vertex {
            pass.set_vertex_buffer(*slot, buffer.slice(*offset..));
        }
        if let Some((buffer, format, offset)) = &self.index {
            pass.set_index_buffer(buffer.slice(*offset..), *format);
        }
    }

    /// Number of bound vertex slots.
    #[must_use]
    pub fn vertex_slots(&self) -> usize {
        self.vertex.len()
    }
}

/// Backend that drives a wgpu device.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    max_vertex_buffers: u32,
    next_buffer: u64,
    buffers: HashMap<BufferHandle, Arc<wgpu::Buffer>>,
    layouts: Vec<InputLayout>,
    layout_keys: HashMap<(String, Vec<InputElement>), LayoutHandle>,
    vertex_bindings: Vec<VertexBinding>,
    index_binding: Option<(BufferHandle, IndexFormat, u64)>,
    current_layout: Option<(LayoutHandle, Topology)>,
}

impl WgpuBackend {
    /// Creates a backend on an existing device and queue.
    #[must_use]
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let max_vertex_buffers = device.limits().max_vertex_buffers;
        Self {
            device,
            queue,
            max_vertex_buffers,
            next_buffer: 0,
            buffers: HashMap::new(),
            layouts: Vec::new(),
            layout_keys: HashMap::new(),
            vertex_bindings: Vec::new(),
            index_binding: None,
            current_layout: None,
        }
    }

    /// Looks up a live buffer.
    #[must_use]
    pub fn buffer(&self, handle: BufferHandle) -> Option<&wgpu::Buffer> {
        self.buffers.get(&handle).map(Arc::as_ref)
    }

    /// Looks up an input layout.
    #[must_use]
    pub fn input_layout(&self, handle: LayoutHandle) -> Option<&InputLayout> {
        self.layouts.get(handle.raw() as usize)
    }

    /// The layout made current by the last `set_input_layout`.
    #[must_use]
    pub fn current_layout(&self) -> Option<(LayoutHandle, wgpu::PrimitiveTopology)> {
        self.current_layout.map(|(layout, topology)| (layout, primitive_topology(topology)))
    }

    /// Snapshot of the bindings read by the current input layout.
    ///
    /// Vertex buffers are rebased to pass slots; without a current layout
    /// only the index buffer is carried.
    #[must_use]
    pub fn bound(&self) -> BoundBuffers {
        let vertex = self
            .current_layout
            .and_then(|(layout, _)| self.input_layout(layout))
            .map(|layout| pass_slots(&self.vertex_bindings, layout.first_slot, layout.slots.len()))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(slot, handle, offset)| {
                let buffer = self.buffers.get(&handle)?;
                Some((slot, Arc::clone(buffer), offset))
            })
            .collect();
        let index = self.index_binding.and_then(|(handle, format, offset)| {
            let buffer = self.buffers.get(&handle)?;
            Some((Arc::clone(buffer), index_format(format), offset))
        });
        BoundBuffers { vertex, index }
    }

    fn insert(&mut self, buffer: wgpu::Buffer) -> BufferHandle {
        self.next_buffer += 1;
        let handle = BufferHandle::new(self.next_buffer);
        self.buffers.insert(handle, Arc::new(buffer));
        handle
    }

    fn create_init(&mut self, label: &str, data: BufferData<'_>, usage: wgpu::BufferUsages) -> Option<BufferHandle> {
        if data.is_empty() {
            return None;
        }
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: data.bytes,
            usage: usage | wgpu::BufferUsages::COPY_DST,
        });
        Some(self.insert(buffer))
    }
}

impl Backend for WgpuBackend {
    fn create_vertex_buffer(&mut self, label: &str, data: BufferData<'_>, _dynamic: bool) -> Option<BufferHandle> {
        self.create_init(label, data, wgpu::BufferUsages::VERTEX)
    }

    fn create_index_buffer(&mut self, label: &str, data: BufferData<'_>, _dynamic: bool) -> Option<BufferHandle> {
        self.create_init(label, data, wgpu::BufferUsages::INDEX)
    }

    fn create_instancing_buffer(&mut self, label: &str, capacity: usize, stride: u32) -> Option<BufferHandle> {
        let size = capacity
            .checked_mul(stride as usize)
            .and_then(|size| wgpu::BufferAddress::try_from(size).ok())
            .filter(|size| *size > 0)?;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Some(self.insert(buffer))
    }

    fn destroy_buffer(&mut self, handle: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&handle) {
            buffer.destroy();
        }
    }

    fn write_discard(&mut self, handle: BufferHandle, data: BufferData<'_>) {
        if let Some(buffer) = self.buffers.get(&handle) {
            self.queue.write_buffer(buffer, 0, data.bytes);
        }
    }

    fn write_no_overwrite(&mut self, handle: BufferHandle, first_item: usize, data: BufferData<'_>) {
        if let Some(buffer) = self.buffers.get(&handle) {
            let offset = (first_item * data.stride as usize) as wgpu::BufferAddress;
            self.queue.write_buffer(buffer, offset, data.bytes);
        }
    }

    fn bind_vertex_buffers(&mut self, first_slot: u32, bindings: &[VertexBinding]) {
        let first = first_slot as usize;
        if self.vertex_bindings.len() < first + bindings.len() {
            self.vertex_bindings.resize(first + bindings.len(), VertexBinding::default());
        }
        self.vertex_bindings[first..first + bindings.len()].copy_from_slice(bindings);
    }

    fn bind_index_buffer(&mut self, handle: Option<BufferHandle>, format: IndexFormat, offset: u64) {
        self.index_binding = handle.map(|h| (h, format, offset));
    }

    fn create_or_get_input_layout(&mut self, technique: &str, elements: &[InputElement]) -> Option<LayoutHandle> {
        if elements.is_empty() {
            return None;
        }
        let key = (technique.to_owned(), elements.to_vec());
        if let Some(handle) = self.layout_keys.get(&key) {
            return Some(*handle);
        }
        let (first_slot, slots) = slot_layouts(elements);
        if !within_slot_limit(technique, slots.len(), self.max_vertex_buffers) {
            return None;
        }
        let handle = LayoutHandle::new(u32::try_from(self.layouts.len()).ok()?);
        self.layouts.push(InputLayout {
            technique: technique.to_owned(),
            first_slot,
            slots,
        });
        self.layout_keys.insert(key, handle);
        Some(handle)
    }

    fn set_input_layout(&mut self, layout: LayoutHandle, topology: Topology) {
        self.current_layout = Some((layout, topology));
    }
}

// =============================================================================
// CONVERSIONS
// =============================================================================

/// Maps an element format to its wgpu vertex format.
#[must_use]
pub const fn vertex_format(format: ElementFormat) -> wgpu::VertexFormat {
    match format {
        ElementFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        ElementFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        ElementFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        ElementFormat::Uint32 => wgpu::VertexFormat::Uint32,
        ElementFormat::Uint32x4 => wgpu::VertexFormat::Uint32x4,
    }
}

/// Maps a topology to its wgpu primitive topology.
#[must_use]
pub const fn primitive_topology(topology: Topology) -> wgpu::PrimitiveTopology {
    match topology {
        Topology::PointList => wgpu::PrimitiveTopology::PointList,
        Topology::LineList => wgpu::PrimitiveTopology::LineList,
        Topology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        Topology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        Topology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

const fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
        IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
    }
}

const fn step_mode(step: StepRate) -> wgpu::VertexStepMode {
    match step {
        StepRate::Vertex => wgpu::VertexStepMode::Vertex,
        StepRate::Instance => wgpu::VertexStepMode::Instance,
    }
}

/// Groups elements by input slot, rebased so the lowest slot is pass slot 0.
/// Shader locations follow element order.
///
/// Items are tightly packed, so a slot's stride is the end of its last element.
fn slot_layouts(elements: &[InputElement]) -> (u32, Vec<Option<SlotLayout>>) {
    let first_slot = elements.iter().map(|e| e.input_slot).min().unwrap_or(0);
    let slot_count = elements.iter().map(|e| (e.input_slot - first_slot) as usize + 1).max().unwrap_or(0);
    let mut slots: Vec<Option<SlotLayout>> = vec![None; slot_count];

    for (element, location) in elements.iter().zip(0u32..) {
        let slot = slots[(element.input_slot - first_slot) as usize].get_or_insert_with(|| SlotLayout {
            array_stride: 0,
            step_mode: step_mode(element.step),
            attributes: Vec::new(),
        });
        slot.attributes.push(wgpu::VertexAttribute {
            format: vertex_format(element.format),
            offset: wgpu::BufferAddress::from(element.offset),
            shader_location: location,
        });
        let end = wgpu::BufferAddress::from(element.offset + element.format.size());
        slot.array_stride = slot.array_stride.max(end);
    }
    (first_slot, slots)
}

fn within_slot_limit(technique: &str, slots: usize, max_vertex_buffers: u32) -> bool {
    if slots > max_vertex_buffers as usize {
        warn!(
            "input layout for {} spans {} vertex buffer slots, device allows {}",
            technique, slots, max_vertex_buffers
        );
        return false;
    }
    true
}

/// Bindings `first_slot..first_slot + count` that hold a buffer, as
/// `(pass slot, buffer, offset)`.
fn pass_slots(bindings: &[VertexBinding], first_slot: u32, count: usize) -> Vec<(u32, BufferHandle, u64)> {
    bindings
        .iter()
        .skip(first_slot as usize)
        .take(count)
        .zip(0u32..)
        .filter_map(|(binding, slot)| Some((slot, binding.buffer?, binding.offset)))
        .collect()
}
