//! Integration tests for binding accessors and range writes.

use oroboros_buffers::{
    BackendCall, BufferError, BufferManager, BufferUsage, DataKind, InstanceRecord, PositionColorVertex,
    PositionVertex, RecordingBackend, SkinnedVertex, StepRate, Topology, VertexLayout,
};

fn positions(n: usize, value: f32) -> Vec<PositionVertex> {
    vec![PositionVertex { position: [value; 3] }; n]
}

fn committed() -> (BufferManager<RecordingBackend>, RecordingBackend) {
    let backend = RecordingBackend::new();
    let manager = BufferManager::with_defaults(backend.clone());
    manager.add_vertex_data("terrain", positions(6, 0.0), false, 3);
    manager.add_vertex_data("hero", vec![SkinnedVertex::default(); 4], true, 1);
    manager.add_index_data("terrain", vec![0u32, 1, 2, 3, 4, 5], false);
    manager.commit().unwrap();
    backend.clear_calls();
    (manager, backend)
}

#[test]
fn test_binding_before_first_commit_fails() {
    let backend = RecordingBackend::new();
    let manager = BufferManager::with_defaults(backend.clone());
    manager.add_vertex_data("a", positions(3, 0.0), false, 0);

    assert!(!manager.bind_vertex_groups());
    assert_eq!(manager.try_bind_vertex_groups(), Err(BufferError::NotInitialized));
    assert!(!manager.bind_index_group(0));
    assert!(!manager.set_input_layout("lit", 0, Topology::TriangleList));
    assert!(!manager.write_instancing_data(&[InstanceRecord::IDENTITY]));
    assert_eq!(backend.call_count(), 0);
}

#[test]
fn test_bind_vertex_groups_pairs_geometry_and_instancing() {
    let (manager, backend) = committed();
    assert!(manager.bind_vertex_groups());

    let instancing = backend.live_buffers(BufferUsage::Instancing)[0].0;
    let calls = backend.calls();
    let [BackendCall::BindVertexBuffers { first_slot, bindings }] = calls.as_slice() else {
        panic!("expected a single bind call, got {calls:?}");
    };

    assert_eq!(*first_slot, 0);
    assert_eq!(bindings.len(), 4);
    assert_eq!(bindings[0].stride, VertexLayout::Position.stride());
    assert_eq!(bindings[2].stride, VertexLayout::Skinned.stride());
    for instancing_binding in [bindings[1], bindings[3]] {
        assert_eq!(instancing_binding.buffer, Some(instancing));
        assert_eq!(instancing_binding.stride, InstanceRecord::stride());
    }
}

#[test]
fn test_bind_index_group() {
    let (manager, backend) = committed();

    assert!(manager.bind_index_group(0));
    assert!(matches!(backend.calls()[0], BackendCall::BindIndexBuffer { handle: Some(_), .. }));

    // Slot 1 is the reserved dynamic group, still empty.
    assert_eq!(
        manager.try_bind_index_group(1),
        Err(BufferError::NoPhysicalBuffer { kind: DataKind::Index, slot: 1 })
    );
    assert_eq!(manager.try_bind_index_group(7), Err(BufferError::NoSuchGroup { kind: DataKind::Index, slot: 7 }));
}

#[test]
fn test_input_layout_cached_per_technique_and_slot() {
    let (manager, backend) = committed();

    assert!(manager.set_input_layout("lit", 1, Topology::TriangleList));
    assert!(manager.set_input_layout("lit", 1, Topology::TriangleStrip));
    assert!(manager.set_input_layout("shadow", 1, Topology::TriangleList));

    let created: Vec<_> = backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            BackendCall::CreateInputLayout { technique, elements } => Some((technique, elements)),
            _ => None,
        })
        .collect();
    assert_eq!(created.len(), 2);

    // Skinned geometry at slot 2, instancing at slot 3.
    let (technique, elements) = &created[0];
    assert_eq!(technique, "lit");
    let (geometry, instancing): (Vec<&oroboros_buffers::InputElement>, Vec<_>) = elements.iter().partition(|e| e.input_slot == 2);
    assert_eq!(geometry.len(), VertexLayout::Skinned.input_elements(0).len());
    assert!(instancing.iter().all(|e| e.input_slot == 3 && e.step == StepRate::Instance));

    let set = backend.calls().iter().filter(|c| matches!(c, BackendCall::SetInputLayout { .. })).count();
    assert_eq!(set, 3);
}

#[test]
fn test_input_layout_unknown_slot() {
    let (manager, _backend) = committed();
    assert_eq!(
        manager.try_set_input_layout("lit", 9, Topology::TriangleList),
        Err(BufferError::NoSuchGroup { kind: DataKind::Vertex, slot: 9 })
    );
}

#[test]
fn test_write_instancing_data_respects_capacity() {
    let (manager, backend) = committed();
    let records: Vec<_> = (0..4).map(|i| InstanceRecord::at([i as f32, 0.0, 0.0])).collect();

    assert!(manager.write_instancing_data(&records));
    let handle = backend.live_buffers(BufferUsage::Instancing)[0].0;
    assert_eq!(backend.calls(), vec![BackendCall::WriteDiscard { handle, items: 4 }]);
    let bytes = backend.buffer(handle).unwrap().bytes;
    assert_eq!(&bytes[..InstanceRecord::SIZE], bytemuck::bytes_of(&records[0]));

    let too_many = vec![InstanceRecord::IDENTITY; 5];
    assert_eq!(
        manager.try_write_instancing_data(&too_many),
        Err(BufferError::InstancingOverflow { capacity: 4, requested: 5 })
    );
}

#[test]
fn test_write_without_instancing_buffer() {
    let backend = RecordingBackend::new();
    let manager = BufferManager::with_defaults(backend);
    manager.add_vertex_data("a", positions(3, 0.0), false, 0);
    manager.commit().unwrap();

    assert_eq!(manager.try_write_instancing_data(&[]), Err(BufferError::NoInstancingBuffer));
}

#[test]
fn test_vertex_range_write_survives_reallocation() {
    let (manager, backend) = committed();

    assert!(manager.write_vertex_range(0, 2, positions(2, 7.0)));
    let handle = backend.live_buffers(BufferUsage::Vertex)[0].0;
    assert_eq!(
        backend.calls(),
        vec![BackendCall::WriteNoOverwrite { handle, first_item: 2, items: 2 }]
    );

    // Force group 0 to reallocate: the new buffer carries the written items.
    manager.add_vertex_data("rock", positions(1, 0.0), false, 0);
    manager.commit().unwrap();

    let mut expected = positions(7, 0.0);
    expected[2..4].copy_from_slice(&positions(2, 7.0));
    let (_, buffer) = backend
        .live_buffers(BufferUsage::Vertex)
        .into_iter()
        .find(|(_, b)| b.label == "oroboros:vertex:0:position:static")
        .unwrap();
    assert_eq!(buffer.bytes, bytemuck::cast_slice::<PositionVertex, u8>(&expected));
}

#[test]
fn test_vertex_range_write_failures() {
    let (manager, backend) = committed();

    assert_eq!(
        manager.try_write_vertex_range(0, 0, vec![PositionColorVertex::default()]),
        Err(BufferError::LayoutMismatch { expected: VertexLayout::Position, found: VertexLayout::PositionColor })
    );
    assert_eq!(
        manager.try_write_vertex_range(0, 5, positions(2, 1.0)),
        Err(BufferError::RangeOutOfBounds { offset: 5, end: 7, len: 6 })
    );
    assert_eq!(
        manager.try_write_vertex_range(4, 0, positions(1, 1.0)),
        Err(BufferError::NoSuchGroup { kind: DataKind::Vertex, slot: 4 })
    );
    assert!(!manager.write_vertex_range(0, 5, positions(2, 1.0)));
    assert_eq!(backend.call_count(), 0);
}

#[test]
fn test_index_range_write() {
    let (manager, backend) = committed();

    assert!(manager.write_index_range(0, 3, &[9, 9, 9]));
    let (handle, buffer) = backend.live_buffers(BufferUsage::Index).remove(0);
    assert_eq!(buffer.bytes, bytemuck::cast_slice::<u32, u8>(&[0, 1, 2, 9, 9, 9]));
    assert_eq!(backend.calls(), vec![BackendCall::WriteNoOverwrite { handle, first_item: 3, items: 3 }]);

    assert_eq!(
        manager.try_write_index_range(0, 4, &[1, 1, 1]),
        Err(BufferError::RangeOutOfBounds { offset: 4, end: 7, len: 6 })
    );
    assert_eq!(
        manager.try_write_index_range(1, 0, &[1]),
        Err(BufferError::NoPhysicalBuffer { kind: DataKind::Index, slot: 1 })
    );
}

#[test]
fn test_range_writes_at_usize_max_offset_fail_cleanly() {
    let (manager, backend) = committed();

    assert!(!manager.write_vertex_range(0, usize::MAX, vec![PositionVertex::default()]));
    assert!(!manager.write_index_range(0, usize::MAX, &[1, 2]));
    assert_eq!(
        manager.try_write_vertex_range(0, usize::MAX, positions(1, 0.0)),
        Err(BufferError::RangeOutOfBounds { offset: usize::MAX, end: usize::MAX, len: 6 })
    );
    assert_eq!(
        manager.try_write_index_range(0, usize::MAX - 1, &[1, 2, 3]),
        Err(BufferError::RangeOutOfBounds { offset: usize::MAX - 1, end: usize::MAX, len: 6 })
    );
    assert_eq!(backend.call_count(), 0);

    // Nothing was poisoned: a valid write still goes through.
    assert!(manager.write_index_range(0, 0, &[5]));
}
