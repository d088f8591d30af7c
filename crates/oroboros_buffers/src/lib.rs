//! # OROBOROS Buffers
//!
//! GPU buffer sub-allocation for the OROBOROS renderer.
//!
//! Many independently owned chunks of render data (mesh vertex streams,
//! index streams, per-draw instancing records) are packed into a handful of
//! physical device buffers, one per compatibility key:
//!
//! ```text
//! vertex groups: (layout, dynamic) ─► [ mesh A | mesh B | mesh C ]  one buffer each
//! index groups:  (dynamic)         ─► [ idx A  | idx B ]            one buffer each
//! instancing:    shared            ─► [ sum of every vertex group's instance demand ]
//! ```
//!
//! ## Design Principles
//!
//! 1. **Deferred apply** - Producers enqueue mutations; one orchestrator commits once per frame
//! 2. **Contiguous offsets** - Within a group, descriptor ranges are always packed from offset 0
//! 3. **No churn** - Only groups whose content changed are reallocated
//! 4. **No panics in the render loop** - Failures are reported as `false` plus a log line
//!
//! ## Thread Safety
//!
//! `add_*`/`remove_*` may be called from any thread. `commit` is meant for a
//! single thread; overlapping calls are dropped.
//!
//! ## Example
//!
//! ```rust,ignore
//! use oroboros_buffers::{BufferManager, PositionVertex, RecordingBackend};
//!
//! let manager = BufferManager::with_defaults(RecordingBackend::new());
//! let rock = manager.add_vertex_data("rock", vec![PositionVertex::default(); 36], false, 16);
//!
//! manager.commit();
//! assert_eq!(rock.offset(), 0);
//! assert!(manager.bind_vertex_groups());
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod group;
pub mod instancing;
pub mod layout;
pub mod manager;
pub mod stats;

mod request;

pub use backend::{
    Backend, BackendCall, BufferData, BufferHandle, BufferUsage, IndexFormat, LayoutHandle, RecordedBuffer,
    RecordingBackend, Topology, VertexBinding, WgpuBackend,
};
pub use config::{BufferManagerConfig, ReservedVertexGroup};
pub use descriptor::{DataKind, Descriptor, DescriptorState};
pub use error::{BufferError, BufferResult};
pub use group::{IndexStream, ItemStream};
pub use instancing::InstanceRecord;
pub use layout::{
    ElementFormat, InputElement, PositionColorVertex, PositionNormalUvVertex, PositionVertex, SkinnedVertex, StepRate,
    VertexLayout, VertexStream,
};
pub use manager::{BufferManager, Phase};
pub use stats::{CommitStats, GroupInfo};
