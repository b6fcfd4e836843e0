// rust/snapshot-core/src/lib.rs

//! Checkpoint Snapshot Engine - Core Library
//!
//! This crate saves training state into shared-memory regions owned by a
//! metadata authority and loads it back, falling back to durable files when
//! no live region is available. It covers object-graph serialization with
//! externalized buffers, the checkpoint byte layout, the authority protocol,
//! and local durable storage.

pub mod config;
pub mod error;
pub mod graph;
pub mod iteration;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use graph::{Buffer, BufferId, DType, Device, Key, TypeMarker, Value};
pub use iteration::IterationTag;
pub use storage::{FileInfo, LocalStorage, StorageBackend, StorageWriter};

pub mod serialize;
pub use serialize::{deserialize, serialize, BufferSource, PersistentIdHook};

pub mod checkpoint;
pub use checkpoint::{
    inspect, CheckpointLayout, CheckpointSummary, DataReference, RegionDescriptor, RegionLocator,
    RegionWriter,
};

pub mod authority;
pub use authority::{
    CheckpointRecord, CheckpointState, HttpAuthority, InProcessAuthority, MetadataAuthority,
    StateFilter,
};

pub mod engine;
pub use engine::{wait_all, LoadSource, SaveHandle, SnapshotEngine};

pub mod adapter;
pub use adapter::SnapshotCheckpointEngine;
