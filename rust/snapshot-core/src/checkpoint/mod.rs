// rust/snapshot-core/src/checkpoint/mod.rs

//! Checkpoint layout and the places a layout is written to.
//!
//! This module provides functionality for:
//! - Computing the size and storage order of a checkpoint
//! - Copying a checkpoint into a shared-memory region
//! - Locating live regions on load
//! - Writing and reading durable copies of the same bytes
//! - Summarizing an image without rebuilding its buffers
//!
//! # Layout
//!
//! ```text
//! +---------------------------+
//! | Metadata stream           |  <- see `serialize`
//! +---------------------------+
//! | numel (8 bytes, native)   |  \
//! +---------------------------+   | repeated per storage,
//! | storage bytes             |   | in sorted key order
//! +---------------------------+  /
//! ```

mod durable;
mod inspect;
mod layout;
pub(crate) mod region;
mod writer;

pub use durable::{DurableReader, DurableWriter};
pub use inspect::{inspect, CheckpointSummary, StorageSummary};
pub use layout::{CheckpointLayout, DataReference};
pub use region::{ProcRegionLocator, RegionDescriptor, RegionLocator};
pub use writer::{ProcRegionWriter, RegionWriter};
