// rust/snapshot-core/src/authority/mod.rs

//! Metadata authority clients.
//!
//! The authority owns checkpoint records and the shared-memory regions they
//! point at. The engine asks it for a region before a save, marks the record
//! CACHED once the bytes are in place, and asks where a checkpoint lives
//! before a load.
//!
//! Two implementations are provided:
//! - [`HttpAuthority`] talks JSON over HTTP to an external authority service
//! - [`InProcessAuthority`] keeps records and memfd regions in this process

mod http;
mod memory;
mod state;

use std::path::Path;

pub use http::HttpAuthority;
pub use memory::InProcessAuthority;
pub use state::{Allocation, CheckpointRecord, CheckpointState, RegionStatus, StateFilter};

use crate::error::Result;
use crate::iteration::IterationTag;

/// Record keeper for checkpoints and their regions.
///
/// Implementations must be safe to call from concurrent save threads.
pub trait MetadataAuthority: Send + Sync {
    /// Creates (or resets) the record for `path` in `PENDING` and returns a
    /// region of exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Authority` if the request is refused and
    /// `AuthorityUnreachable` if no answer arrives.
    fn allocate(&self, path: &Path, iteration: &IterationTag, size: u64) -> Result<Allocation>;

    /// Moves the record for `path` to `state`.
    ///
    /// # Errors
    ///
    /// Returns `Authority` if the record is unknown or the transition refused.
    fn update(&self, path: &Path, state: CheckpointState) -> Result<()>;

    /// Marks a fully written checkpoint `CACHED`.
    fn commit(&self, path: &Path) -> Result<()> {
        self.update(path, CheckpointState::Cached)
    }

    /// Reports the state of `path` and where its region lives.
    ///
    /// # Errors
    ///
    /// Returns `Authority` when the authority has no usable region for `path`.
    fn query(&self, path: &Path) -> Result<RegionStatus>;

    /// Lists records matching `filter`.
    fn list(&self, filter: StateFilter) -> Result<Vec<CheckpointRecord>>;
}
