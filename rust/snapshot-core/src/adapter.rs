// rust/snapshot-core/src/adapter.rs

//! Checkpoint-engine adapter for training frameworks.
//!
//! Frameworks that drive checkpointing through a `create`, `save`, `load`,
//! `commit` cycle can hand that cycle to [`SnapshotCheckpointEngine`]. Every
//! step is logged the way training logs expect to see it.

use std::path::Path;

use crate::engine::SnapshotEngine;
use crate::error::Result;
use crate::graph::{Device, Value};

/// Framework-facing wrapper around a [`SnapshotEngine`].
#[derive(Clone)]
pub struct SnapshotCheckpointEngine {
    engine: SnapshotEngine,
}

impl SnapshotCheckpointEngine {
    pub fn new(engine: SnapshotEngine) -> Self {
        Self { engine }
    }

    /// Announces the start of checkpoint `tag`.
    pub fn create(&self, tag: &str) {
        tracing::info!("Checkpoint {} is about to be saved!", tag);
    }

    /// Saves one state object of the current checkpoint.
    ///
    /// # Errors
    ///
    /// Propagates [`SnapshotEngine::save`] errors; a failed save is never
    /// committed.
    pub fn save(&self, state: &Value, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        tracing::info!("Saving {}...", path.display());
        self.engine.save(state, path)?;
        tracing::info!("Saved {}.", path.display());
        Ok(())
    }

    /// Loads one state object, relabelling its buffers to `map_location`
    /// when given.
    ///
    /// # Errors
    ///
    /// Propagates [`SnapshotEngine::load`] errors.
    pub fn load(&self, path: impl AsRef<Path>, map_location: Option<&Device>) -> Result<Value> {
        let path = path.as_ref();
        tracing::info!("Loading checkpoint from {}...", path.display());
        let value = self.engine.load_mapped(path, map_location)?;
        tracing::info!("Loaded checkpoint from {}.", path.display());
        Ok(value)
    }

    /// Marks checkpoint `tag` complete.
    ///
    /// Each `save` already committed its own record, so there is nothing
    /// left to flush and this always succeeds.
    pub fn commit(&self, tag: &str) -> bool {
        tracing::info!("Checkpoint {} is ready now!", tag);
        true
    }

    pub fn engine(&self) -> &SnapshotEngine {
        &self.engine
    }
}
