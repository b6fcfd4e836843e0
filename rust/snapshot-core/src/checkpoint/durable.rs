// rust/snapshot-core/src/checkpoint/durable.rs

//! Durable checkpoint files.
//!
//! A durable file holds exactly the bytes a shared-memory region would, so
//! the same decoder serves both copies.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::config::DurableConfig;
use crate::error::{EngineError, Result};
use crate::storage::{FileInfo, StorageBackend};

use super::layout::CheckpointLayout;

/// Writes checkpoint layouts to durable storage.
#[derive(Clone)]
pub struct DurableWriter {
    storage: Arc<dyn StorageBackend>,
    config: DurableConfig,
}

impl DurableWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, config: DurableConfig) -> Self {
        Self { storage, config }
    }

    /// Writes `layout` to `path`.
    ///
    /// With atomic writes enabled the file is written to a hidden temporary
    /// sibling first and renamed into place, so readers never observe a
    /// partial file.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be written or renamed.
    pub fn write(&self, path: &Path, layout: &CheckpointLayout) -> Result<()> {
        if self.config.atomic_writes {
            let temp_path = temp_path_for(path)?;
            if let Err(e) = self.write_to_path(&temp_path, layout) {
                // Best effort; the temp file is hidden either way.
                let _ = self.storage.delete(&temp_path);
                return Err(e);
            }
            self.storage.rename(&temp_path, path)
        } else {
            self.write_to_path(path, layout)
        }
    }

    fn write_to_path(&self, path: &Path, layout: &CheckpointLayout) -> Result<()> {
        let mut writer = self.storage.open_write(path)?;
        layout.write_to(&mut writer).map_err(|e| {
            EngineError::storage_with_source(path, "failed to write checkpoint data", e)
        })?;
        writer.finish()
    }
}

/// Reads durable checkpoint files.
#[derive(Clone)]
pub struct DurableReader {
    storage: Arc<dyn StorageBackend>,
}

impl DurableReader {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Returns the file's bytes, or `None` if no durable copy exists.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file exists but cannot be read.
    pub fn read(&self, path: &Path) -> Result<Option<Bytes>> {
        let Some(info) = self.storage.stat(path)? else {
            return Ok(None);
        };
        tracing::debug!(
            path = %path.display(),
            size = info.size,
            modified = ?info.modified,
            "reading durable checkpoint"
        );
        self.storage.read_bytes(path).map(Some)
    }

    /// Size and modification time of the durable copy, if one exists.
    pub fn stat(&self, path: &Path) -> Result<Option<FileInfo>> {
        self.storage.stat(path)
    }
}

/// `.name.tmp` next to `path`.
fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EngineError::storage(path, "checkpoint path has no file name"))?;
    let temp_filename = format!(".{filename}.tmp");
    Ok(match path.parent() {
        Some(parent) => parent.join(temp_filename),
        None => PathBuf::from(temp_filename),
    })
}
