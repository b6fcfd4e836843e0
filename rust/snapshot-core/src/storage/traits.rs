// rust/snapshot-core/src/storage/traits.rs

//! Backend traits for durable checkpoint files.

use std::io::Write;
use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Size and age of a durable checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Sink for one checkpoint file.
///
/// Bytes written before `finish` may still sit in a buffer; only a
/// successful `finish` means the file is complete on disk.
pub trait StorageWriter: Write + Send {
    /// Flushes and syncs the file.
    ///
    /// # Errors
    ///
    /// Returns a storage error if flushing or syncing fails.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Where durable checkpoint files live.
///
/// Paths are checkpoint paths exactly as the caller saved them; relative
/// paths are resolved by the backend.
pub trait StorageBackend: Send + Sync {
    /// Describes the checkpoint file at `path`.
    ///
    /// Returns `Ok(None)` when there is no regular file there. Directories
    /// never count as checkpoints.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the path exists but cannot be examined.
    fn stat(&self, path: &Path) -> Result<Option<FileInfo>>;

    /// Reads a whole file.
    ///
    /// Implementations may map large files instead of copying them.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file is missing or unreadable.
    fn read_bytes(&self, path: &Path) -> Result<Bytes>;

    /// Creates or truncates the file at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be created.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    fn delete(&self, path: &Path) -> Result<()>;

    /// Moves `from` over `to`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the source is missing or the rename fails.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}
