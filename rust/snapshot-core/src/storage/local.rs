// rust/snapshot-core/src/storage/local.rs

//! Local filesystem storage backend implementation.
//!
//! Durable checkpoint files are plain files. Large files are memory-mapped
//! on read so the deserializer can slice storages out of them without a copy.
//! A mapped file must only ever be replaced by rename: truncating it in place
//! changes or invalidates every graph already loaded from it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use memmap2::Mmap;

use super::traits::{FileInfo, StorageBackend, StorageWriter};
use crate::config::StorageConfig;
use crate::error::{EngineError, Result};

/// Local filesystem storage backend.
pub struct LocalStorage {
    /// Base path that relative paths resolve against.
    base_path: PathBuf,
    /// Buffer size for buffered writes.
    buffer_size: usize,
    /// Whether to use memory-mapped reads.
    use_mmap: bool,
    /// File size threshold above which to use mmap.
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a new `LocalStorage` instance from configuration.
    ///
    /// Unlike a data directory, the base path is not created eagerly: loads
    /// only ever probe it.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            base_path: config.base_path.clone(),
            buffer_size: config.buffer_size,
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        }
    }

    /// Enables or disables memory-mapped reads regardless of configuration.
    pub fn with_mmap(mut self, enabled: bool) -> Self {
        self.use_mmap = enabled;
        self
    }

    /// Resolves a path relative to the base path.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn create_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    EngineError::storage_with_source(parent, "failed to create parent directories", e)
                })?;
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalStorage {
    fn stat(&self, path: &Path) -> Result<Option<FileInfo>> {
        let full_path = self.resolve_path(path);
        let meta = match fs::metadata(&full_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::storage_with_source(
                    &full_path,
                    "failed to read metadata",
                    e,
                ))
            }
        };
        if !meta.is_file() {
            return Ok(None);
        }

        Ok(Some(FileInfo {
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }))
    }

    fn read_bytes(&self, path: &Path) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| EngineError::storage_with_source(&full_path, "failed to open file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                EngineError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        // Use mmap for large files if enabled
        if self.use_mmap && size > 0 && size >= self.mmap_threshold {
            // SAFETY: The file is opened read-only and checkpoint files are
            // replaced by rename, never rewritten in place.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                EngineError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;
            Ok(Bytes::from_owner(mmap))
        } else {
            let data = fs::read(&full_path)
                .map_err(|e| EngineError::storage_with_source(&full_path, "failed to read file", e))?;
            Ok(Bytes::from(data))
        }
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);
        Self::create_parent(&full_path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .map_err(|e| {
                EngineError::storage_with_source(&full_path, "failed to create file", e)
            })?;

        Ok(Box::new(LocalWriter::new(file, full_path, self.buffer_size)))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);
        fs::remove_file(&full_path)
            .map_err(|e| EngineError::storage_with_source(&full_path, "failed to delete file", e))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        Self::create_parent(&to_path)?;

        fs::rename(&from_path, &to_path).map_err(|e| {
            EngineError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }
}

/// Buffered file writer for local storage.
struct LocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl LocalWriter {
    fn new(file: File, path: PathBuf, buffer_size: usize) -> Self {
        Self {
            writer: BufWriter::with_capacity(buffer_size, file),
            path,
        }
    }
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageWriter for LocalWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| EngineError::storage_with_source(&self.path, "failed to flush writer", e))?;

        // Sync to disk
        self.writer.get_ref().sync_all().map_err(|e| {
            EngineError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            use_mmap: true,
            mmap_threshold: 1024, // Low threshold for testing
        };
        (LocalStorage::new(&config), temp_dir)
    }

    fn write_file(storage: &LocalStorage, path: &str, data: &[u8]) {
        let mut writer = storage.open_write(Path::new(path)).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_stat_file() {
        let (storage, _temp) = create_test_storage();
        assert_eq!(storage.stat(Path::new("ckpt.pt")).unwrap(), None);

        write_file(&storage, "ckpt.pt", b"hello world");

        let info = storage.stat(Path::new("ckpt.pt")).unwrap().unwrap();
        assert_eq!(info.size, 11);
        assert!(info.modified.is_some());
    }

    #[test]
    fn test_directory_is_not_a_checkpoint() {
        let (storage, temp) = create_test_storage();
        fs::create_dir_all(temp.path().join("global_step10")).unwrap();

        assert_eq!(storage.stat(Path::new("global_step10")).unwrap(), None);
    }

    #[test]
    fn test_read_small_file() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "small.pt", b"hello world");

        let data = storage.read_bytes(Path::new("small.pt")).unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[test]
    fn test_read_large_file_mapped() {
        let (storage, _temp) = create_test_storage();
        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        write_file(&storage, "large.pt", &data);

        let read = storage.read_bytes(Path::new("large.pt")).unwrap();
        assert_eq!(&read[..], &data[..]);
    }

    #[test]
    fn test_unmapped_read_survives_in_place_rewrite() {
        let (storage, _temp) = create_test_storage();
        let storage = storage.with_mmap(false);
        write_file(&storage, "rewritten.pt", &[1u8; 8192]);

        let before = storage.read_bytes(Path::new("rewritten.pt")).unwrap();
        write_file(&storage, "rewritten.pt", &[2u8; 4]);

        assert_eq!(&before[..], &[1u8; 8192][..]);
        let after = storage.read_bytes(Path::new("rewritten.pt")).unwrap();
        assert_eq!(&after[..], &[2u8; 4]);
    }

    #[test]
    fn test_read_empty_file() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "empty.pt", b"");

        assert!(storage.read_bytes(Path::new("empty.pt")).unwrap().is_empty());
    }

    #[test]
    fn test_read_missing_file() {
        let (storage, _temp) = create_test_storage();
        let result = storage.read_bytes(Path::new("missing.pt"));
        assert!(matches!(result, Err(EngineError::Storage { .. })));
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let (storage, temp) = create_test_storage();
        write_file(&storage, "a/b/c.pt", b"x");

        assert!(temp.path().join("a/b/c.pt").is_file());
    }

    #[test]
    fn test_absolute_path_ignores_base() {
        let (storage, _temp) = create_test_storage();
        let other = TempDir::new().unwrap();
        let absolute = other.path().join("abs.pt");

        write_file(&storage, absolute.to_str().unwrap(), b"abs");
        assert!(absolute.is_file());
    }

    #[test]
    fn test_rename_and_delete() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, ".ckpt.pt.tmp", b"data");

        storage
            .rename(Path::new(".ckpt.pt.tmp"), Path::new("ckpt.pt"))
            .unwrap();
        assert!(storage.stat(Path::new(".ckpt.pt.tmp")).unwrap().is_none());
        assert!(storage.stat(Path::new("ckpt.pt")).unwrap().is_some());

        storage.delete(Path::new("ckpt.pt")).unwrap();
        assert!(storage.stat(Path::new("ckpt.pt")).unwrap().is_none());
    }
}
