// rust/snapshot-core/src/storage/mod.rs

//! Storage abstraction for durable checkpoint copies.
//!
//! The shared-memory fast path never touches this module; it serves the
//! durable save path and the load fallback.
//!
//! # Example
//!
//! ```no_run
//! use snapshot_core::config::StorageConfig;
//! use snapshot_core::storage::{LocalStorage, StorageBackend};
//! use std::io::Write;
//! use std::path::Path;
//!
//! let storage = LocalStorage::new(&StorageConfig::default());
//!
//! let mut writer = storage.open_write(Path::new("example.pt")).unwrap();
//! writer.write_all(b"Hello, world!").unwrap();
//! writer.finish().unwrap();
//!
//! let content = storage.read_bytes(Path::new("example.pt")).unwrap();
//! assert_eq!(&content[..], b"Hello, world!");
//! ```

mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{FileInfo, StorageBackend, StorageWriter};
