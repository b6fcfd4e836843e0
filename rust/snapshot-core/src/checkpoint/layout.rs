// rust/snapshot-core/src/checkpoint/layout.rs

//! Checkpoint layout accounting.

use std::io::Write;
use std::path::Path;

use bytes::Bytes;

use crate::error::{EngineError, Result};
use crate::graph::Buffer;
use crate::serialize::{StorageKey, LENGTH_WORD_SIZE};

/// One root storage whose bytes follow the metadata stream.
#[derive(Debug, Clone)]
pub struct DataReference {
    pub key: StorageKey,
    /// The storage's bytes; shares memory with the caller's buffer.
    pub data: Bytes,
    /// Byte length of `data`.
    pub nbytes: usize,
    /// Element count written into the length word.
    pub numel: u64,
}

impl DataReference {
    /// Describes a root buffer.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedBufferType` if the buffer has no element width.
    pub fn from_root(key: StorageKey, root: &Buffer) -> Result<Self> {
        let numel = root
            .numel()
            .ok_or_else(|| EngineError::unsupported_buffer_type(root.dtype().name()))?;
        let data = root.root_bytes().clone();
        Ok(Self {
            key,
            nbytes: data.len(),
            data,
            numel: numel as u64,
        })
    }

    /// Address of the first byte.
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

/// Everything the region writer needs to place one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    pub metadata: Vec<u8>,
    /// Storages in sorted key order.
    pub references: Vec<DataReference>,
    pub total_size: u64,
}

impl CheckpointLayout {
    /// Computes the layout of a checkpoint destined for `path`.
    ///
    /// `total_size` is the metadata length plus, for every storage, one
    /// length word and its bytes.
    ///
    /// # Errors
    ///
    /// Returns `EmptyCheckpoint` if the total size is zero.
    pub fn new(path: &Path, metadata: Vec<u8>, references: Vec<DataReference>) -> Result<Self> {
        let data: u64 = references.iter().map(|r| r.nbytes as u64).sum();
        let words = (references.len() * LENGTH_WORD_SIZE) as u64;
        let total_size = data + words + metadata.len() as u64;

        if total_size == 0 {
            return Err(EngineError::empty_checkpoint(path));
        }

        Ok(Self {
            metadata,
            references,
            total_size,
        })
    }

    /// Byte offset of each storage's length word, in reference order.
    pub fn offsets(&self) -> Vec<u64> {
        let mut offset = self.metadata.len() as u64;
        self.references
            .iter()
            .map(|r| {
                let at = offset;
                offset += (LENGTH_WORD_SIZE + r.nbytes) as u64;
                at
            })
            .collect()
    }

    /// Streams the full image (metadata, then each length word and storage).
    ///
    /// # Errors
    ///
    /// Returns any I/O error raised by `out`.
    pub fn write_to(&self, out: &mut dyn Write) -> std::io::Result<u64> {
        out.write_all(&self.metadata)?;
        for reference in &self.references {
            out.write_all(&reference.numel.to_ne_bytes())?;
            out.write_all(&reference.data)?;
        }
        Ok(self.total_size)
    }

    /// The full image as one contiguous buffer.
    pub fn to_image(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.total_size as usize);
        // Writing into a Vec cannot fail.
        let _ = self.write_to(&mut image);
        image
    }
}
