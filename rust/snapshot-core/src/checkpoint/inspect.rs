// rust/snapshot-core/src/checkpoint/inspect.rs

//! Structural summary of a checkpoint image.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{EngineError, Result};
use crate::graph::{DType, Device};
use crate::serialize::{read_header, BufferSource, SectionSource, StorageKey, SysInfo};

/// One root storage as laid out in the data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSummary {
    pub key: StorageKey,
    pub dtype: DType,
    pub location: Device,
    pub numel: u64,
    pub nbytes: u64,
    /// Offset of the storage's length word from the start of the image.
    pub offset: u64,
    /// Number of records in the graph that reference this storage.
    pub references: usize,
}

/// What an image contains, without rebuilding its buffers.
#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub sys_info: SysInfo,
    pub metadata_len: u64,
    pub storages: Vec<StorageSummary>,
    pub view_records: usize,
    pub type_definitions: Vec<String>,
    pub total_size: u64,
    /// Bytes after the last storage.
    pub trailing_bytes: u64,
}

impl CheckpointSummary {
    pub fn data_bytes(&self) -> u64 {
        self.storages.iter().map(|s| s.nbytes).sum()
    }
}

/// Walks the header and the data section of `image`.
///
/// # Errors
///
/// Fails the same way decoding would: `IncompatibleFormat` for a foreign
/// stream and `MissingStorage` for a truncated data section.
pub fn inspect(image: Bytes) -> Result<CheckpointSummary> {
    let header = read_header(&image)?;

    let mut roots = BTreeMap::new();
    let mut references: BTreeMap<StorageKey, usize> = BTreeMap::new();
    let mut view_records = 0;
    for record in header.records() {
        roots.entry(record.key).or_insert(record);
        *references.entry(record.key).or_default() += 1;
        if record.view.is_some() {
            view_records += 1;
        }
    }

    let mut source = SectionSource::new(image.slice(header.metadata_len..));
    let mut storages = Vec::with_capacity(header.keys.len());
    for key in &header.keys {
        let record = roots.get(key).ok_or_else(|| {
            EngineError::missing_storage(key.0, "key list names a storage no record references")
        })?;
        let element_size = record
            .dtype
            .element_size()
            .ok_or_else(|| EngineError::unsupported_buffer_type(record.dtype.name()))?;
        let offset = (image.len() - source.remaining()) as u64;
        let bytes = source.fetch(*key, record.numel, element_size)?;
        storages.push(StorageSummary {
            key: *key,
            dtype: record.dtype.clone(),
            location: record.location.clone(),
            numel: record.numel,
            nbytes: bytes.len() as u64,
            offset,
            references: references.get(key).copied().unwrap_or(0),
        });
    }

    let type_definitions = header
        .type_definitions()
        .into_iter()
        .map(|def| def.name.clone())
        .collect();

    Ok(CheckpointSummary {
        sys_info: header.sys_info,
        metadata_len: header.metadata_len as u64,
        storages,
        view_records,
        type_definitions,
        total_size: image.len() as u64,
        trailing_bytes: source.remaining() as u64,
    })
}
