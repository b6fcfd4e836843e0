// rust/snapshot-core/src/serialize/table.rs

//! Storage reference table.
//!
//! Tracks every root allocation reached during one serialization pass and
//! assigns it a [`StorageKey`]. Aliasing is detected purely by allocation
//! identity ([`BufferId`]): two buffers are the same storage if and only if
//! they were cut from one root, regardless of content. The table also
//! remembers which structured types have had their source embedded.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{EngineError, Result};
use crate::graph::{Buffer, BufferId, DType, TypeMarker, Value};

use super::encoder::PersistentIdHook;
use super::record::{PersistentRecord, StorageKey, StorageReferenceRecord, TypeDefinition, ViewMetadata};

#[derive(Debug, Default)]
pub struct StorageReferenceTable {
    /// Root storages by key; the BTreeMap keeps them in key order.
    storages: BTreeMap<StorageKey, Buffer>,
    /// First dtype seen for each non-empty root.
    dtypes: HashMap<BufferId, DType>,
    /// Types whose definition has already been emitted.
    embedded_types: HashSet<TypeMarker>,
}

impl StorageReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a buffer and returns the key of its root storage.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedBufferType` if the buffer's element type has no
    /// known width, and `AliasConflict` if the root was already registered
    /// under a different element type.
    pub fn register(&mut self, buffer: &Buffer) -> Result<StorageKey> {
        let element_size = buffer
            .dtype()
            .element_size()
            .ok_or_else(|| EngineError::unsupported_buffer_type(buffer.dtype().name()))?;

        let key = StorageKey(buffer.root_id().as_u64());
        let root = buffer.root();

        if root.len() % element_size != 0 {
            return Err(EngineError::serialization(format!(
                "storage {key} of {} bytes cannot hold whole {} elements",
                root.len(),
                buffer.dtype()
            )));
        }

        // Empty roots own no memory, so there is nothing to reinterpret.
        if !root.is_empty() {
            match self.dtypes.get(&buffer.root_id()) {
                Some(existing) if existing != buffer.dtype() => {
                    return Err(EngineError::alias_conflict(
                        key.0,
                        existing.name(),
                        buffer.dtype().name(),
                    ));
                }
                Some(_) => {}
                None => {
                    self.dtypes.insert(buffer.root_id(), buffer.dtype().clone());
                }
            }
        }

        self.storages.entry(key).or_insert(root);
        Ok(key)
    }

    /// Builds the reference record that replaces `buffer` in the stream.
    pub fn reference(&mut self, buffer: &Buffer) -> Result<StorageReferenceRecord> {
        let key = self.register(buffer)?;
        let root = buffer.root();
        // register() guarantees a known element size.
        let numel = root.numel().unwrap_or(0) as u64;

        let view = (!buffer.is_root()).then(|| ViewMetadata {
            view_key: format!("{key}.{}.{}", buffer.byte_offset(), buffer.len()),
            offset: buffer.byte_offset() as u64,
            byte_len: buffer.len() as u64,
        });

        Ok(StorageReferenceRecord {
            key,
            dtype: buffer.dtype().clone(),
            location: buffer.device().clone(),
            numel,
            view,
        })
    }

    /// Returns the type's definition the first time it is seen, `None` after.
    ///
    /// Failing to read the defining source is not an error; the definition is
    /// emitted without source and a warning is logged.
    pub fn embed_type(&mut self, marker: &TypeMarker) -> Option<TypeDefinition> {
        if !self.embedded_types.insert(marker.clone()) {
            return None;
        }

        let source = match &marker.source_file {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(
                        type_name = %marker.name,
                        path = %path.display(),
                        error = %e,
                        "couldn't retrieve source code for type; it won't be checked for correctness upon loading"
                    );
                    None
                }
            },
            None => {
                tracing::warn!(
                    type_name = %marker.name,
                    "no source file recorded for type; it won't be checked for correctness upon loading"
                );
                None
            }
        };

        Some(TypeDefinition {
            name: marker.name.clone(),
            source_file: marker.source_file.clone(),
            source,
        })
    }

    /// Storage keys in sorted order.
    pub fn sorted_keys(&self) -> Vec<StorageKey> {
        self.storages.keys().copied().collect()
    }

    /// Root storages in sorted key order.
    pub fn storages(&self) -> impl Iterator<Item = (StorageKey, &Buffer)> {
        self.storages.iter().map(|(key, buffer)| (*key, buffer))
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }
}

impl PersistentIdHook for StorageReferenceTable {
    fn persistent_id(&mut self, value: &Value) -> Result<Option<PersistentRecord>> {
        match value {
            Value::Buffer(buffer) => Ok(Some(PersistentRecord::Storage(self.reference(buffer)?))),
            Value::Type(marker) => Ok(self.embed_type(marker).map(PersistentRecord::Module)),
            _ => Ok(None),
        }
    }
}
