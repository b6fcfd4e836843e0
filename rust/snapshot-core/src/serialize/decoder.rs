// rust/snapshot-core/src/serialize/decoder.rs

//! Graph decoder.
//!
//! Decoding runs in two phases. The first reads the metadata segments and
//! pulls one byte range per storage key from a [`BufferSource`], in sorted
//! key order. The second rebuilds the graph, substituting each reference
//! record with a buffer cut from the restored storage.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::error::{EngineError, Result};
use crate::graph::{Buffer, DType, Device, Key, TypeMarker, Value};

use super::record::{
    Node, PersistentRecord, StorageKey, StorageReferenceRecord, SysInfo, TypeDefinition,
    LENGTH_WORD_SIZE, MAGIC_NUMBER, PROTOCOL_VERSION,
};

/// Supplies the raw bytes of each storage during decoding.
///
/// `fetch` is called once per key, in ascending key order.
pub trait BufferSource {
    fn fetch(&mut self, key: StorageKey, numel: u64, element_size: usize) -> Result<Bytes>;
}

/// Reads storages from the data section that follows a metadata stream.
///
/// Each storage is an element-count word in native byte order followed by
/// `numel * element_size` bytes. Slices share the section's memory.
pub struct SectionSource {
    data: Bytes,
    cursor: usize,
}

impl SectionSource {
    pub fn new(data: Bytes) -> Self {
        Self { data, cursor: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }
}

impl BufferSource for SectionSource {
    fn fetch(&mut self, key: StorageKey, numel: u64, element_size: usize) -> Result<Bytes> {
        if self.remaining() < LENGTH_WORD_SIZE {
            return Err(EngineError::missing_storage(
                key.0,
                "data section ends before the storage's length word",
            ));
        }
        let mut word = [0u8; LENGTH_WORD_SIZE];
        word.copy_from_slice(&self.data[self.cursor..self.cursor + LENGTH_WORD_SIZE]);
        let recorded = u64::from_ne_bytes(word);
        if recorded != numel {
            return Err(EngineError::incompatible_format(format!(
                "storage {key} holds {recorded} elements but its record says {numel}"
            )));
        }
        self.cursor += LENGTH_WORD_SIZE;

        let nbytes = usize::try_from(numel)
            .ok()
            .and_then(|n| n.checked_mul(element_size))
            .ok_or_else(|| EngineError::missing_storage(key.0, "storage size overflows"))?;
        if self.remaining() < nbytes {
            return Err(EngineError::missing_storage(
                key.0,
                format!("needs {nbytes} bytes but only {} remain", self.remaining()),
            ));
        }
        let bytes = self.data.slice(self.cursor..self.cursor + nbytes);
        self.cursor += nbytes;
        Ok(bytes)
    }
}

/// Storages supplied from memory, keyed by storage key.
#[derive(Debug, Default)]
pub struct MapSource {
    storages: HashMap<StorageKey, Bytes>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: StorageKey, bytes: impl Into<Bytes>) {
        self.storages.insert(key, bytes.into());
    }
}

impl BufferSource for MapSource {
    fn fetch(&mut self, key: StorageKey, numel: u64, element_size: usize) -> Result<Bytes> {
        let bytes = self
            .storages
            .get(&key)
            .cloned()
            .ok_or_else(|| EngineError::missing_storage(key.0, "no bytes supplied for storage"))?;
        if bytes.len() as u64 != numel * element_size as u64 {
            return Err(EngineError::missing_storage(
                key.0,
                format!("expected {} bytes, got {}", numel * element_size as u64, bytes.len()),
            ));
        }
        Ok(bytes)
    }
}

/// Decoded metadata segments.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub sys_info: SysInfo,
    pub graph: Node,
    pub keys: Vec<StorageKey>,
    /// Length of the metadata stream in bytes.
    pub metadata_len: usize,
}

impl StreamHeader {
    /// All storage reference records, in walk order.
    pub fn records(&self) -> Vec<&StorageReferenceRecord> {
        let mut records = Vec::new();
        self.graph.for_each_persistent(&mut |record| {
            if let PersistentRecord::Storage(r) = record {
                records.push(r);
            }
        });
        records
    }

    /// Embedded type definitions, in walk order.
    pub fn type_definitions(&self) -> Vec<&TypeDefinition> {
        let mut defs = Vec::new();
        self.graph.for_each_persistent(&mut |record| {
            if let PersistentRecord::Module(def) = record {
                defs.push(def);
            }
        });
        defs
    }
}

/// Reads the metadata segments from the front of `bytes`.
///
/// Anything after the key list is left unread; its offset is
/// `StreamHeader::metadata_len`.
///
/// # Errors
///
/// Returns `IncompatibleFormat` on a magic, version or system-info mismatch
/// and a serialization error if a segment cannot be decoded.
pub fn read_header(bytes: &[u8]) -> Result<StreamHeader> {
    let mut cursor = bytes;

    let magic: u128 = read_segment(&mut cursor, "magic number")?;
    if magic != MAGIC_NUMBER {
        return Err(EngineError::incompatible_format(format!(
            "invalid magic number: expected {MAGIC_NUMBER:#x}, got {magic:#x}"
        )));
    }

    let version: u16 = read_segment(&mut cursor, "protocol version")?;
    if version != PROTOCOL_VERSION {
        return Err(EngineError::incompatible_format(format!(
            "unsupported protocol version: expected {PROTOCOL_VERSION}, got {version}"
        )));
    }

    let sys_info: SysInfo = read_segment(&mut cursor, "system info")?;
    let native = SysInfo::native();
    if sys_info != native {
        return Err(EngineError::incompatible_format(format!(
            "checkpoint was produced by an incompatible build: {sys_info:?}, this build is {native:?}"
        )));
    }

    let graph: Node = read_segment(&mut cursor, "object graph")?;
    let keys: Vec<StorageKey> = read_segment(&mut cursor, "storage keys")?;

    Ok(StreamHeader {
        sys_info,
        graph,
        keys,
        metadata_len: bytes.len() - cursor.len(),
    })
}

fn read_segment<T: serde::de::DeserializeOwned>(cursor: &mut &[u8], what: &str) -> Result<T> {
    bincode::deserialize_from(cursor)
        .map_err(|e| EngineError::serialization(format!("failed to decode {what}: {e}")))
}

/// Rebuilds the object graph from a metadata stream and a buffer source.
///
/// # Errors
///
/// Returns `IncompatibleFormat` for a foreign stream, and `MissingStorage`
/// when a record names a key the stream does not list or the source cannot
/// supply its bytes.
pub fn deserialize(metadata: &[u8], source: &mut dyn BufferSource) -> Result<Value> {
    let header = read_header(metadata)?;
    restore(&header, source)
}

/// Rebuilds the object graph from a full checkpoint image: metadata stream
/// followed by its data section.
pub fn deserialize_image(image: Bytes) -> Result<Value> {
    let header = read_header(&image)?;
    let mut source = SectionSource::new(image.slice(header.metadata_len..));
    let value = restore(&header, &mut source)?;
    if source.remaining() != 0 {
        tracing::warn!(
            trailing_bytes = source.remaining(),
            "checkpoint image has bytes after its last storage"
        );
    }
    Ok(value)
}

/// Second phase shared by every entry point.
pub(crate) fn restore(header: &StreamHeader, source: &mut dyn BufferSource) -> Result<Value> {
    if header.keys.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(EngineError::incompatible_format(
            "storage key list is not strictly sorted",
        ));
    }

    // Describe each root from the first record that names it.
    let mut roots: BTreeMap<StorageKey, (DType, u64, Device)> = BTreeMap::new();
    for record in header.records() {
        roots
            .entry(record.key)
            .or_insert_with(|| (record.dtype.clone(), record.numel, record.location.clone()));
    }

    for key in roots.keys() {
        if header.keys.binary_search(key).is_err() {
            return Err(EngineError::missing_storage(
                key.0,
                "record names a storage absent from the key list",
            ));
        }
    }

    let mut storages: HashMap<StorageKey, Buffer> = HashMap::with_capacity(header.keys.len());
    for key in &header.keys {
        let (dtype, numel, device) = roots.get(key).cloned().ok_or_else(|| {
            EngineError::missing_storage(key.0, "key list names a storage no record describes")
        })?;
        let element_size = dtype
            .element_size()
            .ok_or_else(|| EngineError::unsupported_buffer_type(dtype.name()))?;
        let bytes = source.fetch(*key, numel, element_size)?;
        storages.insert(*key, Buffer::restored(bytes, dtype, device));
    }

    let mut rebuilder = Rebuilder {
        storages: &storages,
        views: HashMap::new(),
    };
    rebuilder.rebuild(&header.graph)
}

struct Rebuilder<'a> {
    storages: &'a HashMap<StorageKey, Buffer>,
    views: HashMap<String, Buffer>,
}

impl Rebuilder<'_> {
    fn rebuild(&mut self, node: &Node) -> Result<Value> {
        Ok(match node {
            Node::None => Value::None,
            Node::Bool(b) => Value::Bool(*b),
            Node::Int(i) => Value::Int(*i),
            Node::Float(f) => Value::Float(*f),
            Node::Str(s) => Value::Str(s.clone()),
            Node::Bytes(b) => Value::Bytes(b.clone()),
            Node::List(items) => Value::List(self.rebuild_all(items)?),
            Node::Tuple(items) => Value::Tuple(self.rebuild_all(items)?),
            Node::Dict(entries) => {
                let mut map: BTreeMap<Key, Value> = BTreeMap::new();
                for (key, node) in entries {
                    map.insert(key.clone(), self.rebuild(node)?);
                }
                Value::Dict(map)
            }
            Node::Type(marker) => Value::Type(marker.clone()),
            Node::Object { class, state } => Value::Object {
                class: self.class_marker(class)?,
                state: Box::new(self.rebuild(state)?),
            },
            Node::Persistent(PersistentRecord::Module(def)) => Value::Type(def.marker()),
            Node::Persistent(PersistentRecord::Storage(record)) => {
                Value::Buffer(self.buffer(record)?)
            }
        })
    }

    fn rebuild_all(&mut self, items: &[Node]) -> Result<Vec<Value>> {
        items.iter().map(|item| self.rebuild(item)).collect()
    }

    fn class_marker(&mut self, node: &Node) -> Result<TypeMarker> {
        match self.rebuild(node)? {
            Value::Type(marker) => Ok(marker),
            other => Err(EngineError::serialization(format!(
                "object class must be a type marker, found {other:?}"
            ))),
        }
    }

    fn buffer(&mut self, record: &StorageReferenceRecord) -> Result<Buffer> {
        let root = self.storages.get(&record.key).ok_or_else(|| {
            EngineError::missing_storage(record.key.0, "storage was not restored")
        })?;
        let root = if root.dtype() == &record.dtype {
            root.clone()
        } else {
            root.reinterpret(record.dtype.clone())
        };

        let Some(view) = &record.view else {
            return Ok(root);
        };
        if let Some(existing) = self.views.get(&view.view_key) {
            return Ok(existing.clone());
        }

        let offset = usize::try_from(view.offset).ok();
        let len = usize::try_from(view.byte_len).ok();
        let buffer = match (offset, len) {
            (Some(offset), Some(len)) => root.view(offset, len).map_err(|e| {
                EngineError::missing_storage(record.key.0, format!("view out of range: {e}"))
            })?,
            _ => {
                return Err(EngineError::missing_storage(
                    record.key.0,
                    "view range does not fit in memory",
                ))
            }
        };
        self.views.insert(view.view_key.clone(), buffer.clone());
        Ok(buffer)
    }
}
