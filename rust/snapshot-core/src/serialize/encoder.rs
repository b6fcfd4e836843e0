// rust/snapshot-core/src/serialize/encoder.rs

//! Graph encoder.

use crate::checkpoint::DataReference;
use crate::error::{EngineError, Result};
use crate::graph::Value;

use super::record::{Node, PersistentRecord, StorageKey, SysInfo, MAGIC_NUMBER, PROTOCOL_VERSION};
use super::table::StorageReferenceTable;

/// Externalization hook consulted before any node is encoded.
///
/// Returning a record replaces the node in the stream; returning `None`
/// lets the encoder fall back to its default encoding for that node.
pub trait PersistentIdHook {
    fn persistent_id(&mut self, value: &Value) -> Result<Option<PersistentRecord>>;
}

/// Walks a graph, asking `hook` about every node before encoding it.
pub struct Encoder<'h, H: PersistentIdHook> {
    hook: &'h mut H,
}

impl<'h, H: PersistentIdHook> Encoder<'h, H> {
    pub fn new(hook: &'h mut H) -> Self {
        Self { hook }
    }

    /// Encodes one node and everything below it.
    ///
    /// # Errors
    ///
    /// Propagates any error raised by the hook; encoding stops at the first one.
    pub fn encode(&mut self, value: &Value) -> Result<Node> {
        if let Some(record) = self.hook.persistent_id(value)? {
            return Ok(Node::Persistent(record));
        }

        Ok(match value {
            Value::None => Node::None,
            Value::Bool(b) => Node::Bool(*b),
            Value::Int(i) => Node::Int(*i),
            Value::Float(f) => Node::Float(*f),
            Value::Str(s) => Node::Str(s.clone()),
            Value::Bytes(b) => Node::Bytes(b.clone()),
            Value::List(items) => Node::List(self.encode_all(items)?),
            Value::Tuple(items) => Node::Tuple(self.encode_all(items)?),
            Value::Dict(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (key, value) in map {
                    entries.push((key.clone(), self.encode(value)?));
                }
                Node::Dict(entries)
            }
            Value::Type(marker) => Node::Type(marker.clone()),
            Value::Object { class, state } => Node::Object {
                class: Box::new(self.encode(&Value::Type(class.clone()))?),
                state: Box::new(self.encode(state)?),
            },
            Value::Buffer(buffer) => {
                // Buffers never have an inline form.
                return Err(EngineError::unsupported_buffer_type(buffer.dtype().name()));
            }
        })
    }

    fn encode_all(&mut self, items: &[Value]) -> Result<Vec<Node>> {
        items.iter().map(|item| self.encode(item)).collect()
    }
}

/// Serializes `value` into a metadata stream and the ordered list of
/// storages whose bytes follow it.
///
/// The returned references are in the same sorted-key order as the key list
/// that closes the metadata stream.
///
/// # Errors
///
/// Returns `UnsupportedBufferType` or `AliasConflict` from the storage table,
/// and a serialization error if the stream cannot be encoded.
pub fn serialize(value: &Value) -> Result<(Vec<u8>, Vec<DataReference>)> {
    let mut table = StorageReferenceTable::new();
    let graph = Encoder::new(&mut table).encode(value)?;
    let keys = table.sorted_keys();

    let metadata = write_stream(&graph, &keys)?;

    let references = table
        .storages()
        .map(|(key, root)| DataReference::from_root(key, root))
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(
        storages = references.len(),
        metadata_bytes = metadata.len(),
        "serialized object graph"
    );

    Ok((metadata, references))
}

/// Writes the five stream segments in order.
pub(crate) fn write_stream(graph: &Node, keys: &[StorageKey]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_segment(&mut out, &MAGIC_NUMBER, "magic number")?;
    write_segment(&mut out, &PROTOCOL_VERSION, "protocol version")?;
    write_segment(&mut out, &SysInfo::native(), "system info")?;
    write_segment(&mut out, graph, "object graph")?;
    write_segment(&mut out, keys, "storage keys")?;
    Ok(out)
}

fn write_segment<T: serde::Serialize + ?Sized>(out: &mut Vec<u8>, value: &T, what: &str) -> Result<()> {
    bincode::serialize_into(out, value)
        .map_err(|e| EngineError::serialization(format!("failed to encode {what}: {e}")))
}
