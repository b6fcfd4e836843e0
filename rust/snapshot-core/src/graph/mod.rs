// rust/snapshot-core/src/graph/mod.rs

//! In-memory object graph handed to the engine for checkpointing.
//!
//! A graph is a tree of [`Value`]s: scalars, sequences, keyed mappings,
//! class markers and [`Buffer`] references. Buffers are the only nodes whose
//! payload leaves the metadata stream; everything else is encoded inline.

mod buffer;

pub use buffer::{Buffer, BufferId, DType, Device};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Key of a mapping entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Marker for a structured record type (for example a model class).
///
/// The first occurrence of a type in a checkpoint embeds the text of
/// `source_file` so a loader can check the definition it is restoring into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeMarker {
    pub name: String,
    pub source_file: Option<PathBuf>,
}

impl TypeMarker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_file: None,
        }
    }

    pub fn with_source(name: impl Into<String>, source_file: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_file: Some(source_file.into()),
        }
    }
}

/// One node of an object graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(BTreeMap<Key, Value>),
    Buffer(Buffer),
    Type(TypeMarker),
    /// An instance of a structured type together with its state.
    Object {
        class: TypeMarker,
        state: Box<Value>,
    },
}

impl Value {
    /// Builds a mapping from `(key, value)` pairs.
    pub fn dict<K, I>(entries: I) -> Self
    where
        K: Into<Key>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Dict(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Looks up a mapping entry; `None` for non-mappings and missing keys.
    pub fn get(&self, key: impl Into<Key>) -> Option<&Value> {
        match self {
            Self::Dict(map) => map.get(&key.into()),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Calls `f` for every buffer reachable from this node, depth first.
    pub fn for_each_buffer<'a>(&'a self, f: &mut impl FnMut(&'a Buffer)) {
        match self {
            Self::Buffer(buffer) => f(buffer),
            Self::List(items) | Self::Tuple(items) => {
                for item in items {
                    item.for_each_buffer(f);
                }
            }
            Self::Dict(map) => {
                for value in map.values() {
                    value.for_each_buffer(f);
                }
            }
            Self::Object { state, .. } => state.for_each_buffer(f),
            _ => {}
        }
    }

    /// Rewrites the device tag of every buffer in the graph.
    pub fn map_devices(&mut self, device: &Device) {
        match self {
            Self::Buffer(buffer) => buffer.set_device(device.clone()),
            Self::List(items) | Self::Tuple(items) => {
                for item in items {
                    item.map_devices(device);
                }
            }
            Self::Dict(map) => {
                for value in map.values_mut() {
                    value.map_devices(device);
                }
            }
            Self::Object { state, .. } => state.map_devices(device),
            _ => {}
        }
    }
}

impl From<Buffer> for Value {
    fn from(buffer: Buffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}
