// rust/snapshot-core/src/serialize/record.rs

//! Wire records of the metadata stream.
//!
//! The stream is a sequence of bincode-encoded segments:
//! ```text
//! +----------------------+
//! | Magic (u128)         |
//! +----------------------+
//! | Protocol version     |
//! +----------------------+
//! | SysInfo              |
//! +----------------------+
//! | Graph (Node tree)    |  <- buffers replaced by StorageReferenceRecords
//! +----------------------+
//! | Sorted storage keys  |
//! +----------------------+
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::graph::{DType, Device, Key, TypeMarker};

/// Magic number opening every metadata stream.
pub const MAGIC_NUMBER: u128 = 0x1950a86a20f9469cfc6c;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1001;

/// Width of the element-count word preceding each storage in the data section.
pub const LENGTH_WORD_SIZE: usize = std::mem::size_of::<u64>();

/// Stable key naming one root allocation inside a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageKey(pub u64);

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Producer properties a consumer must match byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysInfo {
    pub protocol_version: u16,
    pub little_endian: bool,
    pub type_sizes: TypeSizes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSizes {
    pub short: u8,
    pub int: u8,
    pub long: u8,
}

impl SysInfo {
    /// Properties of the running build.
    pub fn native() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            little_endian: cfg!(target_endian = "little"),
            type_sizes: TypeSizes {
                short: std::mem::size_of::<i16>() as u8,
                int: std::mem::size_of::<i32>() as u8,
                long: std::mem::size_of::<i64>() as u8,
            },
        }
    }
}

/// Byte range of a view inside its root storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMetadata {
    /// Identifies the view; references with one view key restore as one buffer.
    pub view_key: String,
    pub offset: u64,
    pub byte_len: u64,
}

/// Stand-in for a buffer inside the metadata stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageReferenceRecord {
    pub key: StorageKey,
    pub dtype: DType,
    pub location: Device,
    /// Element count of the root storage.
    pub numel: u64,
    pub view: Option<ViewMetadata>,
}

/// Embedded definition of a structured type, emitted once per type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub name: String,
    pub source_file: Option<PathBuf>,
    pub source: Option<String>,
}

impl TypeDefinition {
    pub fn marker(&self) -> TypeMarker {
        TypeMarker {
            name: self.name.clone(),
            source_file: self.source_file.clone(),
        }
    }
}

/// Symbolic record returned by an externalization hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistentRecord {
    Storage(StorageReferenceRecord),
    Module(TypeDefinition),
}

/// Encoded graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Node>),
    Tuple(Vec<Node>),
    Dict(Vec<(Key, Node)>),
    Type(TypeMarker),
    Object { class: Box<Node>, state: Box<Node> },
    Persistent(PersistentRecord),
}

impl Node {
    /// Calls `f` for every persistent record in the tree, depth first.
    pub fn for_each_persistent<'a>(&'a self, f: &mut impl FnMut(&'a PersistentRecord)) {
        match self {
            Self::Persistent(record) => f(record),
            Self::List(items) | Self::Tuple(items) => {
                for item in items {
                    item.for_each_persistent(f);
                }
            }
            Self::Dict(entries) => {
                for (_, node) in entries {
                    node.for_each_persistent(f);
                }
            }
            Self::Object { class, state } => {
                class.for_each_persistent(f);
                state.for_each_persistent(f);
            }
            _ => {}
        }
    }
}
