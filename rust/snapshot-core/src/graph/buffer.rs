// rust/snapshot-core/src/graph/buffer.rs

//! Tensor storage buffers.
//!
//! A [`Buffer`] is a typed window onto an immutable root allocation. Cloning
//! a buffer or taking a [`Buffer::view`] of it keeps the root's identity, so
//! the serializer can tell aliased tensors apart from independent ones
//! without comparing contents.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a root allocation.
///
/// Identities are handed out once per allocation and never reused within a
/// process, so two buffers with the same id always share memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw handle value, used as the storage key in the metadata stream.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Element type of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
    /// An element type the engine has no width for.
    Opaque(String),
}

impl DType {
    /// Size of one element in bytes, or `None` for opaque types.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            Self::Bool | Self::U8 | Self::I8 => Some(1),
            Self::I16 | Self::F16 | Self::BF16 => Some(2),
            Self::I32 | Self::F32 => Some(4),
            Self::I64 | Self::F64 => Some(8),
            Self::Opaque(_) => None,
        }
    }

    /// Short tag used in diagnostics and in the CLI.
    pub fn name(&self) -> &str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "uint8",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::Opaque(name) => name,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Device / location tag recorded alongside each storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device(String);

impl Device {
    pub fn cpu() -> Self {
        Self("cpu".to_string())
    }

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed, immutable view onto a root allocation.
#[derive(Clone)]
pub struct Buffer {
    root_id: BufferId,
    root: Bytes,
    offset: usize,
    len: usize,
    dtype: DType,
    device: Device,
}

impl Buffer {
    /// Creates a new root allocation with a fresh identity.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the byte length is not a multiple of
    /// the element size.
    pub fn new(data: impl Into<Bytes>, dtype: DType, device: Device) -> Result<Self> {
        let root: Bytes = data.into();
        if let Some(size) = dtype.element_size() {
            if root.len() % size != 0 {
                return Err(EngineError::serialization(format!(
                    "buffer of {} bytes is not a whole number of {} elements",
                    root.len(),
                    dtype
                )));
            }
        }
        let len = root.len();
        Ok(Self {
            root_id: BufferId::next(),
            root,
            offset: 0,
            len,
            dtype,
            device,
        })
    }

    /// Creates a CPU `float32` buffer from a slice of values.
    pub fn from_f32(values: &[f32]) -> Self {
        let mut raw = Vec::with_capacity(values.len() * 4);
        for v in values {
            raw.extend_from_slice(&v.to_ne_bytes());
        }
        Self {
            root_id: BufferId::next(),
            len: raw.len(),
            root: Bytes::from(raw),
            offset: 0,
            dtype: DType::F32,
            device: Device::cpu(),
        }
    }

    /// Returns a view of `len` bytes starting `offset` bytes into this view.
    ///
    /// The view shares this buffer's root identity and memory.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the range falls outside this view or
    /// is not aligned to the element size.
    pub fn view(&self, offset: usize, len: usize) -> Result<Self> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.len)
            .ok_or_else(|| {
                EngineError::serialization(format!(
                    "view {}..{} exceeds buffer of {} bytes",
                    offset,
                    offset.saturating_add(len),
                    self.len
                ))
            })?;
        if let Some(size) = self.dtype.element_size() {
            if offset % size != 0 || len % size != 0 {
                return Err(EngineError::serialization(format!(
                    "view {offset}..{end} is not aligned to {} elements",
                    self.dtype
                )));
            }
        }
        Ok(Self {
            root_id: self.root_id,
            root: self.root.clone(),
            offset: self.offset + offset,
            len,
            dtype: self.dtype.clone(),
            device: self.device.clone(),
        })
    }

    /// Returns the same memory interpreted as a different element type.
    pub fn reinterpret(&self, dtype: DType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }

    /// Rebuilds a buffer around bytes that were read back from a checkpoint.
    pub(crate) fn restored(root: Bytes, dtype: DType, device: Device) -> Self {
        let len = root.len();
        Self {
            root_id: BufferId::next(),
            root,
            offset: 0,
            len,
            dtype,
            device,
        }
    }

    /// The whole root allocation, typed like this view.
    pub fn root(&self) -> Self {
        Self {
            offset: 0,
            len: self.root.len(),
            ..self.clone()
        }
    }

    pub fn root_id(&self) -> BufferId {
        self.root_id
    }

    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn set_device(&mut self, device: Device) {
        self.device = device;
    }

    /// Byte offset of this view within its root allocation.
    pub fn byte_offset(&self) -> usize {
        self.offset
    }

    /// Length of this view in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements in this view, if the element type has a width.
    pub fn numel(&self) -> Option<usize> {
        self.dtype.element_size().map(|size| self.len / size)
    }

    /// True if this buffer covers its whole root allocation.
    pub fn is_root(&self) -> bool {
        self.offset == 0 && self.len == self.root.len()
    }

    /// True if both buffers share one root allocation.
    pub fn shares_storage(&self, other: &Buffer) -> bool {
        self.root_id == other.root_id
    }

    /// Bytes of this view.
    pub fn as_bytes(&self) -> &[u8] {
        &self.root[self.offset..self.offset + self.len]
    }

    /// Bytes of the whole root allocation.
    pub fn root_bytes(&self) -> &Bytes {
        &self.root
    }

    /// Decodes the view as native-endian `f32` values.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.dtype != DType::F32 {
            return None;
        }
        Some(
            self.as_bytes()
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

impl PartialEq for Buffer {
    /// Buffers compare by type, device and content, not by identity.
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype && self.device == other.device && self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("root_id", &self.root_id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish()
    }
}
