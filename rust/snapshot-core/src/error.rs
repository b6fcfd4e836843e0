// rust/snapshot-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {

    #[error("Cannot save multiple tensors or storages that view the same data as different types (storage {key}: {existing} vs {requested})")]
    AliasConflict {
        key: u64,
        existing: String,
        requested: String,
    },

    #[error("Unsupported buffer type '{dtype}'")]
    UnsupportedBufferType {
        dtype: String,
    },

    #[error("Checkpoint '{path}' has zero total size")]
    EmptyCheckpoint {
        path: PathBuf,
    },

    #[error("Metadata authority rejected request for '{path}': {message}")]
    Authority {
        path: PathBuf,
        message: String,
    },

    #[error("Metadata authority unreachable: {message}")]
    AuthorityUnreachable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Write shared memory failed for '{path}': {message}")]
    WriterFailure {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Incompatible checkpoint format: {message}")]
    IncompatibleFormat {
        message: String,
    },

    #[error("Missing storage '{key}': {message}")]
    MissingStorage {
        key: u64,
        message: String,
    },

    #[error("Checkpoint '{path}' is unavailable in shared memory and on durable storage")]
    CheckpointUnavailable {
        path: PathBuf,
    },

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

// Convenience constructors
impl EngineError {

    pub fn alias_conflict(key: u64, existing: impl Into<String>, requested: impl Into<String>) -> Self {
        Self::AliasConflict {
            key,
            existing: existing.into(),
            requested: requested.into(),
        }
    }

    pub fn unsupported_buffer_type(dtype: impl Into<String>) -> Self {
        Self::UnsupportedBufferType { dtype: dtype.into() }
    }

    pub fn empty_checkpoint(path: impl Into<PathBuf>) -> Self {
        Self::EmptyCheckpoint { path: path.into() }
    }

    pub fn authority(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Authority {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn authority_unreachable(message: impl Into<String>) -> Self {
        Self::AuthorityUnreachable {
            message: message.into(),
            source: None,
        }
    }

    pub fn authority_unreachable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::AuthorityUnreachable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn writer(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::WriterFailure {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn writer_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::WriterFailure {
            path: path.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn incompatible_format(message: impl Into<String>) -> Self {
        Self::IncompatibleFormat {
            message: message.into(),
        }
    }

    pub fn missing_storage(key: u64, message: impl Into<String>) -> Self {
        Self::MissingStorage {
            key,
            message: message.into(),
        }
    }

    pub fn unavailable(path: impl Into<PathBuf>) -> Self {
        Self::CheckpointUnavailable { path: path.into() }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if the authority answered but refused the request.
    ///
    /// The load path treats a refusal as "no live region" and moves on to
    /// the durable copy; an unreachable authority is surfaced instead.
    pub fn is_authority_rejection(&self) -> bool {
        matches!(self, Self::Authority { .. })
    }
}
