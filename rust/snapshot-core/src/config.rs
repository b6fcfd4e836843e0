// rust/snapshot-core/src/config.rs

//! Configuration management for the snapshot engine.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Default port the metadata authority listens on.
pub const DEFAULT_AUTHORITY_PORT: u16 = 20002;

/// Legacy variable that overrides only the authority port.
pub const AUTHORITY_PORT_ENV: &str = "CKPT_ENGINE_HTTP_PORT";

// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub authority: AuthorityConfig,
    pub writer: WriterConfig,
    pub storage: StorageConfig,
    pub durable: DurableConfig,
}

/// Metadata authority connection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Base URL of the authority, e.g. `http://localhost:20002`.
    pub url: String,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whole-request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

// Region writer options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    // Threads used to copy a single buffer into the region.
    pub copy_threads: usize,
    // Buffers smaller than this are copied on the calling thread.
    pub parallel_threshold: usize,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Base path that relative checkpoint paths resolve against.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped I/O for durable reads.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

// Durable (non shared-memory) save options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableConfig {
    // Whether to use atomic writes (write to temp then rename).
    pub atomic_writes: bool,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            url: format!("http://localhost:{DEFAULT_AUTHORITY_PORT}"),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            copy_threads: 4,
            parallel_threshold: 4 * 1024 * 1024, // 4 MB
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            atomic_writes: true,
        }
    }
}

impl FromStr for EngineConfig {
    type Err = EngineError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| EngineError::config_with_source("failed to parse TOML config", e))
    }
}

impl EngineConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `SNAPSHOT_` and use underscores
    // to separate nested fields. For example:
    // - `SNAPSHOT_AUTHORITY_URL` overrides `authority.url`
    // - `SNAPSHOT_WRITER_COPY_THREADS` overrides `writer.copy_threads`
    // - `SNAPSHOT_STORAGE_BASE_PATH` overrides `storage.base_path`
    //
    // `CKPT_ENGINE_HTTP_PORT` replaces the port of `authority.url` and is
    // applied before `SNAPSHOT_AUTHORITY_URL`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Authority overrides
        if let Ok(val) = std::env::var(AUTHORITY_PORT_ENV) {
            if let Ok(port) = val.parse::<u16>() {
                self.authority.url = replace_port(&self.authority.url, port);
            }
        }
        if let Ok(val) = std::env::var("SNAPSHOT_AUTHORITY_URL") {
            self.authority.url = val;
        }
        if let Ok(val) = std::env::var("SNAPSHOT_AUTHORITY_CONNECT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.authority.connect_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SNAPSHOT_AUTHORITY_REQUEST_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.authority.request_timeout_ms = v;
            }
        }

        // Writer overrides
        if let Ok(val) = std::env::var("SNAPSHOT_WRITER_COPY_THREADS") {
            if let Ok(v) = val.parse() {
                self.writer.copy_threads = v;
            }
        }
        if let Ok(val) = std::env::var("SNAPSHOT_WRITER_PARALLEL_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.writer.parallel_threshold = v;
            }
        }

        // Storage overrides
        if let Ok(val) = std::env::var("SNAPSHOT_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SNAPSHOT_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("SNAPSHOT_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("SNAPSHOT_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }

        // Durable overrides
        if let Ok(val) = std::env::var("SNAPSHOT_DURABLE_ATOMIC_WRITES") {
            if let Ok(v) = val.parse() {
                self.durable.atomic_writes = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Authority validation
        if self.authority.url.is_empty() {
            return Err(EngineError::config("authority.url must not be empty"));
        }
        if !self.authority.url.starts_with("http://") {
            return Err(EngineError::config(
                "authority.url must use the http:// scheme",
            ));
        }
        if self.authority.connect_timeout_ms == 0 {
            return Err(EngineError::config(
                "authority.connect_timeout_ms must be greater than 0",
            ));
        }
        if self.authority.request_timeout_ms == 0 {
            return Err(EngineError::config(
                "authority.request_timeout_ms must be greater than 0",
            ));
        }

        // Writer validation
        if self.writer.copy_threads == 0 {
            return Err(EngineError::config(
                "writer.copy_threads must be greater than 0",
            ));
        }

        // Storage validation
        if self.storage.buffer_size == 0 {
            return Err(EngineError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Replaces (or appends) the port in an `http://host[:port][/path]` URL.
fn replace_port(url: &str, port: u16) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", url),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    let host = match authority.rsplit_once(':') {
        Some((host, maybe_port)) if maybe_port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    format!("{scheme}://{host}:{port}{path}")
}
