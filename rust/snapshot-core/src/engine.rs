// rust/snapshot-core/src/engine.rs

//! Save and load orchestration.
//!
//! This module provides the `SnapshotEngine` struct that ties together the
//! serializer, the metadata authority, the region writer and the durable
//! storage backend.
//!
//! # Example
//!
//! ```no_run
//! use snapshot_core::{Buffer, SnapshotEngine, Value};
//!
//! let engine = SnapshotEngine::from_config(Default::default()).unwrap();
//!
//! let state = Value::dict([("data", Value::Buffer(Buffer::from_f32(&[0.5; 100])))]);
//! engine.save(&state, "/ckpt/global_step10/model.pt").unwrap();
//!
//! let restored = engine.load("/ckpt/global_step10/model.pt").unwrap();
//! assert_eq!(restored, state);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;

use crate::authority::{HttpAuthority, MetadataAuthority};
use crate::checkpoint::{
    inspect, CheckpointLayout, CheckpointSummary, DurableReader, DurableWriter,
    ProcRegionLocator, ProcRegionWriter, RegionLocator, RegionWriter,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::graph::{Device, Value};
use crate::iteration::IterationTag;
use crate::serialize::{deserialize_image, serialize};
use crate::storage::{LocalStorage, StorageBackend};

const MIB: f64 = 1024.0 * 1024.0;

/// Where a load found its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    SharedMemory,
    Durable,
}

impl fmt::Display for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedMemory => f.write_str("shared memory"),
            Self::Durable => f.write_str("durable storage"),
        }
    }
}

/// Saves object graphs into shared-memory regions and loads them back.
///
/// The engine owns no checkpoint state of its own: records live with the
/// metadata authority, bytes live in regions or durable files. It is cheap to
/// clone and every clone talks to the same components.
#[derive(Clone)]
pub struct SnapshotEngine {
    config: EngineConfig,
    authority: Arc<dyn MetadataAuthority>,
    writer: Arc<dyn RegionWriter>,
    locator: Arc<dyn RegionLocator>,
    durable_writer: DurableWriter,
    durable_reader: DurableReader,
}

impl SnapshotEngine {
    /// Creates an engine from explicit components.
    pub fn new(
        config: EngineConfig,
        authority: Arc<dyn MetadataAuthority>,
        writer: Arc<dyn RegionWriter>,
        locator: Arc<dyn RegionLocator>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let durable_writer = DurableWriter::new(storage.clone(), config.durable.clone());
        let durable_reader = DurableReader::new(storage);
        Self {
            config,
            authority,
            writer,
            locator,
            durable_writer,
            durable_reader,
        }
    }

    /// Creates an engine that talks to the HTTP authority named in `config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` does not validate.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let authority = Arc::new(HttpAuthority::new(&config.authority));
        Self::with_authority(config, authority)
    }

    /// Creates an engine from a TOML file, with environment overrides applied
    /// after loading.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = EngineConfig::from_file(path)?.with_env_overrides();
        Self::from_config(config)
    }

    /// Creates an engine around `authority` with the procfs writer and
    /// locator and local durable storage.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` does not validate.
    pub fn with_authority(config: EngineConfig, authority: Arc<dyn MetadataAuthority>) -> Result<Self> {
        config.validate()?;
        let writer = Arc::new(ProcRegionWriter::new(&config.writer));
        // Non-atomic durable saves truncate files in place, which a mapped
        // read would observe.
        let storage = Arc::new(
            LocalStorage::new(&config.storage)
                .with_mmap(config.storage.use_mmap && config.durable.atomic_writes),
        );
        Ok(Self::new(
            config,
            authority,
            writer,
            Arc::new(ProcRegionLocator),
            storage,
        ))
    }

    /// Saves `value` into a fresh shared-memory region for `path`.
    ///
    /// The sequence is serialize, allocate, write, commit. The record is only
    /// committed once every byte is in the region; a failed write leaves it
    /// `PENDING`.
    ///
    /// # Errors
    ///
    /// Returns the serializer's errors, `EmptyCheckpoint`, authority errors
    /// from allocate or commit, and `WriterFailure` if the copy fails.
    pub fn save(&self, value: &Value, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let start = Instant::now();

        let layout = prepare(value, path)?;
        let iteration = IterationTag::extract(value, path);
        tracing::debug!(
            path = %path.display(),
            %iteration,
            total_size = layout.total_size,
            storages = layout.references.len(),
            "checkpoint laid out"
        );

        let allocation = self.authority.allocate(path, &iteration, layout.total_size)?;

        if let Err(e) = self.writer.write(path, &layout, &allocation.region) {
            tracing::error!(
                path = %path.display(),
                region = %allocation.region,
                error = %e,
                "shared-memory write failed, checkpoint left uncommitted"
            );
            return Err(as_writer_failure(path, e));
        }

        self.authority.commit(path)?;

        tracing::info!(
            "Saved {} ({:.2} MiB) to shared memory in {:.3}s",
            path.display(),
            layout.total_size as f64 / MIB,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Writes `value` straight to a durable file at `path`, bypassing the
    /// authority.
    ///
    /// # Errors
    ///
    /// Returns the serializer's errors, `EmptyCheckpoint`, and storage errors.
    pub fn save_durable(&self, value: &Value, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let start = Instant::now();

        let layout = prepare(value, path)?;
        self.durable_writer.write(path, &layout)?;

        tracing::info!(
            "Saved {} ({:.2} MiB) to durable storage in {:.3}s",
            path.display(),
            layout.total_size as f64 / MIB,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Runs [`save`](Self::save) on a new thread.
    ///
    /// The background save performs the same allocate, write, commit
    /// sequence; join it with [`SaveHandle::wait`] or [`wait_all`].
    ///
    /// # Errors
    ///
    /// Returns a writer error if the thread cannot be spawned.
    pub fn save_in_background(&self, value: Value, path: impl Into<PathBuf>) -> Result<SaveHandle> {
        let path = path.into();
        let engine = self.clone();
        let thread_path = path.clone();
        let handle = std::thread::Builder::new()
            .name("snapshot-save".to_string())
            .spawn(move || engine.save(&value, &thread_path))
            .map_err(|e| EngineError::writer_with_source(&path, "failed to spawn save thread", e))?;
        Ok(SaveHandle { path, handle })
    }

    /// Loads the checkpoint saved at `path`.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointUnavailable` if neither a live region nor a durable
    /// file exists, `AuthorityUnreachable` if the authority cannot be asked,
    /// and decoding errors otherwise.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Value> {
        self.load_mapped(path, None)
    }

    /// Loads the checkpoint at `path`, relabelling every buffer to `device`
    /// when one is given.
    pub fn load_mapped(&self, path: impl AsRef<Path>, device: Option<&Device>) -> Result<Value> {
        let path = path.as_ref();
        let start = Instant::now();

        let (image, source) = self.resolve(path)?;
        let size = image.len();
        let mut value = deserialize_image(image)?;
        if let Some(device) = device {
            value.map_devices(device);
        }

        tracing::info!(
            "Loaded {} ({:.2} MiB) from {} in {:.3}s",
            path.display(),
            size as f64 / MIB,
            source,
            start.elapsed().as_secs_f64()
        );
        Ok(value)
    }

    /// Summarizes the checkpoint at `path` from wherever a load would read it.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn inspect(&self, path: impl AsRef<Path>) -> Result<(CheckpointSummary, LoadSource)> {
        let (image, source) = self.resolve(path.as_ref())?;
        Ok((inspect(image)?, source))
    }

    /// Finds the bytes of `path`: a live, trusted region first, then the
    /// durable file.
    pub fn resolve(&self, path: &Path) -> Result<(Bytes, LoadSource)> {
        match self.authority.query(path) {
            Ok(status) if status.state.serves_fast_path() => {
                if let Some(bytes) = self.locator.locate(&status.region)? {
                    tracing::debug!(
                        path = %path.display(),
                        state = %status.state,
                        region = %status.region,
                        "loading from shared memory"
                    );
                    return Ok((bytes, LoadSource::SharedMemory));
                }
                tracing::debug!(
                    path = %path.display(),
                    region = %status.region,
                    "region no longer resolves"
                );
            }
            Ok(status) => {
                tracing::warn!(
                    path = %path.display(),
                    state = %status.state,
                    "authority reports an untrusted state, skipping shared memory"
                );
            }
            Err(e) if e.is_authority_rejection() => {
                tracing::debug!(path = %path.display(), error = %e, "no live region");
            }
            Err(e) => return Err(e),
        }

        match self.durable_reader.read(path)? {
            Some(bytes) => Ok((bytes, LoadSource::Durable)),
            None => Err(EngineError::unavailable(path)),
        }
    }

    /// Returns the current configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn authority(&self) -> &Arc<dyn MetadataAuthority> {
        &self.authority
    }
}

/// A save running on its own thread.
pub struct SaveHandle {
    path: PathBuf,
    handle: JoinHandle<Result<()>>,
}

impl SaveHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the save finishes and returns its result.
    pub fn wait(self) -> Result<()> {
        let Self { path, handle } = self;
        handle
            .join()
            .unwrap_or_else(|_| Err(EngineError::writer(path, "save thread panicked")))
    }
}

/// Joins every handle and returns the first failure, if any.
///
/// All handles are joined even after a failure.
pub fn wait_all(handles: impl IntoIterator<Item = SaveHandle>) -> Result<()> {
    let mut first_error = None;
    for handle in handles {
        if let Err(e) = handle.wait() {
            tracing::warn!(error = %e, "background save failed");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn prepare(value: &Value, path: &Path) -> Result<CheckpointLayout> {
    let (metadata, references) = serialize(value)?;
    CheckpointLayout::new(path, metadata, references)
}

fn as_writer_failure(path: &Path, error: EngineError) -> EngineError {
    match error {
        e @ EngineError::WriterFailure { .. } => e,
        other => EngineError::writer_with_source(path, "region writer failed", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{
        Allocation, CheckpointRecord, CheckpointState, RegionStatus, StateFilter,
    };
    use crate::checkpoint::RegionDescriptor;
    use crate::graph::Buffer;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Authority and region store in one, backed by plain vectors.
    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
        states: Mutex<HashMap<PathBuf, (CheckpointState, i32)>>,
        regions: Mutex<Vec<Vec<u8>>>,
        fail_writes: bool,
        unreachable: bool,
    }

    impl FakeBackend {
        fn state_of(&self, path: &str) -> Option<CheckpointState> {
            self.states.lock().get(Path::new(path)).map(|(state, _)| *state)
        }

        fn set_state(&self, path: &str, state: CheckpointState) {
            if let Some(entry) = self.states.lock().get_mut(Path::new(path)) {
                entry.0 = state;
            }
        }
    }

    impl MetadataAuthority for FakeBackend {
        fn allocate(&self, path: &Path, iteration: &IterationTag, size: u64) -> Result<Allocation> {
            self.calls.lock().push(format!("allocate {iteration} {size}"));
            let mut regions = self.regions.lock();
            let fd = regions.len() as i32;
            regions.push(vec![0; size as usize]);
            self.states
                .lock()
                .insert(path.to_path_buf(), (CheckpointState::Pending, fd));
            Ok(Allocation {
                state: CheckpointState::Pending,
                region: RegionDescriptor::new(1, fd),
            })
        }

        fn update(&self, path: &Path, state: CheckpointState) -> Result<()> {
            self.calls.lock().push(format!("update {state}"));
            let mut states = self.states.lock();
            let entry = states
                .get_mut(path)
                .ok_or_else(|| EngineError::authority(path, "unknown"))?;
            entry.0 = state;
            Ok(())
        }

        fn query(&self, path: &Path) -> Result<RegionStatus> {
            if self.unreachable {
                return Err(EngineError::authority_unreachable("connection refused"));
            }
            let (state, fd) = self
                .states
                .lock()
                .get(path)
                .copied()
                .ok_or_else(|| EngineError::authority(path, "unknown"))?;
            Ok(RegionStatus {
                state,
                region: RegionDescriptor::new(1, fd),
            })
        }

        fn list(&self, _filter: StateFilter) -> Result<Vec<CheckpointRecord>> {
            Ok(Vec::new())
        }
    }

    impl RegionWriter for FakeBackend {
        fn write(&self, path: &Path, layout: &CheckpointLayout, region: &RegionDescriptor) -> Result<()> {
            self.calls.lock().push("write".to_string());
            if self.fail_writes {
                return Err(EngineError::serialization("disk on fire"));
            }
            let mut regions = self.regions.lock();
            let dst = regions
                .get_mut(region.fd as usize)
                .ok_or_else(|| EngineError::writer(path, "no region"))?;
            let image = layout.to_image();
            if dst.len() != image.len() {
                return Err(EngineError::writer(path, "region size mismatch"));
            }
            dst.copy_from_slice(&image);
            Ok(())
        }
    }

    impl RegionLocator for FakeBackend {
        fn locate(&self, region: &RegionDescriptor) -> Result<Option<Bytes>> {
            Ok(self
                .regions
                .lock()
                .get(region.fd as usize)
                .map(|bytes| Bytes::from(bytes.clone())))
        }
    }

    fn create_test_engine(backend: FakeBackend) -> (SnapshotEngine, Arc<FakeBackend>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.storage.base_path = temp_dir.path().to_path_buf();

        let backend = Arc::new(backend);
        let storage = Arc::new(LocalStorage::new(&config.storage));
        let engine = SnapshotEngine::new(
            config,
            backend.clone(),
            backend.clone(),
            backend.clone(),
            storage,
        );
        (engine, backend, temp_dir)
    }

    fn sample_state() -> Value {
        Value::dict([
            ("iteration", Value::Int(12)),
            ("data", Value::Buffer(Buffer::from_f32(&[1.5; 100]))),
        ])
    }

    #[test]
    fn test_save_allocates_writes_then_commits() {
        let (engine, backend, _temp) = create_test_engine(FakeBackend::default());
        let state = sample_state();

        engine.save(&state, "ckpt.pt").unwrap();

        let calls = backend.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("allocate 12 "));
        assert_eq!(calls[1], "write");
        assert_eq!(calls[2], "update CACHED");
        assert_eq!(engine.load("ckpt.pt").unwrap(), state);
    }

    #[test]
    fn test_failed_write_is_not_committed() {
        let backend = FakeBackend {
            fail_writes: true,
            ..Default::default()
        };
        let (engine, backend, _temp) = create_test_engine(backend);

        let err = engine.save(&sample_state(), "ckpt.pt").unwrap_err();

        assert!(matches!(err, EngineError::WriterFailure { .. }));
        assert!(!backend.calls.lock().iter().any(|c| c.starts_with("update")));
        assert_eq!(backend.state_of("ckpt.pt"), Some(CheckpointState::Pending));
    }

    #[test]
    fn test_untrusted_state_falls_back_to_durable() {
        let (engine, backend, _temp) = create_test_engine(FakeBackend::default());
        let state = sample_state();

        engine.save(&state, "ckpt.pt").unwrap();
        engine.save_durable(&state, "ckpt.pt").unwrap();
        backend.set_state("ckpt.pt", CheckpointState::Broken);

        let (_, source) = engine.resolve(Path::new("ckpt.pt")).unwrap();
        assert_eq!(source, LoadSource::Durable);
        assert_eq!(engine.load("ckpt.pt").unwrap(), state);
    }

    #[test]
    fn test_rejection_then_missing_file_is_unavailable() {
        let (engine, _backend, _temp) = create_test_engine(FakeBackend::default());

        let err = engine.load("never-saved.pt").unwrap_err();
        assert!(matches!(err, EngineError::CheckpointUnavailable { .. }));
    }

    #[test]
    fn test_unreachable_authority_surfaces() {
        let backend = FakeBackend {
            unreachable: true,
            ..Default::default()
        };
        let (engine, _backend, _temp) = create_test_engine(backend);
        engine.save_durable(&sample_state(), "ckpt.pt").unwrap();

        let err = engine.load("ckpt.pt").unwrap_err();
        assert!(matches!(err, EngineError::AuthorityUnreachable { .. }));
    }

    #[test]
    fn test_load_mapped_relabels_devices() {
        let (engine, _backend, _temp) = create_test_engine(FakeBackend::default());
        engine.save(&sample_state(), "ckpt.pt").unwrap();

        let device = Device::new("cuda:1");
        let restored = engine.load_mapped("ckpt.pt", Some(&device)).unwrap();

        let data = restored.get("data").and_then(Value::as_buffer).unwrap();
        assert_eq!(data.device(), &device);
    }

    #[test]
    fn test_background_saves() {
        let (engine, backend, _temp) = create_test_engine(FakeBackend::default());

        let handles: Vec<SaveHandle> = (0..4)
            .map(|i| {
                engine
                    .save_in_background(sample_state(), format!("ckpt-{i}.pt"))
                    .unwrap()
            })
            .collect();
        wait_all(handles).unwrap();

        let commits = backend
            .calls
            .lock()
            .iter()
            .filter(|c| c.as_str() == "update CACHED")
            .count();
        assert_eq!(commits, 4);
        assert!(engine.load("ckpt-3.pt").is_ok());
    }

    #[test]
    fn test_wait_all_reports_failure() {
        let backend = FakeBackend {
            fail_writes: true,
            ..Default::default()
        };
        let (engine, _backend, _temp) = create_test_engine(backend);

        let handle = engine.save_in_background(sample_state(), "a.pt").unwrap();
        assert_eq!(handle.path(), Path::new("a.pt"));
        assert!(wait_all([handle]).is_err());
    }

    #[test]
    fn test_inspect_reports_source() {
        let (engine, _backend, _temp) = create_test_engine(FakeBackend::default());
        engine.save(&sample_state(), "ckpt.pt").unwrap();

        let (summary, source) = engine.inspect("ckpt.pt").unwrap();
        assert_eq!(source, LoadSource::SharedMemory);
        assert_eq!(summary.storages.len(), 1);
        assert_eq!(summary.data_bytes(), 400);
    }
}
