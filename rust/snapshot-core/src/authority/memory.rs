// rust/snapshot-core/src/authority/memory.rs

//! In-process metadata authority backed by memfd regions.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::checkpoint::region::create_memfd;
use crate::checkpoint::RegionDescriptor;
use crate::error::{EngineError, Result};
use crate::iteration::IterationTag;

use super::state::{Allocation, CheckpointRecord, CheckpointState, RegionStatus, StateFilter};
use super::MetadataAuthority;

struct RecordEntry {
    file: Option<File>,
    iteration: String,
    state: CheckpointState,
    size: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RecordEntry {
    fn region(&self) -> Option<RegionDescriptor> {
        self.file
            .as_ref()
            .map(|file| RegionDescriptor::new(std::process::id(), file.as_raw_fd()))
    }

    fn to_record(&self, path: &Path) -> CheckpointRecord {
        CheckpointRecord {
            path: path.to_path_buf(),
            iteration: self.iteration.clone(),
            state: self.state,
            size: self.size,
            region: self.region(),
            updated_at: Some(self.updated_at),
        }
    }
}

/// Metadata authority that lives inside the saving process.
///
/// Regions are memfd files owned by this struct and published as
/// `/proc/<own pid>/fd/<fd>`, so they stay readable for as long as the
/// authority is alive. Records follow the same rules as the external
/// service: queries only succeed for committed records with a live region.
#[derive(Default)]
pub struct InProcessAuthority {
    records: RwLock<HashMap<PathBuf, RecordEntry>>,
}

impl InProcessAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves a record to any state, as a backup or persistence agent would.
    ///
    /// # Errors
    ///
    /// Returns `Authority` if no record exists for `path`.
    pub fn transition(&self, path: &Path, state: CheckpointState) -> Result<()> {
        let mut records = self.records.write();
        let entry = records
            .get_mut(path)
            .ok_or_else(|| EngineError::authority(path, "no metadata for checkpoint"))?;
        tracing::debug!(
            path = %path.display(),
            from = %entry.state,
            to = %state,
            "checkpoint state transition"
        );
        entry.state = state;
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Closes the region of `path`, keeping its record.
    ///
    /// Returns whether a region was open.
    pub fn release(&self, path: &Path) -> bool {
        let mut records = self.records.write();
        match records.get_mut(path) {
            Some(entry) => {
                entry.updated_at = Utc::now();
                entry.file.take().is_some()
            }
            None => false,
        }
    }

    /// Creation time of the record for `path`.
    pub fn created_at(&self, path: &Path) -> Option<DateTime<Utc>> {
        self.records.read().get(path).map(|entry| entry.created_at)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl MetadataAuthority for InProcessAuthority {
    fn allocate(&self, path: &Path, iteration: &IterationTag, size: u64) -> Result<Allocation> {
        let mut records = self.records.write();
        let now = Utc::now();

        let reused = match records.get_mut(path) {
            Some(entry) => match &entry.file {
                Some(file) => {
                    file.set_len(size).map_err(|e| {
                        EngineError::authority(path, format!("failed to resize region: {e}"))
                    })?;
                    entry.iteration = iteration.to_string();
                    entry.state = CheckpointState::Pending;
                    entry.size = size;
                    entry.updated_at = now;
                    entry.region()
                }
                None => None,
            },
            None => None,
        };

        let region = match reused {
            Some(region) => {
                tracing::debug!(path = %path.display(), %region, size, "reusing region");
                region
            }
            None => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "checkpoint".to_string());
                let file = create_memfd(&name, size).map_err(|e| {
                    EngineError::authority(path, format!("memfd allocation failed: {e}"))
                })?;
                let created_at = records.get(path).map_or(now, |entry| entry.created_at);
                let entry = RecordEntry {
                    file: Some(file),
                    iteration: iteration.to_string(),
                    state: CheckpointState::Pending,
                    size,
                    created_at,
                    updated_at: now,
                };
                let region = entry
                    .region()
                    .ok_or_else(|| EngineError::authority(path, "region vanished"))?;
                records.insert(path.to_path_buf(), entry);
                tracing::debug!(path = %path.display(), %region, size, "created region");
                region
            }
        };

        Ok(Allocation {
            state: CheckpointState::Pending,
            region,
        })
    }

    fn update(&self, path: &Path, state: CheckpointState) -> Result<()> {
        self.transition(path, state)
    }

    fn query(&self, path: &Path) -> Result<RegionStatus> {
        let records = self.records.read();
        let entry = records
            .get(path)
            .ok_or_else(|| EngineError::authority(path, "no metadata for checkpoint"))?;
        if !entry.state.serves_fast_path() {
            return Err(EngineError::authority(
                path,
                format!("checkpoint state is {}", entry.state),
            ));
        }
        let region = entry
            .region()
            .ok_or_else(|| EngineError::authority(path, "in-memory checkpoint does not exist"))?;
        Ok(RegionStatus {
            state: entry.state,
            region,
        })
    }

    fn list(&self, filter: StateFilter) -> Result<Vec<CheckpointRecord>> {
        let records = self.records.read();
        let mut listed: Vec<CheckpointRecord> = records
            .iter()
            .filter(|(_, entry)| filter.matches(entry.state))
            .map(|(path, entry)| entry.to_record(path))
            .collect();
        listed.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listed)
    }
}
