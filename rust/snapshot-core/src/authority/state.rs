// rust/snapshot-core/src/authority/state.rs

//! Checkpoint state machine types shared by every authority.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::RegionDescriptor;
use crate::error::{EngineError, Result};

/// Durability state of one checkpoint record.
///
/// The engine moves a record from `Pending` to `Cached`; every later
/// transition belongs to the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum CheckpointState {
    Pending = 0,
    Cached = 1,
    BackedUp = 2,
    Persistent = 3,
    Broken = 4,
    Obsolescent = 5,
}

impl CheckpointState {
    pub const ALL: [CheckpointState; 6] = [
        Self::Pending,
        Self::Cached,
        Self::BackedUp,
        Self::Persistent,
        Self::Broken,
        Self::Obsolescent,
    ];

    /// Whether a load may read the shared-memory copy of a record in this state.
    pub fn serves_fast_path(self) -> bool {
        matches!(self, Self::Cached | Self::BackedUp | Self::Persistent)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Cached => "CACHED",
            Self::BackedUp => "BACKED_UP",
            Self::Persistent => "PERSISTENT",
            Self::Broken => "BROKEN",
            Self::Obsolescent => "OBSOLESCENT",
        }
    }

    /// Parses a state name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.name().eq_ignore_ascii_case(name))
    }
}

impl From<CheckpointState> for i32 {
    fn from(state: CheckpointState) -> Self {
        state as i32
    }
}

impl TryFrom<i32> for CheckpointState {
    type Error = EngineError;

    fn try_from(value: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| *state as i32 == value)
            .ok_or_else(|| EngineError::serialization(format!("unknown checkpoint state {value}")))
    }
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State selector for listing queries. `Any` is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateFilter {
    #[default]
    Any,
    Only(CheckpointState),
}

impl StateFilter {
    /// Wire value of the wildcard.
    pub const ANY_WIRE: i32 = 99;

    pub fn matches(self, state: CheckpointState) -> bool {
        match self {
            Self::Any => true,
            Self::Only(wanted) => wanted == state,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::Any => Self::ANY_WIRE,
            Self::Only(state) => state.into(),
        }
    }
}

/// Answer to an allocation request: a fresh PENDING record and its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub state: CheckpointState,
    pub region: RegionDescriptor,
}

/// Current state of a checkpoint and where its region lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionStatus {
    pub state: CheckpointState,
    pub region: RegionDescriptor,
}

/// One record as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub path: PathBuf,
    pub iteration: String,
    pub state: CheckpointState,
    pub size: u64,
    pub region: Option<RegionDescriptor>,
    pub updated_at: Option<DateTime<Utc>>,
}
