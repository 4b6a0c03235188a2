use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;

/// Separator between the id components in a snapshot directory name.
const SNAPSHOT_ID_BREAK: char = '-';

/// Configuration for one partition's snapshot subsystem.
///
/// All snapshot state of a partition lives under `root_dir`; see
/// [`crate::fs::Layout`] for the directory structure derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Partition this subsystem instance belongs to. Used as the metric label.
    pub partition_id: u32,
    /// Root directory for runtime state, committed snapshots, and staging.
    pub root_dir: PathBuf,
}

impl SnapshotConfig {
    pub fn new(partition_id: u32, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            partition_id,
            root_dir: root_dir.into(),
        }
    }
}

/// Identity of a snapshot: the raft log position it covers.
///
/// Ids are totally ordered by `(index, term, position)`; a newer snapshot
/// compares greater than an older one. The display form
/// `{index}-{term}-{position}` is also the snapshot's directory name on disk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SnapshotId {
    /// Raft log index of the last entry covered by the snapshot.
    pub index: u64,
    /// Term of that entry.
    pub term: u64,
    /// Processed record position the snapshot was taken at.
    pub position: u64,
}

impl SnapshotId {
    pub fn new(index: u64, term: u64, position: u64) -> Self {
        Self {
            index,
            term,
            position,
        }
    }

    /// Highest log index that may be compacted away once this snapshot is
    /// committed.
    pub fn compaction_bound(&self) -> u64 {
        self.index
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{index}{sep}{term}{sep}{position}",
            index = self.index,
            sep = SNAPSHOT_ID_BREAK,
            term = self.term,
            position = self.position
        )
    }
}

impl FromStr for SnapshotId {
    type Err = SnapshotError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.split(SNAPSHOT_ID_BREAK);

        let index = parts
            .next()
            .and_then(|part| part.parse::<u64>().ok())
            .ok_or_else(|| SnapshotError::InvalidSnapshotId(raw.to_string()))?;
        let term = parts
            .next()
            .and_then(|part| part.parse::<u64>().ok())
            .ok_or_else(|| SnapshotError::InvalidSnapshotId(raw.to_string()))?;
        let position = parts
            .next()
            .and_then(|part| part.parse::<u64>().ok())
            .ok_or_else(|| SnapshotError::InvalidSnapshotId(raw.to_string()))?;

        if parts.next().is_some() {
            return Err(SnapshotError::InvalidSnapshotId(raw.to_string()));
        }

        Ok(SnapshotId {
            index,
            term,
            position,
        })
    }
}
