use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, error, trace, warn};

use crate::chunk::{combined_checksum_of_dir, crc64, SnapshotChunk};
use crate::config::SnapshotId;
use crate::error::{SnapshotError, SnapshotResult};
use crate::fs::remove_dir_recursive;
use crate::store::{Snapshot, SnapshotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransientState {
    Open,
    Committed,
    Aborted,
}

impl fmt::Display for TransientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientState::Open => write!(f, "open"),
            TransientState::Committed => write!(f, "committed"),
            TransientState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Write-side handle to a pending snapshot.
///
/// A transient is populated either by a database checkpoint ([`Self::take`],
/// sender side) or by replicated chunks ([`Self::write`], receiver side), and
/// then promoted with [`Self::commit`] or discarded with [`Self::abort`].
/// Staging is never visible to readers; promotion is a single atomic rename
/// performed by the store.
///
/// Once committed or aborted the handle rejects further operations.
pub struct TransientSnapshot {
    store: SnapshotStore,
    id: SnapshotId,
    path: PathBuf,
    state: TransientState,
    expected_checksum: Option<u64>,
}

impl TransientSnapshot {
    pub(crate) fn create(store: SnapshotStore, id: SnapshotId) -> SnapshotResult<Self> {
        let path = store.layout().pending_path(&id);
        fs::create_dir_all(&path)?;
        Ok(Self {
            store,
            id,
            path,
            state: TransientState::Open,
            expected_checksum: None,
        })
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    /// Staging directory the snapshot is being assembled in.
    pub fn pending_path(&self) -> &Path {
        &self.path
    }

    /// Populates the staging directory through `writer` (the database
    /// checkpoint routine) and records the staged combined checksum as the
    /// expected value for commit. A failing writer aborts the transient.
    pub fn take<W>(&mut self, writer: W) -> SnapshotResult<()>
    where
        W: FnOnce(&Path) -> SnapshotResult<()>,
    {
        self.ensure_open()?;
        debug!(id = %self.id, path = %self.path.display(), "taking transient snapshot");
        if let Err(err) = writer(&self.path) {
            warn!(id = %self.id, %err, "snapshot writer failed, aborting transient");
            self.abort();
            return Err(err);
        }
        match combined_checksum_of_dir(&self.path) {
            Ok(checksum) => {
                self.expected_checksum = Some(checksum);
                Ok(())
            }
            Err(err) => {
                warn!(id = %self.id, %err, "failed to checksum staged snapshot, aborting");
                self.abort();
                Err(err)
            }
        }
    }

    /// Idempotently writes one replicated chunk into the staging directory.
    ///
    /// Returns `Ok(false)` when the chunk must be treated as corruption: a
    /// duplicate file, a content checksum mismatch, or a whole-snapshot
    /// checksum disagreeing with earlier chunks. Returns `Ok(true)` without
    /// writing when the snapshot id is already committed.
    pub fn write(&mut self, chunk: &SnapshotChunk) -> SnapshotResult<bool> {
        self.ensure_open()?;

        let chunk_name = chunk.chunk_name();
        if !is_valid_chunk_name(chunk_name) {
            warn!(id = %self.id, chunk = chunk_name, "rejecting chunk with unsafe file name");
            return Ok(false);
        }

        let file = self.path.join(chunk_name);
        if file.exists() {
            debug!(id = %self.id, chunk = chunk_name, "chunk file already exists in staging");
            return Ok(false);
        }

        let actual = crc64(chunk.content());
        if actual != chunk.checksum() {
            warn!(
                id = %self.id,
                chunk = chunk_name,
                expected = chunk.checksum(),
                actual,
                "chunk content checksum mismatch"
            );
            return Ok(false);
        }

        if self.store.exists(&self.id) {
            debug!(id = %self.id, chunk = chunk_name, "snapshot already committed, chunk satisfied");
            return Ok(true);
        }

        match self.expected_checksum {
            None => self.expected_checksum = Some(chunk.snapshot_checksum()),
            Some(expected) if expected != chunk.snapshot_checksum() => {
                warn!(
                    id = %self.id,
                    chunk = chunk_name,
                    expected,
                    actual = chunk.snapshot_checksum(),
                    "chunk carries a different whole-snapshot checksum"
                );
                return Ok(false);
            }
            Some(_) => {}
        }

        let mut out = OpenOptions::new().write(true).create_new(true).open(&file)?;
        out.write_all(chunk.content())?;
        out.sync_all()?;
        trace!(id = %self.id, chunk = chunk_name, "wrote replicated chunk to staging");
        Ok(true)
    }

    /// Promotes the staged snapshot. `Ok(None)` means the id was already
    /// committed elsewhere and this staging has been discarded.
    pub fn commit(&mut self) -> SnapshotResult<Option<Snapshot>> {
        self.ensure_open()?;
        let expected = self.expected_checksum.ok_or_else(|| {
            SnapshotError::invalid_state(format!("nothing staged for snapshot {}", self.id))
        })?;
        let committed = self.store.commit_snapshot(&self.path, expected)?;
        self.state = TransientState::Committed;
        if committed.is_none() {
            // the rename never happened; drop the redundant staging
            if let Err(err) = remove_dir_recursive(&self.path) {
                warn!(id = %self.id, %err, "failed to remove redundant staging directory");
            }
        }
        Ok(committed)
    }

    /// Discards the staging directory. Idempotent; never propagates errors
    /// out of the abort path.
    pub fn abort(&mut self) {
        if self.state != TransientState::Open {
            return;
        }
        if let Err(err) = remove_dir_recursive(&self.path) {
            error!(id = %self.id, %err, "failed to delete staging directory on abort");
        }
        self.state = TransientState::Aborted;
    }

    fn ensure_open(&self) -> SnapshotResult<()> {
        if self.state == TransientState::Open {
            Ok(())
        } else {
            Err(SnapshotError::invalid_state(format!(
                "transient snapshot {} already {}",
                self.id, self.state
            )))
        }
    }
}

/// A chunk name must be a bare file name; anything that could escape the
/// staging directory is rejected.
fn is_valid_chunk_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}
