use std::fs;
use std::path::PathBuf;

use crate::chunk::{crc64, SnapshotChunk};
use crate::error::{SnapshotError, SnapshotResult};
use crate::fs::list_sorted_files;
use crate::store::Snapshot;

/// Lazy, resumable cursor over a committed snapshot's chunks.
///
/// Chunks are yielded in ascending file-name order and loaded from disk one
/// at a time; the snapshot is never held in memory as a whole. [`Self::seek`]
/// skips already-delivered chunks so replication can resume after a receiver
/// failure without re-sending.
pub struct SnapshotChunkReader {
    snapshot_id: String,
    snapshot_checksum: u64,
    total_count: u32,
    files: Vec<(String, PathBuf)>,
    next_index: usize,
}

impl SnapshotChunkReader {
    pub fn new(snapshot: &Snapshot) -> SnapshotResult<Self> {
        let files = list_sorted_files(snapshot.path())?;
        if files.is_empty() {
            return Err(SnapshotError::invalid_state(format!(
                "committed snapshot {} has no chunk files",
                snapshot.id()
            )));
        }
        let total_count = u32::try_from(files.len()).map_err(|_| {
            SnapshotError::invalid_state(format!(
                "snapshot {} has too many chunk files: {}",
                snapshot.id(),
                files.len()
            ))
        })?;
        Ok(Self {
            snapshot_id: snapshot.id().to_string(),
            snapshot_checksum: snapshot.checksum(),
            total_count,
            files,
            next_index: 0,
        })
    }

    pub fn has_next(&self) -> bool {
        self.next_index < self.files.len()
    }

    /// Name of the chunk the next [`Self::next_chunk`] call will yield.
    pub fn next_id(&self) -> Option<&str> {
        self.files
            .get(self.next_index)
            .map(|(name, _)| name.as_str())
    }

    /// Skips all chunks with an id up to and including `id`, so the next
    /// chunk is the one strictly after it. `None` is a no-op.
    pub fn seek(&mut self, id: Option<&str>) {
        let Some(id) = id else {
            return;
        };
        while self
            .files
            .get(self.next_index)
            .is_some_and(|(name, _)| name.as_str() <= id)
        {
            self.next_index += 1;
        }
    }

    /// Loads and returns the next chunk. Calling this when [`Self::has_next`]
    /// is false is an error.
    pub fn next_chunk(&mut self) -> SnapshotResult<SnapshotChunk> {
        let Some((name, path)) = self.files.get(self.next_index) else {
            return Err(SnapshotError::invalid_state(
                "chunk reader exhausted".to_string(),
            ));
        };
        let content = fs::read(path)?;
        let chunk = SnapshotChunk::from_parts(
            self.snapshot_id.clone(),
            self.total_count,
            name.clone(),
            crc64(&content),
            self.snapshot_checksum,
            content,
        );
        self.next_index += 1;
        Ok(chunk)
    }

    /// Releases the cursor; subsequent `has_next` reports false. Idempotent.
    pub fn close(&mut self) {
        self.next_index = self.files.len();
    }
}

impl Iterator for SnapshotChunkReader {
    type Item = SnapshotResult<SnapshotChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.has_next() {
            Some(self.next_chunk())
        } else {
            None
        }
    }
}
