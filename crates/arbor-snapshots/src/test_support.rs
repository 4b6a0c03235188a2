//! Shared fixtures for unit and integration tests.

use std::path::Path;

use parking_lot::Mutex;

use crate::chunk::SnapshotChunk;
use crate::db::{StateDb, StateDbFactory};
use crate::error::{SnapshotError, SnapshotResult};
use crate::replication::SnapshotReplication;

/// In-memory stand-in for the embedded database: a checkpoint writes a fixed
/// set of files.
pub struct FixtureDb {
    files: Vec<(String, Vec<u8>)>,
}

impl StateDb for FixtureDb {
    fn checkpoint(&self, target: &Path) -> SnapshotResult<()> {
        for (name, content) in &self.files {
            std::fs::write(target.join(name), content)?;
        }
        Ok(())
    }
}

/// Factory producing [`FixtureDb`] handles, optionally refusing to open.
pub struct FixtureDbFactory {
    files: Vec<(String, Vec<u8>)>,
    fail_to_open: bool,
}

impl Default for FixtureDbFactory {
    fn default() -> Self {
        Self::with_files(&[("state.db", b"fixture-state" as &[u8])])
    }
}

impl FixtureDbFactory {
    pub fn with_files(files: &[(&str, &[u8])]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(name, content)| (name.to_string(), content.to_vec()))
                .collect(),
            fail_to_open: false,
        }
    }

    /// A factory whose databases refuse to open, for recovery failure tests.
    pub fn failing() -> Self {
        Self {
            files: Vec::new(),
            fail_to_open: true,
        }
    }
}

impl StateDbFactory for FixtureDbFactory {
    fn create_db(&self, path: &Path) -> SnapshotResult<Box<dyn StateDb>> {
        if self.fail_to_open {
            return Err(SnapshotError::invalid_state(format!(
                "refusing to open database at {}",
                path.display()
            )));
        }
        Ok(Box::new(FixtureDb {
            files: self.files.clone(),
        }))
    }
}

/// Transport that records published chunks, optionally failing after a
/// number of deliveries.
#[derive(Default)]
pub struct RecordingTransport {
    chunks: Mutex<Vec<SnapshotChunk>>,
    fail_after: Option<usize>,
}

impl RecordingTransport {
    pub fn failing_after(count: usize) -> Self {
        Self {
            chunks: Mutex::new(Vec::new()),
            fail_after: Some(count),
        }
    }

    pub fn chunks(&self) -> Vec<SnapshotChunk> {
        self.chunks.lock().clone()
    }

    pub fn chunk_names(&self) -> Vec<String> {
        self.chunks
            .lock()
            .iter()
            .map(|chunk| chunk.chunk_name().to_string())
            .collect()
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }
}

impl SnapshotReplication for RecordingTransport {
    fn replicate(&self, chunk: &SnapshotChunk) -> SnapshotResult<()> {
        let mut chunks = self.chunks.lock();
        if self.fail_after.is_some_and(|limit| chunks.len() >= limit) {
            return Err(SnapshotError::file_system("transport unavailable"));
        }
        chunks.push(chunk.clone());
        Ok(())
    }
}
