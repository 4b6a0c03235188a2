use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::chunk::SnapshotChunk;
use crate::config::SnapshotId;
use crate::error::SnapshotResult;
use crate::metrics::SnapshotReplicationMetrics;
use crate::reader::SnapshotChunkReader;
use crate::store::{Snapshot, SnapshotListener, SnapshotStore};
use crate::transient::TransientSnapshot;

/// Transport seam for snapshot chunks.
///
/// `replicate` is fire-and-forget: delivery is best-effort and no per-chunk
/// acknowledgement exists at this layer; a lagging follower reconciles
/// through its own install state. Inbound chunks are handed to
/// [`ReplicationController::on_chunk_received`] on the partition's thread.
pub trait SnapshotReplication {
    fn replicate(&self, chunk: &SnapshotChunk) -> SnapshotResult<()>;
}

/// Install state of one in-flight snapshot id on the receiver.
enum InstallState {
    InProgress(ReplicationContext),
    /// The install failed; further chunks for the id are dropped until a
    /// newer snapshot commits and the entry is cleared.
    Invalid,
}

/// Per-install bookkeeping on the receiver.
struct ReplicationContext {
    started_at: Instant,
    transient: TransientSnapshot,
    chunks_received: u32,
}

/// Observable install progress, for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallProgress {
    InProgress { chunks_received: u32 },
    Invalid,
}

enum WriteOutcome {
    Partial,
    Complete,
    Rejected,
}

/// Drives snapshot replication on both sides.
///
/// As a producer it subscribes to the store and publishes every chunk of a
/// newly committed snapshot to the transport. As a consumer it accepts
/// chunks from peers, possibly out of order and interleaved across
/// snapshots, and installs each snapshot atomically once all chunks have
/// arrived and verified.
///
/// A successful install commits through the same store and therefore fires
/// the same publisher listener, so snapshots cascade to downstream peers
/// without explicit routing.
///
/// All entry points run on the partition's single thread.
pub struct ReplicationController {
    store: SnapshotStore,
    metrics: Arc<SnapshotReplicationMetrics>,
    installs: HashMap<SnapshotId, InstallState>,
}

impl ReplicationController {
    /// Creates the controller and registers the chunk publisher on the
    /// store, so every commit on this node is streamed to peers.
    pub fn new(
        store: SnapshotStore,
        transport: Arc<dyn SnapshotReplication + Send + Sync>,
        metrics: Arc<SnapshotReplicationMetrics>,
    ) -> Self {
        store.add_snapshot_listener(Box::new(ChunkPublisher { transport }));
        Self {
            store,
            metrics,
            installs: HashMap::new(),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Consumes one replicated chunk from a peer.
    ///
    /// Chunks of a single snapshot may arrive in any order; chunks of
    /// different snapshots may interleave. Errors never escape: a failed
    /// install is marked invalid and a newer snapshot supersedes it.
    pub fn on_chunk_received(&mut self, chunk: &SnapshotChunk) {
        let id = match chunk.snapshot_id().parse::<SnapshotId>() {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    snapshot_id = chunk.snapshot_id(),
                    %err,
                    "dropping chunk with unparseable snapshot id"
                );
                return;
            }
        };

        if !self.installs.contains_key(&id) {
            if self
                .store
                .latest_snapshot()
                .is_some_and(|latest| id <= latest.id())
            {
                trace!(%id, chunk = chunk.chunk_name(), "dropping chunk of superseded snapshot");
                return;
            }
            let transient = match self.store.take_transient_snapshot_for(id) {
                Ok(transient) => transient,
                Err(err) => {
                    error!(%id, %err, "failed to allocate transient snapshot for install");
                    return;
                }
            };
            self.metrics.incr_in_flight();
            self.installs.insert(
                id,
                InstallState::InProgress(ReplicationContext {
                    started_at: Instant::now(),
                    transient,
                    chunks_received: 0,
                }),
            );
            debug!(%id, total = chunk.total_count(), "started receiving snapshot");
        }

        let Some(state) = self.installs.get_mut(&id) else {
            return;
        };
        let InstallState::InProgress(context) = state else {
            trace!(%id, chunk = chunk.chunk_name(), "snapshot marked invalid, dropping chunk");
            return;
        };

        let outcome = match context.transient.write(chunk) {
            Ok(true) => {
                context.chunks_received += 1;
                trace!(
                    %id,
                    chunk = chunk.chunk_name(),
                    received = context.chunks_received,
                    total = chunk.total_count(),
                    "accepted snapshot chunk"
                );
                if context.chunks_received == chunk.total_count() {
                    WriteOutcome::Complete
                } else {
                    WriteOutcome::Partial
                }
            }
            Ok(false) => WriteOutcome::Rejected,
            Err(err) => {
                error!(%id, chunk = chunk.chunk_name(), %err, "failed to write snapshot chunk");
                WriteOutcome::Rejected
            }
        };

        match outcome {
            WriteOutcome::Partial => {}
            WriteOutcome::Complete => self.try_commit(id),
            WriteOutcome::Rejected => self.mark_invalid(id),
        }
    }

    /// Install progress for a snapshot id, if the controller tracks it.
    pub fn progress(&self, id: &SnapshotId) -> Option<InstallProgress> {
        self.installs.get(id).map(|state| match state {
            InstallState::InProgress(context) => InstallProgress::InProgress {
                chunks_received: context.chunks_received,
            },
            InstallState::Invalid => InstallProgress::Invalid,
        })
    }

    /// Number of installs currently receiving chunks.
    pub fn in_flight_installs(&self) -> usize {
        self.installs
            .values()
            .filter(|state| matches!(state, InstallState::InProgress(_)))
            .count()
    }

    fn try_commit(&mut self, id: SnapshotId) {
        let Some(InstallState::InProgress(mut context)) = self.installs.remove(&id) else {
            return;
        };
        match context.transient.commit() {
            Ok(Some(snapshot)) => {
                let elapsed = context.started_at.elapsed();
                self.metrics.decr_in_flight();
                self.metrics.observe_install_duration(elapsed);
                debug!(%id, index = snapshot.index(), ?elapsed, "installed replicated snapshot");
                self.clear_superseded(id);
            }
            Ok(None) => {
                self.metrics.decr_in_flight();
                self.metrics.observe_install_duration(context.started_at.elapsed());
                debug!(%id, "snapshot was already committed, install is a no-op");
                self.clear_superseded(id);
            }
            Err(err) => {
                warn!(%id, %err, "failed to commit replicated snapshot");
                context.transient.abort();
                self.installs.insert(id, InstallState::Invalid);
                self.metrics.decr_in_flight();
            }
        }
    }

    /// Aborts the install and poisons the id so stray chunks are dropped.
    fn mark_invalid(&mut self, id: SnapshotId) {
        let previous = self.installs.insert(id, InstallState::Invalid);
        if let Some(InstallState::InProgress(mut context)) = previous {
            warn!(%id, "marking snapshot install as invalid");
            context.transient.abort();
            self.metrics.decr_in_flight();
        }
    }

    /// Clears invalid markers for snapshots older than a committed one.
    /// In-progress installs of older snapshots are left alone; they may
    /// still complete and retention decides what to keep.
    fn clear_superseded(&mut self, committed: SnapshotId) {
        self.installs
            .retain(|id, state| !(matches!(state, InstallState::Invalid) && *id < committed));
    }
}

/// Store listener publishing each committed snapshot's chunks in order.
struct ChunkPublisher {
    transport: Arc<dyn SnapshotReplication + Send + Sync>,
}

impl SnapshotListener for ChunkPublisher {
    fn on_new_snapshot(&self, snapshot: &Snapshot) {
        debug!(id = %snapshot.id(), "publishing committed snapshot to peers");
        let mut reader = match SnapshotChunkReader::new(snapshot) {
            Ok(reader) => reader,
            Err(err) => {
                error!(id = %snapshot.id(), %err, "failed to open chunk reader for publication");
                return;
            }
        };
        while reader.has_next() {
            let chunk = match reader.next_chunk() {
                Ok(chunk) => chunk,
                Err(err) => {
                    error!(id = %snapshot.id(), %err, "failed to read chunk, dropping remainder");
                    break;
                }
            };
            if let Err(err) = self.transport.replicate(&chunk) {
                warn!(
                    id = %snapshot.id(),
                    chunk = chunk.chunk_name(),
                    %err,
                    "chunk publication failed, dropping remaining chunks"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::chunk::combined_checksum;
    use crate::config::SnapshotConfig;
    use crate::test_support::RecordingTransport;

    fn controller_in(tmp: &TempDir) -> (ReplicationController, Arc<RecordingTransport>) {
        let config = SnapshotConfig::new(1, tmp.path().join("partition-1"));
        let store = SnapshotStore::open(&config).expect("open store");
        let transport = Arc::new(RecordingTransport::default());
        let metrics = Arc::new(SnapshotReplicationMetrics::new(config.partition_id));
        (
            ReplicationController::new(store, transport.clone(), metrics),
            transport,
        )
    }

    fn chunks_for(id: &str, files: &[(&str, &[u8])]) -> Vec<SnapshotChunk> {
        let mut sorted: Vec<&(&str, &[u8])> = files.iter().collect();
        sorted.sort_by_key(|(name, _)| *name);
        let snapshot_checksum = combined_checksum(sorted.iter().map(|(_, content)| *content));
        files
            .iter()
            .map(|(name, content)| {
                SnapshotChunk::new(id, files.len() as u32, *name, snapshot_checksum, content.to_vec())
            })
            .collect()
    }

    #[test]
    fn installs_once_all_chunks_arrived() {
        let tmp = TempDir::new().expect("tempdir");
        let (mut controller, transport) = controller_in(&tmp);

        for chunk in chunks_for("100-2-0", &[("a", &[0x01]), ("b", &[0x02])]) {
            controller.on_chunk_received(&chunk);
        }

        let latest = controller.store().latest_snapshot().expect("latest");
        assert_eq!(latest.index(), 100);
        assert_eq!(controller.in_flight_installs(), 0);
        // the install itself was re-published downstream
        assert_eq!(transport.chunk_names(), ["a", "b"]);
    }

    #[test]
    fn corrupt_chunk_poisons_the_install() {
        let tmp = TempDir::new().expect("tempdir");
        let (mut controller, _transport) = controller_in(&tmp);
        let id = SnapshotId::new(100, 2, 0);

        let good = chunks_for("100-2-0", &[("a", &[0x01]), ("b", &[0x02])]);
        controller.on_chunk_received(&good[0]);

        let corrupt = SnapshotChunk::from_parts(
            "100-2-0",
            2,
            "b",
            good[1].checksum() ^ 1,
            good[1].snapshot_checksum(),
            good[1].content().to_vec(),
        );
        controller.on_chunk_received(&corrupt);

        assert_eq!(controller.progress(&id), Some(InstallProgress::Invalid));
        assert!(controller.store().latest_snapshot().is_none());

        // stray chunks for the poisoned id leave no trace in staging
        controller.on_chunk_received(&good[1]);
        assert_eq!(controller.progress(&id), Some(InstallProgress::Invalid));
        assert!(!controller
            .store()
            .layout()
            .pending_path(&id)
            .exists());
    }

    #[test]
    fn superseded_chunks_are_dropped_without_state() {
        let tmp = TempDir::new().expect("tempdir");
        let (mut controller, _transport) = controller_in(&tmp);

        for chunk in chunks_for("150-2-0", &[("a", &[0x09])]) {
            controller.on_chunk_received(&chunk);
        }
        assert_eq!(
            controller.store().latest_snapshot().expect("latest").index(),
            150
        );

        for chunk in chunks_for("100-2-0", &[("a", &[0x01])]) {
            controller.on_chunk_received(&chunk);
        }
        assert_eq!(controller.progress(&SnapshotId::new(100, 2, 0)), None);
        assert_eq!(controller.in_flight_installs(), 0);
    }

    #[test]
    fn newer_commit_clears_older_invalid_marker() {
        let tmp = TempDir::new().expect("tempdir");
        let (mut controller, _transport) = controller_in(&tmp);
        let poisoned = SnapshotId::new(100, 2, 0);

        let bad = SnapshotChunk::from_parts("100-2-0", 2, "a", 1, 2, vec![0x03]);
        controller.on_chunk_received(&bad);
        assert_eq!(controller.progress(&poisoned), Some(InstallProgress::Invalid));

        for chunk in chunks_for("150-2-0", &[("a", &[0x09])]) {
            controller.on_chunk_received(&chunk);
        }
        assert_eq!(controller.progress(&poisoned), None);
    }
}
