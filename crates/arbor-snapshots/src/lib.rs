//! Snapshot store, chunked replication, and state recovery for partitioned
//! raft state machines.
//!
//! A log-compacting partition periodically checkpoints its state machine
//! into a snapshot; a follower that lags behind the leader's compacted
//! prefix receives that snapshot in chunks and installs it atomically
//! before resuming log replication. This crate owns that whole path:
//!
//! - [`SnapshotStore`]: committed snapshots on disk plus a staging area,
//!   with atomic promotion and keep-latest retention
//! - [`TransientSnapshot`]: write side of a pending snapshot, populated by a
//!   database checkpoint or by replicated chunks
//! - [`SnapshotChunkReader`]: lazy, resumable cursor over a committed
//!   snapshot's chunks
//! - [`ReplicationController`]: publishes chunks of newly committed
//!   snapshots and installs chunks arriving from peers
//! - [`StateController`]: binds the newest committed snapshot to the
//!   runtime database on startup and drives checkpoints at runtime
//!
//! Every chunk carries its own checksum and the combined checksum of the
//! snapshot it belongs to; installs verify both before a commit can
//! succeed. A half-written install never becomes visible: staging
//! directories are promoted with a single atomic rename and swept on
//! startup.
//!
//! ## Threading
//!
//! The subsystem is single-threaded cooperative per partition: all entry
//! points of one partition's controllers are invoked from that partition's
//! thread. Store handles are cheap clones and may be shared between the
//! controllers of one partition.

pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod fs;
pub mod metrics;
pub mod reader;
pub mod replication;
pub mod state;
pub mod store;
pub mod test_support;
pub mod transient;

pub use chunk::{combined_checksum, crc64, SnapshotChunk};
pub use config::{SnapshotConfig, SnapshotId};
pub use db::{ExporterPositionSupplier, IndexedEntry, RecordEntrySupplier, StateDb, StateDbFactory};
pub use error::{SnapshotError, SnapshotResult};
pub use fs::Layout;
pub use metrics::{
    ReplicationMetricsSnapshot, SnapshotReplicationMetrics, METRIC_REPLICATION_DURATION_MS,
    METRIC_REPLICATION_IN_FLIGHT,
};
pub use reader::SnapshotChunkReader;
pub use replication::{InstallProgress, ReplicationController, SnapshotReplication};
pub use state::StateController;
pub use store::{Snapshot, SnapshotListener, SnapshotStore};
pub use transient::TransientSnapshot;
