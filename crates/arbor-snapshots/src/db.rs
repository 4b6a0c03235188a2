use std::path::Path;

use crate::error::SnapshotResult;

/// Handle to the embedded state-machine database of one partition.
///
/// The database itself is a collaborator of this subsystem; the only
/// operation the snapshot machinery needs is a consistent checkpoint written
/// into a directory of its choosing. Closing is dropping the handle.
pub trait StateDb {
    /// Writes a consistent checkpoint of the database into `target`.
    fn checkpoint(&self, target: &Path) -> SnapshotResult<()>;
}

/// Opens the embedded database on a runtime directory.
pub trait StateDbFactory {
    fn create_db(&self, path: &Path) -> SnapshotResult<Box<dyn StateDb>>;
}

/// A raft log entry resolved from a record position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedEntry {
    pub index: u64,
    pub term: u64,
}

/// Resolves a processed record position to the raft log entry covering it.
pub trait RecordEntrySupplier {
    fn indexed_entry(&self, position: i64) -> Option<IndexedEntry>;
}

impl<F> RecordEntrySupplier for F
where
    F: Fn(i64) -> Option<IndexedEntry>,
{
    fn indexed_entry(&self, position: i64) -> Option<IndexedEntry> {
        self(position)
    }
}

/// Supplies the lowest record position all exporters have handed off.
pub trait ExporterPositionSupplier {
    fn exported_position(&self, db: &dyn StateDb) -> i64;
}

impl<F> ExporterPositionSupplier for F
where
    F: Fn(&dyn StateDb) -> i64,
{
    fn exported_position(&self, db: &dyn StateDb) -> i64 {
        self(db)
    }
}

/// Lifecycle of the runtime database owned by the state controller.
pub(crate) enum DbState {
    Closed,
    Open(Box<dyn StateDb>),
}

impl DbState {
    pub(crate) fn is_open(&self) -> bool {
        matches!(self, DbState::Open(_))
    }
}
