use tracing::{debug, error, trace};

use crate::db::{DbState, ExporterPositionSupplier, RecordEntrySupplier, StateDb, StateDbFactory};
use crate::error::{SnapshotError, SnapshotResult};
use crate::fs::{copy_dir_files, remove_dir_recursive, Layout};
use crate::store::SnapshotStore;
use crate::transient::TransientSnapshot;

/// Binds committed snapshots to the runtime database of one partition.
///
/// On startup [`Self::recover`] rebuilds the runtime directory from the
/// newest committed snapshot and opens the database on it. At runtime
/// [`Self::take_transient_snapshot`] checkpoints the database into a staging
/// directory, producing the transient the snapshot director later commits.
///
/// The controller exclusively owns the database handle; no other component
/// touches it.
pub struct StateController {
    store: SnapshotStore,
    layout: Layout,
    db_factory: Box<dyn StateDbFactory>,
    entry_supplier: Box<dyn RecordEntrySupplier>,
    exporter_positions: Box<dyn ExporterPositionSupplier>,
    db: DbState,
}

impl StateController {
    pub fn new(
        store: SnapshotStore,
        db_factory: Box<dyn StateDbFactory>,
        entry_supplier: Box<dyn RecordEntrySupplier>,
        exporter_positions: Box<dyn ExporterPositionSupplier>,
    ) -> Self {
        let layout = store.layout().clone();
        Self {
            store,
            layout,
            db_factory,
            entry_supplier,
            exporter_positions,
            db: DbState::Closed,
        }
    }

    /// Rebuilds the runtime directory from the newest committed snapshot.
    ///
    /// Any pre-existing runtime directory is deleted first: its content is
    /// not trusted after a restart. Failure to open the database from the
    /// snapshot is fatal; the log assumes the state the snapshot carries, so
    /// running without it would diverge silently.
    pub fn recover(&mut self) -> SnapshotResult<()> {
        let runtime = self.layout.runtime_dir().to_path_buf();
        remove_dir_recursive(&runtime)?;

        let Some(snapshot) = self.store.latest_snapshot() else {
            debug!("no snapshot available, starting from an empty state");
            return Ok(());
        };

        debug!(id = %snapshot.id(), "recovering state from snapshot");
        copy_dir_files(snapshot.path(), &runtime)?;

        match self.open_db() {
            Ok(_) => {
                debug!(id = %snapshot.id(), "recovered state from snapshot");
                Ok(())
            }
            Err(err) => {
                error!(
                    id = %snapshot.id(),
                    %err,
                    "failed to open recovered snapshot, manual intervention required"
                );
                remove_dir_recursive(&runtime)?;
                Err(SnapshotError::unrecoverable(snapshot.path(), err))
            }
        }
    }

    /// Opens the runtime database if it is not already open.
    pub fn open_db(&mut self) -> SnapshotResult<&dyn StateDb> {
        if let DbState::Closed = self.db {
            std::fs::create_dir_all(self.layout.runtime_dir())?;
            let db = self.db_factory.create_db(self.layout.runtime_dir())?;
            debug!(path = %self.layout.runtime_dir().display(), "opened runtime database");
            self.db = DbState::Open(db);
        }
        match &self.db {
            DbState::Open(db) => Ok(db.as_ref()),
            DbState::Closed => Err(SnapshotError::invalid_state(
                "runtime database failed to open",
            )),
        }
    }

    pub fn is_db_opened(&self) -> bool {
        self.db.is_open()
    }

    /// Closes the runtime database. Dropping the handle closes it.
    pub fn close(&mut self) {
        if self.db.is_open() {
            self.db = DbState::Closed;
            debug!(path = %self.layout.runtime_dir().display(), "closed runtime database");
        }
    }

    /// 1 if a committed snapshot exists, 0 otherwise.
    pub fn valid_snapshots_count(&self) -> usize {
        usize::from(self.store.latest_snapshot().is_some())
    }

    /// Checkpoints the runtime database into a new transient snapshot.
    ///
    /// The snapshot position is the minimum of the exporter position and
    /// `lower_bound_position`; the raft entry at that position provides
    /// `(index, term)`. Returns `Ok(None)` when the database is closed, no
    /// entry covers the position, or a snapshot at that index already exists
    /// (taking it again would be pure churn).
    pub fn take_transient_snapshot(
        &self,
        lower_bound_position: i64,
    ) -> SnapshotResult<Option<TransientSnapshot>> {
        let DbState::Open(ref db) = self.db else {
            debug!("skipping snapshot, runtime database is closed");
            return Ok(None);
        };

        let exported = self.exporter_positions.exported_position(db.as_ref());
        let snapshot_position = exported.min(lower_bound_position);

        let Some(entry) = self.entry_supplier.indexed_entry(snapshot_position) else {
            debug!(snapshot_position, "no indexed entry at position, skipping snapshot");
            return Ok(None);
        };

        let previous_bound = self
            .store
            .latest_snapshot()
            .map(|snapshot| snapshot.compaction_bound());
        if previous_bound == Some(entry.index) {
            trace!(index = entry.index, "snapshot at index already exists, skipping");
            return Ok(None);
        }

        let mut transient = self.store.take_transient_snapshot(
            entry.index,
            entry.term,
            snapshot_position.max(0) as u64,
        )?;
        transient.take(|staging| db.checkpoint(staging))?;
        Ok(Some(transient))
    }
}
