use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chunk::combined_checksum_of_dir;
use crate::config::{SnapshotConfig, SnapshotId};
use crate::error::{SnapshotError, SnapshotResult};
use crate::fs::{fsync_dir, fsync_file, list_sorted_files, remove_dir_recursive, Layout};
use crate::transient::TransientSnapshot;

/// A committed, immutable snapshot on disk.
///
/// The directory is read-only after commit; `checksum` is the combined
/// checksum of its files in ascending file-name order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    id: SnapshotId,
    path: PathBuf,
    checksum: u64,
}

impl Snapshot {
    pub fn id(&self) -> SnapshotId {
        self.id
    }

    /// Raft log index of the last entry covered by this snapshot.
    pub fn index(&self) -> u64 {
        self.id.index
    }

    pub fn term(&self) -> u64 {
        self.id.term
    }

    /// Highest log index that may be compacted away.
    pub fn compaction_bound(&self) -> u64 {
        self.id.compaction_bound()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checksum(&self) -> u64 {
        self.checksum
    }
}

/// Callback fired after a snapshot commit, synchronously, before
/// `commit_snapshot` returns.
///
/// Listeners are a pure notification channel: they receive the committed
/// snapshot and must not reach back into the store that invoked them.
pub trait SnapshotListener {
    fn on_new_snapshot(&self, snapshot: &Snapshot);
}

impl<F> SnapshotListener for F
where
    F: Fn(&Snapshot) + Send + Sync,
{
    fn on_new_snapshot(&self, snapshot: &Snapshot) {
        self(snapshot)
    }
}

/// Persistent directory of committed snapshots plus a staging area for
/// pending ones.
///
/// Promotion from staging to committed is a single atomic directory rename;
/// a snapshot is either fully visible or not at all. The store keeps the
/// newest committed snapshot cached so `latest_snapshot` is O(1).
///
/// Handles are cheap to clone and share one underlying store.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    layout: Layout,
    latest: Mutex<Option<Snapshot>>,
    listeners: Mutex<Vec<Box<dyn SnapshotListener + Send + Sync>>>,
}

impl SnapshotStore {
    /// Opens the store under the configured root: ensures the directory
    /// layout, sweeps staging directories left behind by a crash, and scans
    /// the committed set for the newest snapshot.
    pub fn open(config: &SnapshotConfig) -> SnapshotResult<Self> {
        let layout = Layout::new(config);
        layout.ensure()?;
        sweep_pending(layout.pending_dir())?;
        let latest = scan_latest(layout.snapshots_dir())?;
        if let Some(snapshot) = &latest {
            debug!(id = %snapshot.id(), "opened snapshot store, latest snapshot present");
        }
        Ok(Self {
            inner: Arc::new(StoreInner {
                layout,
                latest: Mutex::new(latest),
                listeners: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Newest committed snapshot, if any. O(1).
    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.inner.latest.lock().clone()
    }

    /// Whether a snapshot with the given id has been committed.
    pub fn exists(&self, id: &SnapshotId) -> bool {
        self.inner.layout.committed_path(id).is_dir()
    }

    /// Staging path for the given id, or `None` if the id is already
    /// committed. Idempotent; does not create the directory.
    pub fn pending_directory_for(&self, id: &SnapshotId) -> Option<PathBuf> {
        if self.exists(id) {
            None
        } else {
            Some(self.inner.layout.pending_path(id))
        }
    }

    /// Allocates a transient snapshot to be populated by a database
    /// checkpoint (sender side).
    pub fn take_transient_snapshot(
        &self,
        index: u64,
        term: u64,
        position: u64,
    ) -> SnapshotResult<TransientSnapshot> {
        self.take_transient_snapshot_for(SnapshotId::new(index, term, position))
    }

    /// Allocates a transient snapshot to be populated from replicated
    /// chunks (receiver side).
    pub fn take_transient_snapshot_for(&self, id: SnapshotId) -> SnapshotResult<TransientSnapshot> {
        TransientSnapshot::create(self.clone(), id)
    }

    /// Registers a commit listener. Listeners fire after every successful
    /// commit, synchronously and in registration order.
    pub fn add_snapshot_listener(&self, listener: Box<dyn SnapshotListener + Send + Sync>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Promotes a staging directory into the committed set.
    ///
    /// The staged files are validated against `expected_checksum` first; a
    /// mismatch fails the commit and leaves staging in place for inspection
    /// (it is swept on the next startup). `Ok(None)` means a snapshot with
    /// this id is already committed and the commit is a no-op.
    pub fn commit_snapshot(
        &self,
        pending_path: &Path,
        expected_checksum: u64,
    ) -> SnapshotResult<Option<Snapshot>> {
        let id = id_from_dir_name(pending_path)?;

        let staged = list_sorted_files(pending_path)?;
        if staged.is_empty() {
            return Err(SnapshotError::invalid_state(format!(
                "nothing staged for snapshot {id}"
            )));
        }
        let actual = combined_checksum_of_dir(pending_path)?;
        if actual != expected_checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: expected_checksum,
                actual,
            });
        }

        let destination = self.inner.layout.committed_path(&id);
        if destination.exists() {
            debug!(%id, "snapshot already committed, ignoring commit");
            return Ok(None);
        }

        for (_, path) in &staged {
            fsync_file(path)?;
        }
        fsync_dir(pending_path)?;
        fs::rename(pending_path, &destination)?;
        fsync_dir(self.inner.layout.snapshots_dir())?;

        let snapshot = Snapshot {
            id,
            path: destination,
            checksum: expected_checksum,
        };
        debug!(%id, path = %snapshot.path().display(), "committed snapshot");

        {
            let mut latest = self.inner.latest.lock();
            let newer = latest.as_ref().map_or(true, |current| id > current.id());
            if newer {
                *latest = Some(snapshot.clone());
            }
        }

        {
            let listeners = self.inner.listeners.lock();
            for listener in listeners.iter() {
                listener.on_new_snapshot(&snapshot);
            }
        }

        self.purge_older_than_latest();

        Ok(Some(snapshot))
    }

    /// Keep-latest retention: deletes committed snapshots strictly older
    /// than the newest one.
    fn purge_older_than_latest(&self) {
        let Some(latest) = self.latest_snapshot() else {
            return;
        };
        let snapshots_dir = self.inner.layout.snapshots_dir();
        let entries = match fs::read_dir(snapshots_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "failed to list snapshots for retention");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(id) = id_from_dir_name(&path) else {
                warn!(path = %path.display(), "skipping unparseable snapshot directory");
                continue;
            };
            if id < latest.id() {
                match remove_dir_recursive(&path) {
                    Ok(_) => debug!(%id, "deleted superseded snapshot"),
                    Err(err) => warn!(%id, %err, "failed to delete superseded snapshot"),
                }
            }
        }
    }
}

fn id_from_dir_name(path: &Path) -> SnapshotResult<SnapshotId> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SnapshotError::InvalidSnapshotId(path.display().to_string()))?
        .parse()
}

fn sweep_pending(pending_dir: &Path) -> SnapshotResult<()> {
    for entry in fs::read_dir(pending_dir)? {
        let entry = entry?;
        let path = entry.path();
        debug!(path = %path.display(), "sweeping abandoned staging directory");
        if entry.file_type()?.is_dir() {
            remove_dir_recursive(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Scans the committed set and returns the newest snapshot, recomputing its
/// combined checksum from disk.
fn scan_latest(snapshots_dir: &Path) -> SnapshotResult<Option<Snapshot>> {
    let mut newest: Option<(SnapshotId, PathBuf)> = None;
    for entry in fs::read_dir(snapshots_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Ok(id) = id_from_dir_name(&path) else {
            warn!(path = %path.display(), "skipping unparseable snapshot directory");
            continue;
        };
        if newest.as_ref().map_or(true, |(current, _)| id > *current) {
            newest = Some((id, path));
        }
    }
    let Some((id, path)) = newest else {
        return Ok(None);
    };
    let checksum = combined_checksum_of_dir(&path)?;
    Ok(Some(Snapshot { id, path, checksum }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    use crate::chunk::combined_checksum;

    fn open_store(tmp: &TempDir) -> SnapshotStore {
        let config = SnapshotConfig::new(1, tmp.path().join("partition-1"));
        SnapshotStore::open(&config).expect("open store")
    }

    fn stage(store: &SnapshotStore, id: SnapshotId, files: &[(&str, &[u8])]) -> (PathBuf, u64) {
        let pending = store
            .pending_directory_for(&id)
            .expect("id not yet committed");
        fs::create_dir_all(&pending).expect("create staging");
        for (name, content) in files {
            fs::write(pending.join(name), content).expect("stage file");
        }
        let mut sorted: Vec<&(&str, &[u8])> = files.iter().collect();
        sorted.sort_by_key(|(name, _)| *name);
        let checksum = combined_checksum(sorted.iter().map(|(_, content)| *content));
        (pending, checksum)
    }

    #[test]
    fn commit_promotes_staging_atomically() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let id = SnapshotId::new(100, 2, 0);
        let (pending, checksum) = stage(&store, id, &[("a", b"1"), ("b", b"2")]);

        let snapshot = store
            .commit_snapshot(&pending, checksum)
            .expect("commit")
            .expect("committed");

        assert_eq!(snapshot.id(), id);
        assert!(!pending.exists());
        assert!(snapshot.path().join("a").exists());
        assert!(store.exists(&id));
        assert_eq!(store.latest_snapshot().expect("latest").id(), id);
        assert!(store.pending_directory_for(&id).is_none());
    }

    #[test]
    fn commit_rejects_checksum_mismatch_and_keeps_staging() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let id = SnapshotId::new(100, 2, 0);
        let (pending, checksum) = stage(&store, id, &[("a", b"1")]);

        let err = store
            .commit_snapshot(&pending, checksum ^ 1)
            .expect_err("mismatch");
        assert!(matches!(err, SnapshotError::ChecksumMismatch { .. }));
        // staging stays for inspection; it is swept on the next startup
        assert!(pending.exists());
        assert!(store.latest_snapshot().is_none());
    }

    #[test]
    fn duplicate_commit_is_a_noop() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let id = SnapshotId::new(100, 2, 0);
        let (pending, checksum) = stage(&store, id, &[("a", b"1")]);
        store
            .commit_snapshot(&pending, checksum)
            .expect("commit")
            .expect("committed");

        // stage the same id again, bypassing pending_directory_for which
        // already reports the id as committed
        assert!(store.pending_directory_for(&id).is_none());
        let pending = store.layout().pending_path(&id);
        fs::create_dir_all(&pending).expect("create staging");
        fs::write(pending.join("a"), b"1").expect("stage file");

        let second = store.commit_snapshot(&pending, checksum).expect("commit");
        assert!(second.is_none());
    }

    #[test]
    fn listeners_fire_synchronously_in_order() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let calls = Arc::new(AtomicUsize::new(0));

        let first = calls.clone();
        store.add_snapshot_listener(Box::new(move |_: &Snapshot| {
            // first registered listener observes no prior calls
            first.fetch_add(1, Ordering::SeqCst);
        }));
        let second = calls.clone();
        store.add_snapshot_listener(Box::new(move |snapshot: &Snapshot| {
            assert_eq!(second.load(Ordering::SeqCst), 1);
            assert_eq!(snapshot.index(), 100);
            second.fetch_add(1, Ordering::SeqCst);
        }));

        let id = SnapshotId::new(100, 2, 0);
        let (pending, checksum) = stage(&store, id, &[("a", b"1")]);
        store.commit_snapshot(&pending, checksum).expect("commit");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retention_keeps_only_the_newest() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);

        let older = SnapshotId::new(100, 2, 0);
        let (pending, checksum) = stage(&store, older, &[("a", b"1")]);
        store.commit_snapshot(&pending, checksum).expect("commit");

        let newer = SnapshotId::new(150, 2, 0);
        let (pending, checksum) = stage(&store, newer, &[("a", b"9")]);
        store.commit_snapshot(&pending, checksum).expect("commit");

        assert!(!store.exists(&older));
        assert!(store.exists(&newer));
        assert_eq!(store.latest_snapshot().expect("latest").id(), newer);
    }

    #[test]
    fn commit_of_older_snapshot_keeps_latest() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);

        let newer = SnapshotId::new(150, 2, 0);
        let (pending, checksum) = stage(&store, newer, &[("a", b"9")]);
        store.commit_snapshot(&pending, checksum).expect("commit");

        let older = SnapshotId::new(100, 2, 0);
        let (pending, checksum) = stage(&store, older, &[("a", b"1")]);
        let committed = store.commit_snapshot(&pending, checksum).expect("commit");
        assert!(committed.is_some());
        assert_eq!(store.latest_snapshot().expect("latest").id(), newer);
    }

    #[test]
    fn reopen_scans_latest_and_sweeps_staging() {
        let tmp = TempDir::new().expect("tempdir");
        let config = SnapshotConfig::new(1, tmp.path().join("partition-1"));
        {
            let store = SnapshotStore::open(&config).expect("open");
            let id = SnapshotId::new(200, 3, 0);
            let (pending, checksum) = stage(&store, id, &[("a", b"state")]);
            store.commit_snapshot(&pending, checksum).expect("commit");

            // leave a half-written install behind
            let abandoned = store
                .pending_directory_for(&SnapshotId::new(300, 3, 0))
                .expect("pending path");
            fs::create_dir_all(&abandoned).expect("create staging");
            fs::write(abandoned.join("a"), b"partial").expect("stage file");
        }

        let reopened = SnapshotStore::open(&config).expect("reopen");
        let latest = reopened.latest_snapshot().expect("latest");
        assert_eq!(latest.id(), SnapshotId::new(200, 3, 0));
        assert!(fs::read_dir(reopened.layout().pending_dir())
            .expect("list pending")
            .next()
            .is_none());
    }
}
