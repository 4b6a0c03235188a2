//! Recovery scenarios: binding the newest committed snapshot to the runtime
//! database directory on startup.

use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use arbor_snapshots::test_support::{FixtureDbFactory, RecordingTransport};
use arbor_snapshots::{
    IndexedEntry, ReplicationController, SnapshotConfig, SnapshotError,
    SnapshotReplicationMetrics, SnapshotStore, StateController, StateDb,
};

fn store_with_snapshot(tmp: &TempDir, index: u64, term: u64) -> SnapshotStore {
    let config = SnapshotConfig::new(1, tmp.path().join("partition-1"));
    let store = SnapshotStore::open(&config).expect("open store");

    let mut state = StateController::new(
        store.clone(),
        Box::new(FixtureDbFactory::with_files(&[
            ("a", b"alpha" as &[u8]),
            ("b", b"beta"),
        ])),
        Box::new(move |_: i64| Some(IndexedEntry { index, term })),
        Box::new(|_: &dyn StateDb| 0),
    );
    state.open_db().expect("open db");
    let mut transient = state
        .take_transient_snapshot(0)
        .expect("take")
        .expect("transient");
    transient.commit().expect("commit").expect("committed");
    state.close();
    store
}

#[test]
fn recover_binds_the_latest_snapshot() {
    let tmp = TempDir::new().expect("tempdir");
    let store = store_with_snapshot(&tmp, 200, 3);

    // a stale runtime directory from the previous run must be discarded
    let runtime = store.layout().runtime_dir().to_path_buf();
    fs::create_dir_all(&runtime).expect("create runtime");
    fs::write(runtime.join("stale"), b"junk").expect("write junk");

    let mut state = StateController::new(
        store,
        Box::new(FixtureDbFactory::default()),
        Box::new(|_: i64| None),
        Box::new(|_: &dyn StateDb| 0),
    );
    state.recover().expect("recover");

    assert!(state.is_db_opened());
    assert_eq!(state.valid_snapshots_count(), 1);
    assert!(!runtime.join("stale").exists());
    assert_eq!(fs::read(runtime.join("a")).expect("read"), b"alpha");
    assert_eq!(fs::read(runtime.join("b")).expect("read"), b"beta");
}

#[test]
fn recover_without_snapshot_starts_empty() {
    let tmp = TempDir::new().expect("tempdir");
    let config = SnapshotConfig::new(1, tmp.path().join("partition-1"));
    let store = SnapshotStore::open(&config).expect("open store");

    let mut state = StateController::new(
        store,
        Box::new(FixtureDbFactory::default()),
        Box::new(|_: i64| None),
        Box::new(|_: &dyn StateDb| 0),
    );
    state.recover().expect("recover");

    assert!(!state.is_db_opened());
    assert_eq!(state.valid_snapshots_count(), 0);
}

#[test]
fn unreadable_snapshot_is_fatal() {
    let tmp = TempDir::new().expect("tempdir");
    let store = store_with_snapshot(&tmp, 200, 3);
    let runtime = store.layout().runtime_dir().to_path_buf();

    let mut state = StateController::new(
        store,
        Box::new(FixtureDbFactory::failing()),
        Box::new(|_: i64| None),
        Box::new(|_: &dyn StateDb| 0),
    );

    let err = state.recover().expect_err("recovery must fail");
    assert!(matches!(err, SnapshotError::UnrecoverableState(_)));
    // the runtime directory is deleted so nothing half-recovered survives
    assert!(!runtime.exists());
    assert!(!state.is_db_opened());
}

#[test]
fn installed_snapshot_survives_restart_and_recovers() {
    let tmp = TempDir::new().expect("tempdir");
    let config = SnapshotConfig::new(1, tmp.path().join("partition-1"));

    {
        let store = SnapshotStore::open(&config).expect("open store");
        let transport = Arc::new(RecordingTransport::default());
        let metrics = Arc::new(SnapshotReplicationMetrics::new(config.partition_id));
        let _controller = ReplicationController::new(store.clone(), transport, metrics);

        let mut state = StateController::new(
            store,
            Box::new(FixtureDbFactory::with_files(&[("a", b"alpha" as &[u8])])),
            Box::new(|_: i64| Some(IndexedEntry { index: 100, term: 2 })),
            Box::new(|_: &dyn StateDb| 0),
        );
        state.open_db().expect("open db");
        let mut transient = state
            .take_transient_snapshot(0)
            .expect("take")
            .expect("transient");
        transient.commit().expect("commit").expect("committed");
    }

    let store = SnapshotStore::open(&config).expect("reopen store");
    let latest = store.latest_snapshot().expect("latest survives restart");
    assert_eq!(latest.index(), 100);

    let mut state = StateController::new(
        store,
        Box::new(FixtureDbFactory::default()),
        Box::new(|_: i64| None),
        Box::new(|_: &dyn StateDb| 0),
    );
    state.recover().expect("recover");
    assert!(state.is_db_opened());
}
