use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{SnapshotConfig, SnapshotId};
use crate::error::{SnapshotError, SnapshotResult};

/// Represents the canonical on-disk layout of one partition's state.
///
/// ```text
/// <root>/
///   runtime/     live database, rebuilt from the latest snapshot on recovery
///   snapshots/   committed snapshots, one immutable directory per id
///   pending/     staging directories, swept on startup
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    runtime: PathBuf,
    snapshots: PathBuf,
    pending: PathBuf,
}

impl Layout {
    pub fn new(config: &SnapshotConfig) -> Self {
        let root = config.root_dir.clone();
        let runtime = root.join("runtime");
        let snapshots = root.join("snapshots");
        let pending = root.join("pending");
        Self {
            root,
            runtime,
            snapshots,
            pending,
        }
    }

    /// Creates the snapshot directories. The runtime directory is owned by
    /// recovery and is never pre-created here.
    pub fn ensure(&self) -> SnapshotResult<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.snapshots)?;
        fs::create_dir_all(&self.pending)?;
        let _ = fsync_dir(&self.root);
        Ok(())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending
    }

    /// Directory a committed snapshot with the given id lives in.
    pub fn committed_path(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots.join(id.to_string())
    }

    /// Staging directory for a snapshot with the given id.
    pub fn pending_path(&self, id: &SnapshotId) -> PathBuf {
        self.pending.join(id.to_string())
    }
}

/// Fsync a directory so renames and file creations inside it are durable.
pub fn fsync_dir(path: &Path) -> SnapshotResult<()> {
    match OpenOptions::new().read(true).open(path) {
        Ok(file) => match file.sync_all() {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(SnapshotError::from(err)),
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(SnapshotError::file_system(
            format!("directory not found: {}", path.display()),
        )),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Ok(()),
        Err(err) => Err(SnapshotError::from(err)),
    }
}

/// Fsync a regular file by path.
pub fn fsync_file(path: &Path) -> SnapshotResult<()> {
    let file = OpenOptions::new().read(true).open(path)?;
    match file.sync_all() {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::Unsupported => Ok(()),
        Err(err) => Err(SnapshotError::from(err)),
    }
}

/// Deletes a directory tree. Missing directories are not an error.
pub fn remove_dir_recursive(path: &Path) -> SnapshotResult<()> {
    match fs::remove_dir_all(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SnapshotError::from(err)),
    }
}

/// Copies every file of `src` into `dst`, creating `dst` first.
///
/// Snapshot directories are flat; a nested directory inside one means the
/// checkpoint produced something this subsystem cannot replicate.
pub fn copy_dir_files(src: &Path, dst: &Path) -> SnapshotResult<()> {
    fs::create_dir_all(dst)?;
    for (name, path) in list_sorted_files(src)? {
        fs::copy(&path, dst.join(&name))?;
    }
    fsync_dir(dst)?;
    Ok(())
}

/// Lists the regular files of a directory as `(file_name, path)` pairs in
/// ascending file-name order.
pub fn list_sorted_files(dir: &Path) -> SnapshotResult<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            return Err(SnapshotError::file_system(format!(
                "unexpected non-file entry in snapshot directory: {}",
                path.display()
            )));
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|raw| {
                SnapshotError::file_system(format!("non UTF-8 file name: {raw:?}"))
            })?;
        files.push((name, path));
    }
    files.sort_by(|(left, _), (right, _)| left.cmp(right));
    Ok(files)
}
