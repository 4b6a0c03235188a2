use std::fmt::Display;
use std::path::Path;

/// A specialized error type for snapshot operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A chunk record could not be parsed off the wire.
    #[error("chunk decode error: {0}")]
    Decode(String),
    /// A chunk or staged file failed integrity validation.
    #[error("corrupted chunk: {0}")]
    CorruptedChunk(String),
    /// Whole-snapshot combined checksum did not match at commit time.
    #[error("combined checksum mismatch: expected {expected:#018x}, computed {actual:#018x}")]
    ChecksumMismatch { expected: u64, actual: u64 },
    /// Snapshot directory name could not be parsed into an id.
    #[error("invalid snapshot id: {0}")]
    InvalidSnapshotId(String),
    /// File system operation error.
    #[error("file system error: {0}")]
    FileSystem(String),
    /// Invalid state transition or operation on a consumed handle.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Recovery could not bind the latest snapshot to a runtime database.
    /// Manual intervention is required; the partition must halt.
    #[error("unrecoverable state: {0}")]
    UnrecoverableState(String),
}

impl SnapshotError {
    /// Create a decode error from a displayable value.
    pub fn decode<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Decode(msg.to_string())
    }

    /// Create a corrupted-chunk error from a displayable value.
    pub fn corrupted_chunk<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::CorruptedChunk(msg.to_string())
    }

    /// Create a file system error from a displayable value.
    pub fn file_system<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::FileSystem(msg.to_string())
    }

    /// Create an invalid-state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Create an unrecoverable-state error for the given snapshot path.
    pub fn unrecoverable<T>(path: &Path, cause: T) -> Self
    where
        T: Display,
    {
        Self::UnrecoverableState(format!(
            "failed to recover from snapshot {}: {cause}",
            path.display()
        ))
    }
}

/// A Result type alias for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;
