//! Error types for the write engine.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying store read/write failed. Poisons the writer when it happens
    /// on the synchronous write path; logged and re-raised at the next
    /// trigger when it happens on the background compaction path.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// The file-format codec rejected a block. Always fatal to the
    /// surrounding operation, never swallowed.
    #[error("corrupt file {path}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    /// A write-path operation was attempted on a writer that previously
    /// observed a fatal flush failure.
    #[error("writer is poisoned, last error: {0}")]
    WriterPoisoned(String),

    /// A background compaction failed. Non-fatal: reported at the next
    /// `triggerCompaction`/`prepareCommit`, leaving Levels unchanged.
    #[error("compaction failed: {0}")]
    CompactionFailed(String),

    /// The operation was cancelled; partial outputs are cleaned up by the
    /// caller that observes this.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
