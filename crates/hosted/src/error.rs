//! Error types for the hosted storage manager.

use thiserror::Error;

/// Document lifecycle errors.
#[derive(Debug, Error)]
pub enum DocError {
    #[error("invalid doc id: {0}")]
    InvalidDocId(String),

    #[error("worker {worker_id} does not own doc {doc_id}")]
    NotOwner { doc_id: String, worker_id: String },

    #[error("document not found: {0}")]
    DocNotFound(String),

    #[error("fork creation not permitted for {0}")]
    ForkForbidden(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("document {0} is already being prepared")]
    ConcurrentPrepare(String),

    #[error("storage manager is closed")]
    AfterClose,

    #[error("storage error: {0}")]
    Storage(#[from] granary_storage::StorageError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] crate::snapshot::SnapshotError),

    #[error("worker directory error: {0}")]
    Directory(String),

    #[error("push failed for {doc_id}: {message}")]
    PushFailed { doc_id: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<granary_core::Error> for DocError {
    fn from(err: granary_core::Error) -> Self {
        match err {
            granary_core::Error::InvalidDocId(msg) => DocError::InvalidDocId(msg),
            other => DocError::Directory(other.to_string()),
        }
    }
}

/// Result type for document operations.
pub type DocResult<T> = std::result::Result<T, DocError>;
