//! Hosted document storage for the granary document host.
//!
//! The [`manager::HostedStorageManager`] is the entry point: it keeps live
//! SQLite documents on the local filesystem synchronized with a versioned
//! external object store, on behalf of a cluster of interchangeable
//! document workers. The remaining modules are its collaborators:
//!
//! - [`scheduler`]: per-key debounced, coalescing, retrying operations
//! - [`snapshot`]: consistent copies of live SQLite files
//! - [`directory`]: worker ownership and the authoritative content digest
//! - [`updates`]: batched "last edited" pushes to the home database
//! - [`pruner`]: background deletion of old snapshots

pub mod directory;
pub mod error;
pub mod manager;
pub mod pruner;
pub mod scheduler;
pub mod snapshot;
pub mod updates;

pub use directory::{
    DirectoryHashRegister, DocStatus, MemoryWorkerDirectory, WorkerDirectory, WorkerInfo,
};
pub use error::{DocError, DocResult};
pub use manager::{
    DocSession, DocSnapshot, HostedStorageConfig, HostedStorageManager, ReplaceOptions,
};
pub use pruner::{KeepRecent, RetentionPolicy, SnapshotPruner};
pub use scheduler::{KeyedOps, KeyedOpsOptions, OpFailure};
pub use snapshot::{
    backup_sqlite_database, ProgressAction, ProgressEvent, ProgressPhase, SnapshotError,
};
pub use updates::{DocUpdate, DocUpdateQueue, DocUpdateSink, MemoryUpdateSink, SqliteUpdateSink};
