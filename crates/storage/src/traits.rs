//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use granary_core::Checksum;
use std::path::Path;

/// Metadata about a stored object version.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content digest of the version, when the backend can report one.
    /// S3 reports it only for whole-object puts (the ETag); multipart
    /// objects report `None`.
    pub checksum: Option<Checksum>,
    /// Version id of the object this metadata describes.
    pub snapshot_id: Option<String>,
}

/// One historical version of an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSnapshot {
    /// Backend-native version id.
    pub snapshot_id: String,
    /// When the version was created (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// A versioned external object store.
///
/// Objects are whole files addressed by key; every upload creates a new
/// version and old versions stay addressable by their version id. Backends
/// make no consistency promises beyond their own: the checksummed wrapper
/// is responsible for masking read-after-write anomalies.
#[async_trait]
pub trait ExternalStorage: Send + Sync + 'static {
    /// Check whether any version of the object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get metadata for the latest version without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Upload the file at `path` as a new version of `key`. Returns the new
    /// version id when the backend assigns one.
    async fn upload(&self, key: &str, path: &Path) -> StorageResult<Option<String>>;

    /// Download a version of `key` (latest when `snapshot_id` is `None`)
    /// to the file at `path`, replacing it. Returns the version id fetched.
    async fn download(
        &self,
        key: &str,
        path: &Path,
        snapshot_id: Option<&str>,
    ) -> StorageResult<Option<String>>;

    /// Remove versions of `key`: the listed ones, or every version (and the
    /// object itself) when `snapshot_ids` is `None`. Removing an absent
    /// object is not an error.
    async fn remove(&self, key: &str, snapshot_ids: Option<&[String]>) -> StorageResult<()>;

    /// List versions of `key`, newest first. An absent object lists empty.
    async fn versions(&self, key: &str) -> StorageResult<Vec<ObjectSnapshot>>;

    /// Static identifier of the backend type, for logs.
    fn backend_name(&self) -> &'static str;
}
