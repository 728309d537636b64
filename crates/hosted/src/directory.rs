//! Worker directory client.
//!
//! The directory is the cluster's source of truth for which worker owns a
//! document and what content digest was last confirmed uploaded. Entries
//! are updated atomically per doc id; the only fields the manager consumes
//! are `is_active`, the owner's id, and `doc_md5`.

use crate::error::{DocError, DocResult};
use async_trait::async_trait;
use granary_storage::checksummed::HashRegister;
use granary_storage::error::{StorageError, StorageResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A document worker, as recorded in the directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: String,
}

/// Directory entry for one document.
#[derive(Clone, Debug)]
pub struct DocStatus {
    pub doc_id: String,
    /// The assigned worker; `None` until a worker claims the doc.
    pub doc_worker: Option<WorkerInfo>,
    pub is_active: bool,
    /// Hex MD5 of the last confirmed upload; `None` for never-uploaded
    /// docs, the `DELETED` sentinel for tombstoned ones.
    pub doc_md5: Option<String>,
}

/// Remote map of `doc_id -> {owner, state, digest}`.
///
/// Implementations must make each operation atomic per doc id (e.g. a
/// compare-and-set on a shared KV).
#[async_trait]
pub trait WorkerDirectory: Send + Sync + 'static {
    /// Return the assignment for a doc, claiming it for `self_id` when
    /// nobody holds it.
    async fn get_doc_worker_or_assign(&self, doc_id: &str, self_id: &str)
        -> DocResult<DocStatus>;

    /// Look up the assignment without claiming.
    async fn get_doc_worker(&self, doc_id: &str) -> DocResult<Option<DocStatus>>;

    /// Atomically set (or clear) the recorded content digest.
    async fn update_doc_status(&self, doc_id: &str, doc_md5: Option<&str>) -> DocResult<()>;
}

/// In-memory directory for tests and single-node deployments. One lock
/// over the whole map gives the per-doc atomicity the trait demands.
#[derive(Default)]
pub struct MemoryWorkerDirectory {
    entries: Mutex<HashMap<String, DocStatus>>,
}

impl MemoryWorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an entry wholesale (test setup: foreign owners, inactive
    /// docs, preset digests).
    pub fn set_status(&self, status: DocStatus) {
        self.entries
            .lock()
            .expect("directory poisoned")
            .insert(status.doc_id.clone(), status);
    }

    /// The recorded digest for a doc, if any.
    pub fn doc_md5(&self, doc_id: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("directory poisoned")
            .get(doc_id)
            .and_then(|status| status.doc_md5.clone())
    }
}

#[async_trait]
impl WorkerDirectory for MemoryWorkerDirectory {
    async fn get_doc_worker_or_assign(
        &self,
        doc_id: &str,
        self_id: &str,
    ) -> DocResult<DocStatus> {
        let mut entries = self.entries.lock().expect("directory poisoned");
        let status = entries
            .entry(doc_id.to_string())
            .or_insert_with(|| DocStatus {
                doc_id: doc_id.to_string(),
                doc_worker: None,
                is_active: true,
                doc_md5: None,
            });
        if status.doc_worker.is_none() {
            status.doc_worker = Some(WorkerInfo {
                id: self_id.to_string(),
            });
        }
        Ok(status.clone())
    }

    async fn get_doc_worker(&self, doc_id: &str) -> DocResult<Option<DocStatus>> {
        Ok(self
            .entries
            .lock()
            .expect("directory poisoned")
            .get(doc_id)
            .cloned())
    }

    async fn update_doc_status(&self, doc_id: &str, doc_md5: Option<&str>) -> DocResult<()> {
        let mut entries = self.entries.lock().expect("directory poisoned");
        let status = entries
            .entry(doc_id.to_string())
            .or_insert_with(|| DocStatus {
                doc_id: doc_id.to_string(),
                doc_worker: None,
                is_active: true,
                doc_md5: None,
            });
        status.doc_md5 = doc_md5.map(|s| s.to_string());
        Ok(())
    }
}

/// Adapter exposing the directory's digest column as the shared hash
/// register of the checksummed store. Storage keys are `<docId>.grist`;
/// the suffix is stripped to address the directory.
pub struct DirectoryHashRegister {
    directory: Arc<dyn WorkerDirectory>,
}

impl DirectoryHashRegister {
    pub fn new(directory: Arc<dyn WorkerDirectory>) -> Self {
        Self { directory }
    }

    fn doc_id_of(key: &str) -> &str {
        key.strip_suffix(".grist").unwrap_or(key)
    }
}

#[async_trait]
impl HashRegister for DirectoryHashRegister {
    async fn load(&self, key: &str) -> StorageResult<Option<String>> {
        let status = self
            .directory
            .get_doc_worker(Self::doc_id_of(key))
            .await
            .map_err(|e: DocError| StorageError::Register(e.to_string()))?;
        Ok(status.and_then(|s| s.doc_md5))
    }

    async fn save(&self, key: &str, value: Option<&str>) -> StorageResult<()> {
        self.directory
            .update_doc_status(Self::doc_id_of(key), value)
            .await
            .map_err(|e: DocError| StorageError::Register(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_assign_claims_once() {
        let directory = MemoryWorkerDirectory::new();

        let status = directory.get_doc_worker_or_assign("doc", "w1").await.unwrap();
        assert_eq!(status.doc_worker, Some(WorkerInfo { id: "w1".into() }));
        assert!(status.is_active);

        // A second worker does not steal the assignment.
        let status = directory.get_doc_worker_or_assign("doc", "w2").await.unwrap();
        assert_eq!(status.doc_worker, Some(WorkerInfo { id: "w1".into() }));
    }

    #[tokio::test]
    async fn test_update_doc_status_roundtrip() {
        let directory = MemoryWorkerDirectory::new();
        directory.get_doc_worker_or_assign("doc", "w1").await.unwrap();

        directory.update_doc_status("doc", Some("cafe")).await.unwrap();
        assert_eq!(directory.doc_md5("doc"), Some("cafe".to_string()));

        directory.update_doc_status("doc", None).await.unwrap();
        assert_eq!(directory.doc_md5("doc"), None);
    }

    #[tokio::test]
    async fn test_hash_register_adapter_strips_suffix() {
        let directory = Arc::new(MemoryWorkerDirectory::new());
        let register = DirectoryHashRegister::new(directory.clone());

        register.save("doc.grist", Some("beef")).await.unwrap();
        assert_eq!(directory.doc_md5("doc"), Some("beef".to_string()));
        assert_eq!(
            register.load("doc.grist").await.unwrap(),
            Some("beef".to_string())
        );
        assert_eq!(register.load("other.grist").await.unwrap(), None);
    }
}
