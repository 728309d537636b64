//! Shared fixtures: an in-memory versioned remote, a SQLite doc builder,
//! and a fully wired manager over a tempdir.

use async_trait::async_trait;
use granary_core::HostedOptions;
use granary_hosted::{
    DocUpdateSink, HostedStorageConfig, HostedStorageManager, MemoryUpdateSink,
    MemoryWorkerDirectory,
};
use granary_storage::error::{StorageError, StorageResult};
use granary_storage::traits::{ExternalStorage, ObjectMeta, ObjectSnapshot};
use granary_core::Checksum;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// In-memory versioned object store.
#[derive(Default)]
pub struct MemoryRemote {
    objects: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>, // oldest..newest
    counter: Mutex<u64>,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn version_count(&self, key: &str) -> usize {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn latest_content(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .and_then(|v| v.last())
            .map(|(_, data)| data.clone())
    }
}

#[async_trait]
impl ExternalStorage for MemoryRemote {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|v| !v.is_empty())
            .unwrap_or(false))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let objects = self.objects.lock().unwrap();
        let (id, data) = objects
            .get(key)
            .and_then(|v| v.last())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            last_modified: Some(time::OffsetDateTime::now_utc()),
            checksum: Some(Checksum::compute(data)),
            snapshot_id: Some(id.clone()),
        })
    }

    async fn upload(&self, key: &str, path: &Path) -> StorageResult<Option<String>> {
        let data = std::fs::read(path)?;
        let id = {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            format!("m{:06}", *counter)
        };
        self.objects
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push((id.clone(), data));
        Ok(Some(id))
    }

    async fn download(
        &self,
        key: &str,
        path: &Path,
        snapshot_id: Option<&str>,
    ) -> StorageResult<Option<String>> {
        let (id, data) = {
            let objects = self.objects.lock().unwrap();
            let versions = objects
                .get(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            let found = match snapshot_id {
                Some(id) => versions.iter().find(|(vid, _)| vid == id),
                None => versions.last(),
            };
            found
                .cloned()
                .ok_or_else(|| StorageError::NotFound(format!("{key} @ {snapshot_id:?}")))?
        };
        std::fs::write(path, &data)?;
        Ok(Some(id))
    }

    async fn remove(&self, key: &str, snapshot_ids: Option<&[String]>) -> StorageResult<()> {
        let mut objects = self.objects.lock().unwrap();
        match snapshot_ids {
            None => {
                objects.remove(key);
            }
            Some(ids) => {
                if let Some(versions) = objects.get_mut(key) {
                    versions.retain(|(id, _)| !ids.contains(id));
                }
            }
        }
        Ok(())
    }

    async fn versions(&self, key: &str) -> StorageResult<Vec<ObjectSnapshot>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|versions| {
                versions
                    .iter()
                    .rev()
                    .map(|(id, _)| ObjectSnapshot {
                        snapshot_id: id.clone(),
                        last_modified: Some(time::OffsetDateTime::now_utc()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// A wired-up manager over a tempdir, with every collaborator inspectable.
pub struct Fixture {
    pub manager: Arc<HostedStorageManager>,
    pub remote: Arc<MemoryRemote>,
    pub directory: Arc<MemoryWorkerDirectory>,
    pub sink: Arc<MemoryUpdateSink>,
    pub dir: TempDir,
}

pub const WORKER_ID: &str = "worker-1";

pub fn fixture() -> Fixture {
    fixture_with_remote(true)
}

pub fn fixture_with_remote(with_remote: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(MemoryWorkerDirectory::new());
    let remote = MemoryRemote::new();
    let sink = Arc::new(MemoryUpdateSink::new());

    let external: Option<Arc<dyn ExternalStorage>> = if with_remote {
        Some(remote.clone())
    } else {
        None
    };
    let manager = HostedStorageManager::new(
        HostedStorageConfig {
            docs_root: dir.path().join("docs"),
            worker_id: WORKER_ID.to_string(),
            options: HostedOptions {
                seconds_before_push: 15,
                seconds_before_first_retry: 1,
                push_doc_update_times: true,
            },
        },
        directory.clone(),
        external,
        Some(sink.clone() as Arc<dyn DocUpdateSink>),
    )
    .unwrap();

    Fixture {
        manager,
        remote,
        directory,
        sink,
        dir,
    }
}

/// Create a small SQLite document at `path` with `rows` records.
pub fn create_doc_file(path: &Path, rows: usize) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE records (id INTEGER PRIMARY KEY, body TEXT NOT NULL);")
        .unwrap();
    for i in 0..rows {
        conn.execute(
            "INSERT INTO records (body) VALUES (?1)",
            [format!("row {i}")],
        )
        .unwrap();
    }
}

/// Append one record to the document at `path`.
pub fn edit_doc_file(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute("INSERT INTO records (body) VALUES ('edit')", [])
        .unwrap();
}

pub fn row_count(path: &Path) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
        .unwrap()
}

/// Row count of a database given as raw bytes (remote version content).
pub fn row_count_of_bytes(dir: &Path, data: &[u8]) -> i64 {
    let path = dir.join(format!("peek-{}.db", uuid::Uuid::new_v4().simple()));
    std::fs::write(&path, data).unwrap();
    let count = row_count(&path);
    std::fs::remove_file(&path).unwrap();
    count
}
