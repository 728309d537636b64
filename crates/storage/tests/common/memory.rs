//! In-memory versioned backend with scripted consistency faults.
//!
//! The real remote is eventually consistent; tests script the anomalies
//! explicitly: serve a stale version for the next N reads, hide the object
//! for the next N probes, or fail the next N uploads outright.

use async_trait::async_trait;
use bytes::Bytes;
use granary_core::Checksum;
use granary_storage::error::{StorageError, StorageResult};
use granary_storage::traits::{ExternalStorage, ObjectMeta, ObjectSnapshot};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

#[derive(Clone)]
struct Version {
    id: String,
    data: Bytes,
    modified: time::OffsetDateTime,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Vec<Version>>, // oldest..newest
    counter: u64,
    stale_reads: u32,
    hidden_probes: u32,
    failed_uploads: u32,
}

/// Scriptable in-memory object store.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the previous version for the next `n` head/download calls.
    pub fn serve_stale_reads(&self, n: u32) {
        self.state.lock().unwrap().stale_reads = n;
    }

    /// Report the object missing for the next `n` exists/download calls.
    pub fn hide_next_probes(&self, n: u32) {
        self.state.lock().unwrap().hidden_probes = n;
    }

    /// Fail the next `n` uploads.
    pub fn fail_next_uploads(&self, n: u32) {
        self.state.lock().unwrap().failed_uploads = n;
    }

    pub fn version_count(&self, key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    fn pick(versions: &[Version], snapshot_id: Option<&str>, stale: bool) -> Option<Version> {
        match snapshot_id {
            Some(id) => versions.iter().find(|v| v.id == id).cloned(),
            None if stale && versions.len() > 1 => versions.get(versions.len() - 2).cloned(),
            None => versions.last().cloned(),
        }
    }
}

#[async_trait]
impl ExternalStorage for MemoryBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.hidden_probes > 0 {
            state.hidden_probes -= 1;
            return Ok(false);
        }
        Ok(state.objects.get(key).map(|v| !v.is_empty()).unwrap_or(false))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let mut state = self.state.lock().unwrap();
        let stale = if state.stale_reads > 0 {
            state.stale_reads -= 1;
            true
        } else {
            false
        };
        let versions = state
            .objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let version = Self::pick(versions, None, stale)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: version.data.len() as u64,
            last_modified: Some(version.modified),
            checksum: Some(Checksum::compute(&version.data)),
            snapshot_id: Some(version.id),
        })
    }

    async fn upload(&self, key: &str, path: &Path) -> StorageResult<Option<String>> {
        let data = Bytes::from(std::fs::read(path)?);
        let mut state = self.state.lock().unwrap();
        if state.failed_uploads > 0 {
            state.failed_uploads -= 1;
            return Err(StorageError::S3("injected upload failure".into()));
        }
        state.counter += 1;
        let id = format!("m{:06}", state.counter);
        state.objects.entry(key.to_string()).or_default().push(Version {
            id: id.clone(),
            data,
            modified: time::OffsetDateTime::now_utc(),
        });
        Ok(Some(id))
    }

    async fn download(
        &self,
        key: &str,
        path: &Path,
        snapshot_id: Option<&str>,
    ) -> StorageResult<Option<String>> {
        let version = {
            let mut state = self.state.lock().unwrap();
            if state.hidden_probes > 0 {
                state.hidden_probes -= 1;
                return Err(StorageError::NotFound(key.to_string()));
            }
            let stale = if state.stale_reads > 0 {
                state.stale_reads -= 1;
                true
            } else {
                false
            };
            let versions = state
                .objects
                .get(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            Self::pick(versions, snapshot_id, stale)
                .ok_or_else(|| StorageError::NotFound(format!("{key} @ {snapshot_id:?}")))?
        };
        std::fs::write(path, &version.data)?;
        Ok(Some(version.id))
    }

    async fn remove(&self, key: &str, snapshot_ids: Option<&[String]>) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        match snapshot_ids {
            None => {
                state.objects.remove(key);
            }
            Some(ids) => {
                if let Some(versions) = state.objects.get_mut(key) {
                    versions.retain(|v| !ids.contains(&v.id));
                }
            }
        }
        Ok(())
    }

    async fn versions(&self, key: &str) -> StorageResult<Vec<ObjectSnapshot>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .get(key)
            .map(|versions| {
                versions
                    .iter()
                    .rev()
                    .map(|v| ObjectSnapshot {
                        snapshot_id: v.id.clone(),
                        last_modified: Some(v.modified),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
