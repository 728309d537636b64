//! Checksum-verified wrapper over a raw storage backend.
//!
//! Object stores are eventually consistent: a HEAD right after a PUT may
//! describe the previous version, and a GET may serve one. The wrapper
//! masks this by trusting an external hash register over anything the
//! backend reports. The register (the worker directory in production) is
//! written only after a verified upload, so on any disagreement the
//! register wins and the remote operation is retried with backoff until
//! the store catches up. Once retries are exhausted the wrapper fails
//! rather than return data that contradicts a known hash.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ExternalStorage, ObjectMeta, ObjectSnapshot};
use async_trait::async_trait;
use granary_core::{Checksum, DELETED_SENTINEL};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// A keyed register of content hashes (hex strings, or a sentinel).
///
/// `save(key, None)` clears the entry. Implementations back this with the
/// worker directory, local sidecar files, or plain memory.
#[async_trait]
pub trait HashRegister: Send + Sync + 'static {
    async fn load(&self, key: &str) -> StorageResult<Option<String>>;
    async fn save(&self, key: &str, value: Option<&str>) -> StorageResult<()>;
}

/// In-process hash register.
#[derive(Default)]
pub struct MemoryHashRegister {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryHashRegister {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HashRegister for MemoryHashRegister {
    async fn load(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.map.lock().expect("register poisoned").get(key).cloned())
    }

    async fn save(&self, key: &str, value: Option<&str>) -> StorageResult<()> {
        let mut map = self.map.lock().expect("register poisoned");
        match value {
            Some(v) => {
                map.insert(key.to_string(), v.to_string());
            }
            None => {
                map.remove(key);
            }
        }
        Ok(())
    }
}

/// Hash register backed by one small file per key (the `-hash` sidecars).
pub struct FileHashRegister {
    path_for: Box<dyn Fn(&str) -> PathBuf + Send + Sync>,
}

impl FileHashRegister {
    /// `path_for` maps a storage key to the sidecar file holding its hash.
    pub fn new(path_for: impl Fn(&str) -> PathBuf + Send + Sync + 'static) -> Self {
        Self {
            path_for: Box::new(path_for),
        }
    }
}

#[async_trait]
impl HashRegister for FileHashRegister {
    async fn load(&self, key: &str) -> StorageResult<Option<String>> {
        match tokio::fs::read_to_string((self.path_for)(key)).await {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn save(&self, key: &str, value: Option<&str>) -> StorageResult<()> {
        let path = (self.path_for)(key);
        match value {
            Some(v) => tokio::fs::write(&path, v).await.map_err(StorageError::Io),
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io(e)),
            },
        }
    }
}

/// Retry tuning for the checksummed wrapper.
#[derive(Clone, Debug)]
pub struct ChecksummedOptions {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
}

impl Default for ChecksummedOptions {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

/// Checksum-verified storage.
pub struct ChecksummedStorage {
    inner: Arc<dyn ExternalStorage>,
    shared_hash: Arc<dyn HashRegister>,
    local_hash: Arc<dyn HashRegister>,
    latest_version: MemoryHashRegister,
    options: ChecksummedOptions,
}

impl ChecksummedStorage {
    pub fn new(
        inner: Arc<dyn ExternalStorage>,
        shared_hash: Arc<dyn HashRegister>,
        local_hash: Arc<dyn HashRegister>,
        options: ChecksummedOptions,
    ) -> Self {
        Self {
            inner,
            shared_hash,
            local_hash,
            latest_version: MemoryHashRegister::new(),
            options,
        }
    }

    /// The most recently observed version id for a key, if any.
    pub async fn latest_version(&self, key: &str) -> Option<String> {
        self.latest_version.load(key).await.ok().flatten()
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.options.max_delay)
    }

    /// The authoritative hash for a key, decoded; `Ok(None)` when unknown
    /// or tombstoned (tombstones are handled by the callers).
    async fn expected_hash(&self, key: &str) -> StorageResult<(Option<Checksum>, bool)> {
        match self.shared_hash.load(key).await? {
            None => Ok((None, false)),
            Some(v) if v == DELETED_SENTINEL => Ok((None, true)),
            Some(v) => {
                let sum = Checksum::from_hex(&v).map_err(|e| {
                    StorageError::Register(format!("bad shared hash for {key}: {e}"))
                })?;
                Ok((Some(sum), false))
            }
        }
    }
}

#[async_trait]
impl ExternalStorage for ChecksummedStorage {
    /// HEAD with hash-aware retry: when the register knows the object is
    /// present (or tombstoned), a disagreeing answer is treated as a stale
    /// read and retried.
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let expectation = match self.shared_hash.load(key).await? {
            None => return self.inner.exists(key).await,
            Some(v) => v != DELETED_SENTINEL,
        };

        let mut delay = self.options.initial_delay;
        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = self.next_delay(delay);
            }
            match self.inner.exists(key).await {
                Ok(seen) if seen == expectation => return Ok(seen),
                Ok(seen) => {
                    warn!(key, attempt, seen, expectation, "existence check disagrees with shared hash");
                }
                Err(e) => {
                    warn!(key, attempt, error = %e, "existence check failed");
                }
            }
        }
        Err(StorageError::RetriesExhausted {
            op: "exists",
            key: key.to_string(),
            attempts: self.options.max_retries + 1,
        })
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    /// Upload with read-after-write verification. The new content hash is
    /// committed to the shared and local registers only once a HEAD agrees
    /// (or the backend cannot report digests).
    async fn upload(&self, key: &str, path: &Path) -> StorageResult<Option<String>> {
        let checksum = Checksum::of_file(path).await?;
        let hex = checksum.to_hex();

        let mut delay = self.options.initial_delay;
        let mut last_error: Option<StorageError> = None;
        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = self.next_delay(delay);
            }

            let version = match self.inner.upload(key, path).await {
                Ok(version) => version,
                Err(e) => {
                    warn!(key, attempt, error = %e, "upload attempt failed");
                    last_error = Some(e);
                    continue;
                }
            };

            match self.inner.head(key).await {
                Ok(meta) => {
                    if let Some(seen) = meta.checksum {
                        if seen != checksum {
                            warn!(key, attempt, expected = %hex, seen = %seen,
                                "upload not yet visible, retrying");
                            last_error = None;
                            continue;
                        }
                    }
                    self.shared_hash.save(key, Some(&hex)).await?;
                    self.local_hash.save(key, Some(&hex)).await?;
                    let version = version.or(meta.snapshot_id);
                    if let Some(v) = &version {
                        self.latest_version.save(key, Some(v)).await?;
                    }
                    return Ok(version);
                }
                Err(e) => {
                    warn!(key, attempt, error = %e, "post-upload head failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(StorageError::RetriesExhausted {
            op: "upload",
            key: key.to_string(),
            attempts: self.options.max_retries + 1,
        }))
    }

    /// Download with digest verification against the shared hash (latest
    /// fetches only; snapshot fetches are pinned by version id and need no
    /// masking). Content lands in a temp sibling and is renamed into place
    /// only after it verifies.
    async fn download(
        &self,
        key: &str,
        path: &Path,
        snapshot_id: Option<&str>,
    ) -> StorageResult<Option<String>> {
        let (expected, deleted) = if snapshot_id.is_none() {
            self.expected_hash(key).await?
        } else {
            (None, false)
        };
        if deleted {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let temp_path = path.with_file_name(format!(
            "{}.fetch-{}",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            Uuid::new_v4().simple()
        ));

        let mut delay = self.options.initial_delay;
        let mut mismatch: Option<(String, String)> = None;
        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = self.next_delay(delay);
            }

            let version = match self.inner.download(key, &temp_path, snapshot_id).await {
                Ok(version) => version,
                Err(StorageError::NotFound(_)) if expected.is_some() => {
                    // The register says it exists; the store is behind.
                    warn!(key, attempt, "object not yet visible, retrying");
                    continue;
                }
                Err(e @ StorageError::NotFound(_)) => return Err(e),
                Err(e) => {
                    warn!(key, attempt, error = %e, "download attempt failed");
                    continue;
                }
            };

            let actual = Checksum::of_file(&temp_path).await?;
            if let Some(exp) = expected {
                if exp != actual {
                    warn!(key, attempt, expected = %exp, actual = %actual,
                        "downloaded stale content, retrying");
                    mismatch = Some((exp.to_hex(), actual.to_hex()));
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    continue;
                }
            }

            tokio::fs::rename(&temp_path, path).await?;
            self.local_hash.save(key, Some(&actual.to_hex())).await?;
            if let Some(v) = &version {
                if snapshot_id.is_none() {
                    self.latest_version.save(key, Some(v)).await?;
                }
            }
            return Ok(version);
        }

        let _ = tokio::fs::remove_file(&temp_path).await;
        match mismatch {
            Some((expected, actual)) => Err(StorageError::HashMismatch {
                key: key.to_string(),
                expected,
                actual,
            }),
            None => Err(StorageError::RetriesExhausted {
                op: "download",
                key: key.to_string(),
                attempts: self.options.max_retries + 1,
            }),
        }
    }

    /// Remove versions; a full removal tombstones the shared hash so later
    /// reads cannot resurrect the object from a lagging replica.
    async fn remove(&self, key: &str, snapshot_ids: Option<&[String]>) -> StorageResult<()> {
        self.inner.remove(key, snapshot_ids).await?;
        if snapshot_ids.is_none() {
            self.shared_hash.save(key, Some(DELETED_SENTINEL)).await?;
            self.local_hash.save(key, None).await?;
            self.latest_version.save(key, None).await?;
        }
        Ok(())
    }

    async fn versions(&self, key: &str) -> StorageResult<Vec<ObjectSnapshot>> {
        self.inner.versions(key).await
    }

    fn backend_name(&self) -> &'static str {
        "checksummed"
    }
}
