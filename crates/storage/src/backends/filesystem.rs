//! Local filesystem storage backend.
//!
//! Each key maps to a directory holding one file per version. Version ids
//! are `v<zero-padded millis>-<uuid>`, so lexical order is creation order
//! and ids never collide under concurrent uploads. Writes go through a
//! temp file plus rename.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ExternalStorage, ObjectMeta, ObjectSnapshot};
use async_trait::async_trait;
use granary_core::Checksum;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Directory holding the versions of a key, with traversal protection.
    fn key_dir(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "contains unsafe path component: {key}"
                    )));
                }
            }
        }
        Ok(self.root.join(key))
    }

    fn new_version_id() -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("v{:016}-{}", millis, Uuid::new_v4().simple())
    }

    /// List version file names for a key, newest first. Absent key lists
    /// empty.
    async fn version_names(&self, key: &str) -> StorageResult<Vec<String>> {
        let dir = self.key_dir(key)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('v') && entry.file_type().await?.is_file() {
                names.push(name);
            }
        }
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// Resolve a snapshot id (or the latest version) to its file path.
    async fn version_path(&self, key: &str, snapshot_id: Option<&str>) -> StorageResult<PathBuf> {
        let dir = self.key_dir(key)?;
        match snapshot_id {
            Some(id) => {
                let path = dir.join(id);
                if fs::try_exists(&path).await? {
                    Ok(path)
                } else {
                    Err(StorageError::NotFound(format!("{key} @ {id}")))
                }
            }
            None => {
                let names = self.version_names(key).await?;
                match names.first() {
                    Some(name) => Ok(dir.join(name)),
                    None => Err(StorageError::NotFound(key.to_string())),
                }
            }
        }
    }
}

#[async_trait]
impl ExternalStorage for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(!self.version_names(key).await?.is_empty())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.version_path(key, None).await?;
        let metadata = fs::metadata(&path).await?;
        let checksum = Checksum::of_file(&path).await?;
        let snapshot_id = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string());

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
            checksum: Some(checksum),
            snapshot_id,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn upload(&self, key: &str, path: &Path) -> StorageResult<Option<String>> {
        let dir = self.key_dir(key)?;
        fs::create_dir_all(&dir).await?;

        let version = Self::new_version_id();
        let temp_path = dir.join(format!(".tmp.{}", Uuid::new_v4()));
        let data = fs::read(path).await?;
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, dir.join(&version)).await?;

        Ok(Some(version))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn download(
        &self,
        key: &str,
        path: &Path,
        snapshot_id: Option<&str>,
    ) -> StorageResult<Option<String>> {
        let source = self.version_path(key, snapshot_id).await?;
        fs::copy(&source, path).await?;
        Ok(source
            .file_name()
            .map(|name| name.to_string_lossy().to_string()))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn remove(&self, key: &str, snapshot_ids: Option<&[String]>) -> StorageResult<()> {
        let dir = self.key_dir(key)?;
        match snapshot_ids {
            None => match fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io(e)),
            },
            Some(ids) => {
                for id in ids {
                    match fs::remove_file(dir.join(id)).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(StorageError::Io(e)),
                    }
                }
                Ok(())
            }
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn versions(&self, key: &str) -> StorageResult<Vec<ObjectSnapshot>> {
        let dir = self.key_dir(key)?;
        let mut snapshots = Vec::new();
        for name in self.version_names(key).await? {
            let last_modified = fs::metadata(dir.join(&name))
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| t.into());
            snapshots.push(ObjectSnapshot {
                snapshot_id: name,
                last_modified,
            });
        }
        Ok(snapshots)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_temp(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("store")).await.unwrap();
        let source = write_temp(dir.path(), "in", b"payload").await;

        let version = backend.upload("docs/a.grist", &source).await.unwrap();
        assert!(version.is_some());
        assert!(backend.exists("docs/a.grist").await.unwrap());

        let dest = dir.path().join("out");
        backend.download("docs/a.grist", &dest, None).await.unwrap();
        assert_eq!(fs::read(&dest).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_versions_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("store")).await.unwrap();

        let first = write_temp(dir.path(), "v1", b"one").await;
        let second = write_temp(dir.path(), "v2", b"two").await;
        let v1 = backend.upload("k", &first).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let v2 = backend.upload("k", &second).await.unwrap().unwrap();

        let versions = backend.versions("k").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].snapshot_id, v2);
        assert_eq!(versions[1].snapshot_id, v1);

        // Specific version fetch returns the older content.
        let dest = dir.path().join("old");
        backend.download("k", &dest, Some(&v1)).await.unwrap();
        assert_eq!(fs::read(&dest).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_remove_all_and_specific() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("store")).await.unwrap();
        let source = write_temp(dir.path(), "in", b"x").await;

        let v1 = backend.upload("k", &source).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        backend.upload("k", &source).await.unwrap().unwrap();

        backend.remove("k", Some(&[v1])).await.unwrap();
        assert_eq!(backend.versions("k").await.unwrap().len(), 1);

        backend.remove("k", None).await.unwrap();
        assert!(!backend.exists("k").await.unwrap());
        // Removing an absent object stays quiet.
        backend.remove("k", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_head_reports_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("store")).await.unwrap();
        let source = write_temp(dir.path(), "in", b"digest me").await;

        backend.upload("k", &source).await.unwrap();
        let meta = backend.head("k").await.unwrap();
        assert_eq!(meta.size, 9);
        assert_eq!(meta.checksum, Some(Checksum::compute(b"digest me")));
        assert!(meta.snapshot_id.is_some());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("store")).await.unwrap();

        assert!(backend.exists("../escape").await.is_err());
        assert!(backend.exists("/absolute/path").await.is_err());
        assert!(backend.exists("foo/../bar").await.is_err());

        assert!(backend.exists("valid/nested/key").await.is_ok());
    }
}
