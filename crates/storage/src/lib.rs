//! Versioned external object storage for the granary document host.
//!
//! This crate provides:
//! - The `ExternalStorage` trait: whole-file objects with native versions
//! - Backends: local filesystem and S3-compatible
//! - `ChecksummedStorage`: hash-verified wrapper masking eventual
//!   consistency behind an authoritative hash register

pub mod backends;
pub mod checksummed;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use checksummed::{
    ChecksummedOptions, ChecksummedStorage, FileHashRegister, HashRegister, MemoryHashRegister,
};
pub use error::{StorageError, StorageResult};
pub use traits::{ExternalStorage, ObjectMeta, ObjectSnapshot};

use granary_core::StorageConfig;
use std::sync::Arc;

/// Create a raw object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ExternalStorage>> {
    config
        .validate()
        .map_err(|e| StorageError::Config(e.to_string()))?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempfile::tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        assert!(!store.exists("anything").await.unwrap());
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn from_config_rejects_empty_filesystem_path() {
        let config = StorageConfig::Filesystem {
            path: PathBuf::new(),
        };
        assert!(matches!(
            from_config(&config).await,
            Err(StorageError::Config(_))
        ));
    }
}
