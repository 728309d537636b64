//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Debounce window between an edit and the push of a new snapshot.
pub const GRIST_BACKUP_DELAY_SECS: &str = "GRIST_BACKUP_DELAY_SECS";

/// Set to "true" to run without remote storage entirely.
pub const GRIST_DISABLE_S3: &str = "GRIST_DISABLE_S3";

/// Tuning options for the hosted storage manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostedOptions {
    /// Seconds to wait after the latest change before pushing a snapshot.
    #[serde(default = "default_seconds_before_push")]
    pub seconds_before_push: u64,
    /// First retry delay after a failed push; doubles on each failure.
    #[serde(default = "default_seconds_before_first_retry")]
    pub seconds_before_first_retry: u64,
    /// Whether "last edited" times are pushed to the home database.
    #[serde(default = "default_push_doc_update_times")]
    pub push_doc_update_times: bool,
}

fn default_seconds_before_push() -> u64 {
    15
}

fn default_seconds_before_first_retry() -> u64 {
    3
}

fn default_push_doc_update_times() -> bool {
    true
}

impl Default for HostedOptions {
    fn default() -> Self {
        Self {
            seconds_before_push: default_seconds_before_push(),
            seconds_before_first_retry: default_seconds_before_first_retry(),
            push_doc_update_times: default_push_doc_update_times(),
        }
    }
}

impl HostedOptions {
    /// Defaults with `GRIST_BACKUP_DELAY_SECS` applied. The environment is
    /// read once here, at construction, never again afterwards.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(raw) = std::env::var(GRIST_BACKUP_DELAY_SECS) {
            if let Ok(secs) = raw.trim().parse::<u64>() {
                options.seconds_before_push = secs;
            }
        }
        options
    }

    pub fn delay_before_push(&self) -> Duration {
        Duration::from_secs(self.seconds_before_push)
    }

    pub fn first_retry_delay(&self) -> Duration {
        Duration::from_secs(self.seconds_before_first_retry)
    }
}

/// Check `GRIST_DISABLE_S3` once. Callers capture the result per instance.
pub fn remote_disabled_from_env() -> bool {
    std::env::var(GRIST_DISABLE_S3)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// External storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage (testing and single-node deployments).
    Filesystem {
        /// Root directory for stored objects.
        path: PathBuf,
    },
    /// S3-compatible storage with object versioning enabled on the bucket.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// Optional region; defaults to us-east-1.
        region: Option<String>,
        /// Optional key prefix inside the bucket.
        prefix: Option<String>,
        /// Optional explicit credentials; both or neither must be set.
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        /// Use path-style URLs; required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl StorageConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> crate::Result<()> {
        match self {
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err(crate::Error::Config(
                        "filesystem storage requires a non-empty path".to_string(),
                    ));
                }
            }
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err(crate::Error::Config(
                        "s3 storage requires a bucket".to_string(),
                    ));
                }
                if access_key_id.is_some() != secret_access_key.is_some() {
                    return Err(crate::Error::Config(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = HostedOptions::default();
        assert_eq!(options.seconds_before_push, 15);
        assert_eq!(options.seconds_before_first_retry, 3);
        assert!(options.push_doc_update_times);
    }

    #[test]
    fn test_storage_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_config_filesystem_ok() {
        let config = StorageConfig::Filesystem {
            path: PathBuf::from("/tmp/objects"),
        };
        config.validate().unwrap();
    }
}
