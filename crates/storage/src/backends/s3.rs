//! S3-compatible storage backend using the AWS SDK.
//!
//! Snapshots ride on native object versioning: the bucket must have
//! versioning enabled, uploads return the new version id, and downloads
//! and deletes accept one.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ExternalStorage, ObjectMeta, ObjectSnapshot};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use granary_core::Checksum;
use std::path::Path;
use tracing::instrument;

/// Maximum object identifiers per DeleteObjects request.
const DELETE_BATCH: usize = 1000;

/// S3-compatible versioned object store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// # Arguments
    /// * `force_path_style` - Use path-style URLs (`endpoint/bucket/key`)
    ///   instead of virtual-hosted style. Required for MinIO and some
    ///   S3-compatible services.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() != secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base);

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            builder = builder.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key_id,
                secret,
                None,
                None,
                "granary-config",
            ));
        }

        // Bare host:port endpoints (e.g. "minio:9000") get an http scheme.
        let normalized_endpoint = endpoint.map(|url| {
            let lower = url.to_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                url
            } else {
                format!("http://{url}")
            }
        });
        if let Some(url) = &normalized_endpoint {
            builder = builder.endpoint_url(url);
        }
        if force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = Client::from_conf(builder.build());
        let stored_endpoint = normalized_endpoint
            .unwrap_or_else(|| format!("s3.{resolved_region}.amazonaws.com"));
        let normalized_prefix = prefix.map(|p| p.trim_end_matches('/').to_string());

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalized_prefix,
            endpoint: stored_endpoint,
        })
    }

    /// Get the full object key (applies the prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Convert an AWS SDK error to StorageError, mapping 404s to NotFound.
    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
            if service_err.raw().status().as_u16() == 404 {
                return StorageError::NotFound(key.to_string());
            }
        }
        StorageError::S3(Box::new(err))
    }

    /// List every version (and delete marker) of a single key.
    async fn list_key_versions(
        &self,
        full_key: &str,
    ) -> StorageResult<Vec<(String, Option<time::OffsetDateTime>)>> {
        let mut results = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_object_versions()
                .bucket(&self.bucket)
                .prefix(full_key);
            if let Some(marker) = key_marker.take() {
                request = request.key_marker(marker);
            }
            if let Some(marker) = version_marker.take() {
                request = request.version_id_marker(marker);
            }

            let output = request
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, full_key))?;

            for version in output.versions() {
                if version.key() == Some(full_key) {
                    if let Some(id) = version.version_id() {
                        let modified = version
                            .last_modified()
                            .and_then(|dt| time::OffsetDateTime::from_unix_timestamp(dt.secs()).ok());
                        results.push((id.to_string(), modified));
                    }
                }
            }
            for marker in output.delete_markers() {
                if marker.key() == Some(full_key) {
                    if let Some(id) = marker.version_id() {
                        results.push((id.to_string(), None));
                    }
                }
            }

            if output.is_truncated() == Some(true) {
                key_marker = output.next_key_marker().map(|s| s.to_string());
                version_marker = output.next_version_id_marker().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(results)
    }
}

/// Parse an S3 ETag into a content checksum. Whole-object puts carry the
/// MD5 as a quoted hex string; multipart ETags contain a part-count suffix
/// and are not digests.
fn checksum_from_etag(etag: Option<&str>) -> Option<Checksum> {
    let trimmed = etag?.trim_matches('"');
    if trimmed.contains('-') {
        return None;
    }
    Checksum::from_hex(trimmed).ok()
}

#[async_trait]
impl ExternalStorage for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let full_key = self.full_key(key);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
                    if service_err.raw().status().as_u16() == 404 {
                        return Ok(false);
                    }
                }
                Err(StorageError::S3(Box::new(err)))
            }
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let last_modified = output
            .last_modified()
            .and_then(|dt| time::OffsetDateTime::from_unix_timestamp(dt.secs()).ok());

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0) as u64,
            last_modified,
            checksum: checksum_from_etag(output.e_tag()),
            snapshot_id: output.version_id().map(|s| s.to_string()),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn upload(&self, key: &str, path: &Path) -> StorageResult<Option<String>> {
        let full_key = self.full_key(key);
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(body)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        Ok(output.version_id().map(|s| s.to_string()))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn download(
        &self,
        key: &str,
        path: &Path,
        snapshot_id: Option<&str>,
    ) -> StorageResult<Option<String>> {
        let full_key = self.full_key(key);
        let mut request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key);
        if let Some(id) = snapshot_id {
            request = request.version_id(id);
        }

        let output = request
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        let version = output.version_id().map(|s| s.to_string());

        let mut reader = output.body.into_async_read();
        let mut file = tokio::fs::File::create(path).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;

        Ok(version)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn remove(&self, key: &str, snapshot_ids: Option<&[String]>) -> StorageResult<()> {
        let full_key = self.full_key(key);

        let targets: Vec<String> = match snapshot_ids {
            Some(ids) => ids.to_vec(),
            None => self
                .list_key_versions(&full_key)
                .await?
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
        };
        if targets.is_empty() {
            return Ok(());
        }

        for batch in targets.chunks(DELETE_BATCH) {
            let mut identifiers = Vec::with_capacity(batch.len());
            for id in batch {
                let identifier = ObjectIdentifier::builder()
                    .key(&full_key)
                    .version_id(id)
                    .build()
                    .map_err(|e| StorageError::S3(Box::new(e)))?;
                identifiers.push(identifier);
            }
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .quiet(true)
                .build()
                .map_err(|e| StorageError::S3(Box::new(e)))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, key))?;
        }

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn versions(&self, key: &str) -> StorageResult<Vec<ObjectSnapshot>> {
        let full_key = self.full_key(key);
        Ok(self
            .list_key_versions(&full_key)
            .await?
            .into_iter()
            .map(|(snapshot_id, last_modified)| ObjectSnapshot {
                snapshot_id,
                last_modified,
            })
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
