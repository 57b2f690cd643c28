use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::paths::{AppPaths, PathError};

// Blob storage abstractions.
//
// The pipeline addresses blobs by deterministic `(bucket, key)` pairs derived
// from document identifiers, so every write is overwrite-idempotent by
// construction: retrying a put lands on the same final path.

/// Opaque locator returned by `put`, `{bucket}/{key}`.
pub type Locator = String;

/// Minimal metadata returned alongside blob reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub size_bytes: u64,
    pub content_type: Option<String>,
}

/// Errors emitted by blob storage operations, always carrying the failed
/// operation and its target for the orchestrator's failure cause.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("{op} failed for bucket={bucket} key={key}: object not found")]
    NotFound {
        op: &'static str,
        bucket: String,
        key: String,
    },

    #[error("{op} failed for bucket={bucket} key={key}: {message}")]
    Io {
        op: &'static str,
        bucket: String,
        key: String,
        message: String,
    },

    #[error(transparent)]
    Path(#[from] PathError),
}

impl BlobError {
    fn io(op: &'static str, bucket: &str, key: &str, err: impl std::fmt::Display) -> Self {
        BlobError::Io {
            op,
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            message: err.to_string(),
        }
    }

    fn not_found(op: &'static str, bucket: &str, key: &str) -> Self {
        BlobError::NotFound {
            op,
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        }
    }
}

/// Trait abstracting over blob storage backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create the bucket if it does not exist. Idempotent.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobError>;

    /// Store the bytes under `(bucket, key)`, replacing any previous object.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<Locator, BlobError>;

    /// Return the bytes and metadata for `(bucket, key)`.
    async fn get(&self, bucket: &str, key: &str) -> Result<(Bytes, BlobMeta), BlobError>;

    /// Return metadata for `(bucket, key)` if present.
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<BlobMeta>, BlobError>;
}

/// Filesystem blob store implementation using the AppPaths layout.
///
/// Write strategy: stream to a temp file in the bucket directory, then
/// rename over the final path. Rename is atomic and replaces, which is the
/// overwrite-idempotent behavior the pipeline relies on. The content type is
/// kept in a `.meta` sidecar next to the object.
#[derive(Debug, Clone, bon::Builder)]
pub struct FsBlobStore {
    paths: AppPaths,
}

impl FsBlobStore {
    fn sidecar_name(key: &str) -> String {
        format!(".{key}.meta")
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobError> {
        self.paths.bucket_dir(bucket)?;
        Ok(())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<Locator, BlobError> {
        let final_path = self.paths.object_path(bucket, key)?;
        let dir = self.paths.bucket_dir(bucket)?;
        let temp_path = dir.join(format!(".{key}.tmp-{}", Uuid::new_v4()));

        fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| BlobError::io("put", bucket, key, e))?;

        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(BlobError::io("put", bucket, key, e));
        }

        let sidecar = dir.join(Self::sidecar_name(key));
        fs::write(&sidecar, content_type.as_bytes())
            .await
            .map_err(|e| BlobError::io("put", bucket, key, e))?;

        tracing::debug!(bucket, key, size_bytes = bytes.len(), "stored blob");
        Ok(format!("{bucket}/{key}"))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<(Bytes, BlobMeta), BlobError> {
        let path = self.paths.object_path(bucket, key)?;

        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobError::not_found("get", bucket, key)
            } else {
                BlobError::io("get", bucket, key, e)
            }
        })?;

        let sidecar = self.paths.bucket_dir(bucket)?.join(Self::sidecar_name(key));
        let content_type = fs::read_to_string(&sidecar).await.ok();

        let size_bytes = data.len() as u64;
        Ok((
            Bytes::from(data),
            BlobMeta {
                size_bytes,
                content_type,
            },
        ))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<BlobMeta>, BlobError> {
        let path = self.paths.object_path(bucket, key)?;

        match fs::metadata(&path).await {
            Ok(meta) => {
                let sidecar = self.paths.bucket_dir(bucket)?.join(Self::sidecar_name(key));
                let content_type = fs::read_to_string(&sidecar).await.ok();
                Ok(Some(BlobMeta {
                    size_bytes: meta.len(),
                    content_type,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::io("head", bucket, key, e)),
        }
    }
}
