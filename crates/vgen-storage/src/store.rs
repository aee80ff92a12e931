//! The artifact store contract.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;
use vgen_models::{ArtifactRef, ContentKind, TaskId};

use crate::error::{StorageError, StorageOp, StorageResult};

/// Write-once blob storage.
///
/// A key is written at most once; a second `put` to the same key fails with
/// [`StorageError::AlreadyExists`] and leaves the stored object untouched.
/// Stored objects are safe to read concurrently.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key`.
    async fn put(
        &self,
        key: &str,
        kind: ContentKind,
        task_id: Option<&TaskId>,
        bytes: &[u8],
    ) -> StorageResult<ArtifactRef>;

    /// Read the object behind `artifact`.
    async fn get(&self, artifact: &ArtifactRef) -> StorageResult<Vec<u8>>;

    /// Size of the object at `key`, or `None` if absent.
    async fn head(&self, key: &str) -> StorageResult<Option<u64>>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Keys under `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.head(key).await?.is_some())
    }

    /// Reference an already stored object.
    async fn existing(
        &self,
        key: &str,
        kind: ContentKind,
        task_id: Option<&TaskId>,
    ) -> StorageResult<Option<ArtifactRef>> {
        Ok(self
            .head(key)
            .await?
            .map(|size| ArtifactRef::new(task_id.cloned(), key, kind, size)))
    }

    /// Download an object to a local file.
    async fn download_to(&self, artifact: &ArtifactRef, path: &Path) -> StorageResult<()> {
        debug!("Downloading {} to {}", artifact.key, path.display());
        let bytes = self.get(artifact).await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::backend(StorageOp::Get, &artifact.key, e))?;
        }

        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| StorageError::backend(StorageOp::Get, &artifact.key, e))?;
        Ok(())
    }

    /// Upload a local file.
    async fn upload_file(
        &self,
        path: &Path,
        key: &str,
        kind: ContentKind,
        task_id: Option<&TaskId>,
    ) -> StorageResult<ArtifactRef> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::backend(StorageOp::Put, key, e))?;
        self.put(key, kind, task_id, &bytes).await
    }

    /// Delete every object under `prefix`. Returns the number deleted.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u32> {
        let keys = self.list_keys(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len() as u32)
    }
}
