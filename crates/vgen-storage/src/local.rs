//! Local directory artifact store.
//!
//! Objects are written to a hidden temp file in the target directory and then
//! hard-linked into place. The link fails if the key already exists, which
//! gives write-once semantics even with concurrent writers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;
use vgen_models::{ArtifactRef, ContentKind, TaskId};

use crate::error::{StorageError, StorageOp, StorageResult};
use crate::keys::validate_key;
use crate::store::ArtifactStore;

/// Store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        info!("Using local artifact store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn put(
        &self,
        key: &str,
        kind: ContentKind,
        task_id: Option<&TaskId>,
        bytes: &[u8],
    ) -> StorageResult<ArtifactRef> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::invalid_key(key, "no parent directory"))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::backend(StorageOp::Put, key, e))?;

        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StorageError::backend(StorageOp::Put, key, e))?;

        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => {
                debug!("Stored {} bytes at {}", bytes.len(), key);
                Ok(ArtifactRef::new(task_id.cloned(), key, kind, bytes.len() as u64))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StorageError::already_exists(key)),
            Err(e) => Err(StorageError::backend(StorageOp::Put, key, e)),
        }
    }

    async fn get(&self, artifact: &ArtifactRef) -> StorageResult<Vec<u8>> {
        let path = self.path_for(&artifact.key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::not_found(&artifact.key)),
            Err(e) => Err(StorageError::backend(StorageOp::Get, &artifact.key, e)),
        }
    }

    async fn head(&self, key: &str) -> StorageResult<Option<u64>> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::backend(StorageOp::Delete, key, e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::backend(StorageOp::List, prefix, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::backend(StorageOp::List, prefix, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::backend(StorageOp::List, prefix, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(".tmp-") {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
