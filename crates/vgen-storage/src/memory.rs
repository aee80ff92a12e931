//! In-memory artifact store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use vgen_models::{ArtifactRef, ContentKind, TaskId};

use crate::error::{StorageError, StorageResult};
use crate::keys::validate_key;
use crate::store::ArtifactStore;

/// Process-local store. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    puts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        kind: ContentKind,
        task_id: Option<&TaskId>,
        bytes: &[u8],
    ) -> StorageResult<ArtifactRef> {
        validate_key(key)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Err(StorageError::already_exists(key));
        }
        objects.insert(key.to_string(), bytes.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(ArtifactRef::new(task_id.cloned(), key, kind, bytes.len() as u64))
    }

    async fn get(&self, artifact: &ArtifactRef) -> StorageResult<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(&artifact.key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(&artifact.key))
    }

    async fn head(&self, key: &str) -> StorageResult<Option<u64>> {
        Ok(self
            .objects
            .read()
            .await
            .get(key)
            .map(|bytes| bytes.len() as u64))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_is_write_once() {
        let store = MemoryStore::new();
        let task = TaskId::from_string("scene-000-image");

        let first = store
            .put("runs/r/scenes/000/image.png", ContentKind::Image, Some(&task), b"png")
            .await
            .unwrap();
        assert_eq!(first.size, 3);
        assert_eq!(first.task_id, Some(task.clone()));

        let second = store
            .put("runs/r/scenes/000/image.png", ContentKind::Image, Some(&task), b"other")
            .await;
        assert!(matches!(second, Err(StorageError::AlreadyExists(_))));
        assert_eq!(store.get(&first).await.unwrap(), b"png");
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_existing_and_delete_prefix() {
        let store = MemoryStore::new();
        store
            .put("runs/a/scenes/000/voice.mp3", ContentKind::Audio, None, b"mp3")
            .await
            .unwrap();
        store
            .put("runs/b/scenes/000/voice.mp3", ContentKind::Audio, None, b"mp3")
            .await
            .unwrap();

        let found = store
            .existing("runs/a/scenes/000/voice.mp3", ContentKind::Audio, None)
            .await
            .unwrap();
        assert_eq!(found.map(|a| a.size), Some(3));
        assert!(!store.exists("runs/a/missing").await.unwrap());

        assert_eq!(store.delete_prefix("runs/a/").await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }
}
