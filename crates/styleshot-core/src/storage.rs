//! Durable object storage interface and the deterministic upload key scheme

use crate::error::{PipelineError, Result};
use crate::models::JobId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Build the deterministic object key for a rendered variant:
/// `{namespace}/{account}/{job}/v{version}/{variant}.{ext}`
pub fn object_key(
    namespace: &str,
    account_id: &str,
    job_id: JobId,
    pipeline_version: u32,
    variant: &str,
    extension: &str,
) -> String {
    format!(
        "{}/{}/{}/v{}/{}.{}",
        namespace, account_id, job_id, pipeline_version, variant, extension
    )
}

/// External durable object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;
}

/// Filesystem-backed object store used by the CLI and local development
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Storage {
                    message: format!("Failed to create object directory: {}", e),
                })?;
        }

        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::Storage {
                message: format!("Failed to write object {}: {}", key, e),
            })?;

        tracing::debug!(key, content_type, size = bytes.len(), "object stored");
        Ok(())
    }
}

/// In-memory object store for tests
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, (Vec<u8>, String)>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(())
    }
}

/// Object store that fails every put; used to exercise retry behavior
#[derive(Debug, Default)]
pub struct FailingObjectStore;

#[async_trait]
impl ObjectStore for FailingObjectStore {
    async fn put(&self, key: &str, _bytes: &[u8], _content_type: &str) -> Result<()> {
        Err(PipelineError::Storage {
            message: format!("Injected storage failure for {}", key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_key_scheme_is_deterministic() {
        let job_id = Uuid::nil();
        let key = object_key("renders", "acct-1", job_id, 3, "square", "webp");
        assert_eq!(
            key,
            format!("renders/acct-1/{}/v3/square.webp", job_id)
        );
    }

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(temp_dir.path().to_path_buf());

        let key = object_key("renders", "acct-1", Uuid::new_v4(), 1, "square", "jpg");
        store.put(&key, b"bytes", "image/jpeg").await.unwrap();

        let written = tokio::fs::read(store.path_for(&key)).await.unwrap();
        assert_eq!(written, b"bytes");
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryObjectStore::new();
        store.put("a/b/c.jpg", b"bytes", "image/jpeg").await.unwrap();

        let (bytes, content_type) = store.get("a/b/c.jpg").await.unwrap();
        assert_eq!(bytes, b"bytes");
        assert_eq!(content_type, "image/jpeg");
    }
}
