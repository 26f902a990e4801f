//! In-memory [`ObjectStore`] driver for development and tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use nexus_core::{content_hash, KernelError, KernelResult};

use crate::pillar::objectstore::{ObjectStat, ObjectStore};

/// Blob storage backed by a concurrent map. Etags are content hashes.
pub struct MemoryObjectStore {
    backend_id: String,
    blobs: DashMap<String, Bytes>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            blobs: DashMap::new(),
        }
    }

    /// Number of stored blobs (test observability).
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    async fn put(&self, key: &str, bytes: Bytes) -> KernelResult<String> {
        let etag = content_hash(&bytes);
        self.blobs.insert(key.to_string(), bytes);
        Ok(etag)
    }

    async fn get(&self, key: &str) -> KernelResult<Bytes> {
        self.blobs
            .get(key)
            .map(|b| b.clone())
            .ok_or_else(|| KernelError::not_found(key))
    }

    async fn delete(&self, key: &str) -> KernelResult<()> {
        self.blobs.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> KernelResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .blobs
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn stat(&self, key: &str) -> KernelResult<ObjectStat> {
        let blob = self
            .blobs
            .get(key)
            .ok_or_else(|| KernelError::not_found(key))?;
        Ok(ObjectStat {
            size: blob.len() as u64,
            etag: content_hash(&blob),
        })
    }
}
