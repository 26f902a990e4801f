//! Local-filesystem [`ObjectStore`] driver.
//!
//! Blobs live under a root directory, addressed by their opaque key. Puts
//! write to a temp file in the same filesystem and rename into place, so a
//! concurrent reader sees the prior blob or the new one, never a partial.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use nexus_core::{content_hash, KernelError, KernelResult};

use crate::pillar::objectstore::{ObjectStat, ObjectStore};

const TMP_DIR: &str = ".tmp";

/// Blob storage rooted at a local directory.
pub struct FsObjectStore {
    backend_id: String,
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates the driver, ensuring the root and temp directories exist.
    pub fn open(backend_id: impl Into<String>, root: impl AsRef<Path>) -> KernelResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(TMP_DIR))
            .map_err(|e| KernelError::unavailable(format!("object root: {e}")))?;
        Ok(Self {
            backend_id: backend_id.into(),
            root,
        })
    }

    /// Maps an opaque key to a path under the root.
    ///
    /// Keys are validated against traversal: no absolute keys, no `..`
    /// segments, no empty segments.
    fn key_path(&self, key: &str) -> KernelResult<PathBuf> {
        if key.is_empty() || key.starts_with('/') {
            return Err(KernelError::invalid_argument(format!(
                "invalid object key: {key:?}"
            )));
        }
        let mut path = self.root.clone();
        for seg in key.split('/') {
            if seg.is_empty() || seg == "." || seg == ".." {
                return Err(KernelError::invalid_argument(format!(
                    "invalid object key: {key:?}"
                )));
            }
            path.push(seg);
        }
        Ok(path)
    }

    fn io_err(e: &std::io::Error, key: &str) -> KernelError {
        if e.kind() == std::io::ErrorKind::NotFound {
            KernelError::not_found(key)
        } else {
            KernelError::unavailable(format!("object io on {key}: {e}"))
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    async fn put(&self, key: &str, bytes: Bytes) -> KernelResult<String> {
        let dest = self.key_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(&e, key))?;
        }
        let etag = content_hash(&bytes);

        // Same-filesystem temp file so the final rename is atomic.
        let tmp = self.root.join(TMP_DIR).join(Uuid::new_v4().to_string());
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Self::io_err(&e, key))?;
        if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io_err(&e, key));
        }
        Ok(etag)
    }

    async fn get(&self, key: &str) -> KernelResult<Bytes> {
        let path = self.key_path(key)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::io_err(&e, key))?;
        Ok(Bytes::from(bytes))
    }

    async fn delete(&self, key: &str) -> KernelResult<()> {
        let path = self.key_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&e, key)),
        }
    }

    async fn list(&self, prefix: &str) -> KernelResult<Vec<String>> {
        // Walk the tree and filter by key prefix; directory layout mirrors
        // key segments so the walk stays under the longest whole-segment
        // prefix of the requested one.
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::io_err(&e, prefix)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::io_err(&e, prefix))?
            {
                let path = entry.path();
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel.to_string_lossy().replace('\\', "/");
                if key.starts_with(TMP_DIR) {
                    continue;
                }
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Self::io_err(&e, prefix))?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn stat(&self, key: &str) -> KernelResult<ObjectStat> {
        let path = self.key_path(key)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::io_err(&e, key))?;
        Ok(ObjectStat {
            size: bytes.len() as u64,
            etag: content_hash(&bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open("local", dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_round_trip_with_nested_key() {
        let (_dir, store) = make_store();
        let etag = store
            .put("cas/ab/abcdef", Bytes::from_static(b"blob"))
            .await
            .unwrap();
        assert_eq!(etag, content_hash(b"blob"));
        assert_eq!(
            store.get("cas/ab/abcdef").await.unwrap(),
            Bytes::from_static(b"blob")
        );
    }

    #[tokio::test]
    async fn traversal_keys_rejected() {
        let (_dir, store) = make_store();
        for key in ["../escape", "/abs", "a//b", ""] {
            let err = store.get(key).await.unwrap_err();
            assert!(
                matches!(err, KernelError::InvalidArgument { .. }),
                "key {key:?} must be rejected"
            );
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = make_store();
        store.put("k", Bytes::from_static(b"v")).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(matches!(
            store.get("k").await,
            Err(KernelError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_returns_keys_under_prefix() {
        let (_dir, store) = make_store();
        for key in ["cas/aa/h1", "cas/bb/h2", "data/x"] {
            store.put(key, Bytes::from_static(b"v")).await.unwrap();
        }
        let keys = store.list("cas/").await.unwrap();
        assert_eq!(keys, vec!["cas/aa/h1".to_string(), "cas/bb/h2".to_string()]);
    }

    #[tokio::test]
    async fn overwrite_replaces_atomically() {
        let (_dir, store) = make_store();
        store.put("k", Bytes::from_static(b"old")).await.unwrap();
        store.put("k", Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Bytes::from_static(b"new"));
        let stat = store.stat("k").await.unwrap();
        assert_eq!(stat.size, 3);
        assert_eq!(stat.etag, content_hash(b"new"));
    }
}
