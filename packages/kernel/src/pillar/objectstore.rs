//! Opaque-blob pillar.
//!
//! Keys are opaque strings; there is no rename and no query surface. Moves
//! are logical (metadata updates only). `put` is atomic with respect to
//! concurrent `get`: a reader sees the prior version or the new one, never a
//! partial. `list` may lag recent writes; the metadata layer is the source
//! of truth for existence.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use nexus_core::KernelResult;

/// Size and version token of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub etag: String,
}

/// Blob storage by opaque key. Used as `Arc<dyn ObjectStore>`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Identifier of this backend, referenced by `FileMetadata::backend_id`.
    fn backend_id(&self) -> &str;

    /// Store a blob, returning its etag. Atomic w.r.t. concurrent readers.
    async fn put(&self, key: &str, bytes: Bytes) -> KernelResult<String>;

    /// Fetch a blob. Fails `NotFound` for absent keys.
    async fn get(&self, key: &str) -> KernelResult<Bytes>;

    /// Fetch a blob as a reader.
    ///
    /// The default implementation buffers through [`get`](Self::get);
    /// drivers with true streaming override it.
    async fn get_stream(
        &self,
        key: &str,
    ) -> KernelResult<Box<dyn AsyncRead + Send + Unpin>> {
        let bytes = self.get(key).await?;
        Ok(Box::new(std::io::Cursor::new(bytes.to_vec())))
    }

    /// Delete a blob. Idempotent: deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> KernelResult<()>;

    /// List keys under a prefix. May be eventually consistent.
    async fn list(&self, prefix: &str) -> KernelResult<Vec<String>>;

    /// Size and etag of a blob. Fails `NotFound` for absent keys.
    async fn stat(&self, key: &str) -> KernelResult<ObjectStat>;
}
