//! S3-compatible and GCS [`ObjectStore`] drivers (feature `cloud`).
//!
//! Thin wrappers over the `object_store` crate, which owns authentication
//! (environment credentials), retries, and the wire protocols. The kernel
//! only ever sees this crate's own [`ObjectStore`] contract.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as RemotePath;

use nexus_core::{KernelError, KernelResult};

use crate::pillar::objectstore::{ObjectStat, ObjectStore};

/// Blob storage on a remote bucket (S3-compatible or GCS).
pub struct CloudObjectStore {
    backend_id: String,
    inner: Box<dyn object_store::ObjectStore>,
}

impl CloudObjectStore {
    /// S3-compatible bucket; credentials and region come from the environment.
    pub fn s3(backend_id: impl Into<String>, bucket: &str) -> KernelResult<Self> {
        let inner = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(remote_err)?;
        Ok(Self {
            backend_id: backend_id.into(),
            inner: Box::new(inner),
        })
    }

    /// GCS bucket; credentials come from the environment.
    pub fn gcs(backend_id: impl Into<String>, bucket: &str) -> KernelResult<Self> {
        let inner = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(remote_err)?;
        Ok(Self {
            backend_id: backend_id.into(),
            inner: Box::new(inner),
        })
    }
}

fn remote_err(e: object_store::Error) -> KernelError {
    match e {
        object_store::Error::NotFound { path, .. } => KernelError::not_found(path),
        other => KernelError::unavailable(format!("remote object store: {other}")),
    }
}

#[async_trait]
impl ObjectStore for CloudObjectStore {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    async fn put(&self, key: &str, bytes: Bytes) -> KernelResult<String> {
        let location = RemotePath::from(key);
        let result = self
            .inner
            .put(&location, bytes.into())
            .await
            .map_err(remote_err)?;
        Ok(result.e_tag.unwrap_or_default())
    }

    async fn get(&self, key: &str) -> KernelResult<Bytes> {
        let location = RemotePath::from(key);
        let result = self.inner.get(&location).await.map_err(remote_err)?;
        result.bytes().await.map_err(remote_err)
    }

    async fn delete(&self, key: &str) -> KernelResult<()> {
        let location = RemotePath::from(key);
        match self.inner.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(remote_err(e)),
        }
    }

    async fn list(&self, prefix: &str) -> KernelResult<Vec<String>> {
        let location = RemotePath::from(prefix);
        let metas: Vec<object_store::ObjectMeta> = self
            .inner
            .list(Some(&location))
            .try_collect()
            .await
            .map_err(remote_err)?;
        let mut keys: Vec<String> = metas.into_iter().map(|m| m.location.to_string()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn stat(&self, key: &str) -> KernelResult<ObjectStat> {
        let location = RemotePath::from(key);
        let meta = self.inner.head(&location).await.map_err(remote_err)?;
        Ok(ObjectStat {
            size: meta.size as u64,
            etag: meta.e_tag.unwrap_or_default(),
        })
    }
}
