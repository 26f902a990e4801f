//! Content-addressed storage engine.
//!
//! Bytes are stored once per SHA-256 digest; the chunk index in the
//! Metastore carries the refcount. Refcounts are only ever manipulated with
//! compare-and-swap loops at the Metastore level, never read-modify-write in
//! application code. A released chunk is tombstoned and its blob deleted
//! only after a grace period, tolerating clock skew across concurrent
//! writers that observed the hash but have not yet bumped the refcount.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use nexus_core::{content_hash, now_micros, ContentChunk, KernelError, KernelResult};

use crate::meta::MetadataStore;
use crate::pillar::objectstore::ObjectStore;

/// Bound on compare-and-swap retries before reporting a conflict.
const MAX_SWAP_ATTEMPTS: usize = 16;

/// Content-addressed storage over the Metastore chunk index and the
/// ObjectStore backends.
pub struct CasEngine {
    meta: MetadataStore,
    backends: HashMap<String, Arc<dyn ObjectStore>>,
    grace: Duration,
}

impl CasEngine {
    #[must_use]
    pub fn new(
        meta: MetadataStore,
        backends: HashMap<String, Arc<dyn ObjectStore>>,
        grace: Duration,
    ) -> Self {
        Self {
            meta,
            backends,
            grace,
        }
    }

    /// ObjectStore key for a content hash: `cas/<hh>/<hash>`.
    #[must_use]
    pub fn object_key(content_hash: &str) -> String {
        format!("cas/{}/{content_hash}", &content_hash[..2])
    }

    fn backend(&self, backend_id: &str) -> KernelResult<&Arc<dyn ObjectStore>> {
        self.backends
            .get(backend_id)
            .ok_or_else(|| KernelError::unavailable(format!("unknown backend: {backend_id}")))
    }

    /// Store `bytes`, returning the content hash.
    ///
    /// If the chunk already exists only its refcount is bumped; the blob is
    /// written at most once per digest.
    pub async fn put_content(&self, backend_id: &str, bytes: &Bytes) -> KernelResult<String> {
        let hash = content_hash(bytes);

        for _ in 0..MAX_SWAP_ATTEMPTS {
            match self.meta.get_chunk(&hash).await? {
                Some((chunk, raw)) => {
                    // The chunk index is backend-agnostic; a hash first
                    // written through another backend has no blob here yet.
                    let store = self.backend(backend_id)?;
                    let key = Self::object_key(&hash);
                    match store.stat(&key).await {
                        Ok(_) => {}
                        Err(KernelError::NotFound { .. }) => {
                            store.put(&key, bytes.clone()).await?;
                        }
                        Err(e) => return Err(e),
                    }
                    // Bump the refcount, resurrecting a tombstoned entry
                    // whose blob has not been swept yet.
                    let bumped = ContentChunk {
                        refcount: chunk.refcount + 1,
                        tombstoned_at: None,
                        ..chunk
                    };
                    if self.meta.swap_chunk(&hash, Some(&raw), Some(&bumped)).await? {
                        metrics::counter!("nexus_cas_dedup_hits_total").increment(1);
                        return Ok(hash);
                    }
                }
                None => {
                    // First write of this digest: blob first, then index.
                    let store = self.backend(backend_id)?;
                    store.put(&Self::object_key(&hash), bytes.clone()).await?;
                    let chunk = ContentChunk {
                        content_hash: hash.clone(),
                        size_bytes: bytes.len() as u64,
                        refcount: 1,
                        first_seen_at: now_micros(),
                        tombstoned_at: None,
                    };
                    if self.meta.swap_chunk(&hash, None, Some(&chunk)).await? {
                        metrics::counter!("nexus_cas_blobs_written_total").increment(1);
                        return Ok(hash);
                    }
                    // A concurrent writer inserted the same digest; the blob
                    // key is identical bytes, so nothing to clean up. Loop
                    // around and bump their refcount.
                }
            }
        }
        Err(KernelError::Conflict {
            key: Self::object_key(&hash),
        })
    }

    /// Fetch the bytes for a content hash.
    pub async fn get_content(&self, backend_id: &str, content_hash: &str) -> KernelResult<Bytes> {
        self.backend(backend_id)?
            .get(&Self::object_key(content_hash))
            .await
    }

    /// Add a reference to an existing chunk (copy, undo restore).
    pub async fn increment(&self, content_hash: &str) -> KernelResult<u64> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let Some((chunk, raw)) = self.meta.get_chunk(content_hash).await? else {
                return Err(KernelError::not_found(Self::object_key(content_hash)));
            };
            let bumped = ContentChunk {
                refcount: chunk.refcount + 1,
                tombstoned_at: None,
                ..chunk
            };
            let refcount = bumped.refcount;
            if self
                .meta
                .swap_chunk(content_hash, Some(&raw), Some(&bumped))
                .await?
            {
                return Ok(refcount);
            }
        }
        Err(KernelError::Conflict {
            key: Self::object_key(content_hash),
        })
    }

    /// Drop a reference. At zero the chunk is tombstoned; the blob is
    /// reclaimed by [`sweep`](Self::sweep) once the grace period elapses.
    pub async fn release(&self, content_hash: &str) -> KernelResult<()> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let Some((chunk, raw)) = self.meta.get_chunk(content_hash).await? else {
                // Releasing an already-collected chunk is harmless.
                tracing::warn!(hash = %content_hash, "release of unknown CAS chunk");
                return Ok(());
            };
            let refcount = chunk.refcount.saturating_sub(1);
            let updated = ContentChunk {
                refcount,
                tombstoned_at: if refcount == 0 {
                    Some(now_micros())
                } else {
                    chunk.tombstoned_at
                },
                ..chunk
            };
            if self
                .meta
                .swap_chunk(content_hash, Some(&raw), Some(&updated))
                .await?
            {
                return Ok(());
            }
        }
        Err(KernelError::Conflict {
            key: Self::object_key(content_hash),
        })
    }

    /// Current refcount of a chunk (test and recovery observability).
    pub async fn refcount(&self, content_hash: &str) -> KernelResult<Option<u64>> {
        Ok(self
            .meta
            .get_chunk(content_hash)
            .await?
            .map(|(chunk, _)| chunk.refcount))
    }

    /// Delete blobs of chunks that have been tombstoned for longer than the
    /// grace period. Returns the number of blobs reclaimed.
    pub async fn sweep(&self, backend_id: &str) -> KernelResult<usize> {
        let store = self.backend(backend_id)?;
        let cutoff = now_micros() - i64::try_from(self.grace.as_micros()).unwrap_or(i64::MAX);
        let mut reclaimed = 0;
        let mut start_after: Option<String> = None;

        loop {
            let page = self.meta.scan_chunks(start_after.as_deref(), 256).await?;
            let Some(last) = page.last() else {
                break;
            };
            start_after = Some(last.content_hash.clone());
            let page_len = page.len();

            for chunk in page {
                let expired = chunk.refcount == 0
                    && chunk.tombstoned_at.is_some_and(|at| at <= cutoff);
                if !expired {
                    continue;
                }
                // Remove the index entry first; losing the race means a
                // writer resurrected the chunk and the blob must stay.
                let Some((_, raw)) = self.meta.get_chunk(&chunk.content_hash).await? else {
                    continue;
                };
                if self
                    .meta
                    .swap_chunk(&chunk.content_hash, Some(&raw), None)
                    .await?
                {
                    store.delete(&Self::object_key(&chunk.content_hash)).await?;
                    reclaimed += 1;
                }
            }

            if page_len < 256 {
                break;
            }
        }
        if reclaimed > 0 {
            tracing::info!(backend = backend_id, reclaimed, "CAS sweep reclaimed blobs");
        }
        Ok(reclaimed)
    }
}
