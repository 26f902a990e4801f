//! Ordered persistent key-value pillar.
//!
//! Keys are opaque byte strings with lexicographic ordering; values are
//! opaque bytes (the metadata layer handles serialization). The ordered
//! property is load-bearing: directory listings, namespace prefix routing,
//! and chroot-style "first key under my prefix" all depend on it.

use async_trait::async_trait;

use nexus_core::KernelResult;

/// A value together with the driver-assigned revision that produced it.
///
/// Revisions are per-key and strictly increasing; they realize the
/// `expected_etag` optimistic-concurrency surface of the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub revision: u64,
}

/// Ordered key-value store with optimistic concurrency and prefix scans.
///
/// Single-node drivers provide serializable operations; replicated drivers
/// provide linearizable writes through an injected replicated log. Drivers
/// never interpret key structure. Used as `Arc<dyn Metastore>`.
#[async_trait]
pub trait Metastore: Send + Sync {
    /// Read a key. Returns the value and its current revision.
    async fn get(&self, key: &[u8]) -> KernelResult<Option<VersionedValue>>;

    /// Write a key, returning the new revision.
    ///
    /// With `expected_revision`, the write commits only if the key's current
    /// revision matches; otherwise it fails `Stale`. Pass `None` to write
    /// unconditionally.
    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        expected_revision: Option<u64>,
    ) -> KernelResult<u64>;

    /// Write several keys in one atomic commit, returning the new revisions.
    ///
    /// The default implementation is a non-atomic loop; persistent drivers
    /// override it with a real multi-key transaction.
    async fn put_many(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> KernelResult<Vec<u64>> {
        let mut revisions = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            revisions.push(self.put(key, value, None).await?);
        }
        Ok(revisions)
    }

    /// Delete a key. Deleting an absent key is a no-op unless
    /// `expected_revision` is set, in which case it fails `Stale`.
    async fn delete(&self, key: &[u8], expected_revision: Option<u64>) -> KernelResult<()>;

    /// Scan keys with the given prefix in lexicographic order.
    ///
    /// `start_after` resumes a previous scan (exclusive); `limit` bounds the
    /// page size. The scan is strictly ordered and restartable after a crash
    /// without missing or duplicating keys.
    async fn prefix_scan(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> KernelResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomic compare-and-swap on a single key.
    ///
    /// `expected = None` means the key must be absent; `new = None` deletes.
    /// Returns `false` when the current value did not match `expected`
    /// (the caller lost the race and decides whether to retry).
    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> KernelResult<bool>;
}
