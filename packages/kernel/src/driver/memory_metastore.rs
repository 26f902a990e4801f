//! In-memory [`Metastore`] driver backed by an ordered map.
//!
//! Suitable for development and tests; all operations are serializable
//! behind one `RwLock`. Lexicographic key order falls out of `BTreeMap`.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use parking_lot::RwLock;

use nexus_core::{KernelError, KernelResult};

use crate::pillar::metastore::{Metastore, VersionedValue};

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    revision: u64,
}

/// Ordered in-memory key-value store with per-key revisions.
#[derive(Default)]
pub struct MemoryMetastore {
    entries: RwLock<BTreeMap<Vec<u8>, Slot>>,
}

impl MemoryMetastore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn stale(key: &[u8]) -> KernelError {
    KernelError::Stale {
        key: String::from_utf8_lossy(key).into_owned(),
    }
}

#[async_trait]
impl Metastore for MemoryMetastore {
    async fn get(&self, key: &[u8]) -> KernelResult<Option<VersionedValue>> {
        Ok(self.entries.read().get(key).map(|slot| VersionedValue {
            value: slot.value.clone(),
            revision: slot.revision,
        }))
    }

    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        expected_revision: Option<u64>,
    ) -> KernelResult<u64> {
        let mut entries = self.entries.write();
        let current = entries.get(key).map(|s| s.revision);
        if let Some(expected) = expected_revision {
            if current != Some(expected) {
                return Err(stale(key));
            }
        }
        let revision = current.unwrap_or(0) + 1;
        entries.insert(
            key.to_vec(),
            Slot {
                value: value.to_vec(),
                revision,
            },
        );
        Ok(revision)
    }

    async fn put_many(&self, batch: &[(Vec<u8>, Vec<u8>)]) -> KernelResult<Vec<u64>> {
        let mut entries = self.entries.write();
        let mut revisions = Vec::with_capacity(batch.len());
        for (key, value) in batch {
            let revision = entries.get(key).map_or(0, |s| s.revision) + 1;
            entries.insert(
                key.clone(),
                Slot {
                    value: value.clone(),
                    revision,
                },
            );
            revisions.push(revision);
        }
        Ok(revisions)
    }

    async fn delete(&self, key: &[u8], expected_revision: Option<u64>) -> KernelResult<()> {
        let mut entries = self.entries.write();
        match expected_revision {
            Some(expected) => {
                let current = entries.get(key).map(|s| s.revision);
                if current != Some(expected) {
                    return Err(stale(key));
                }
                entries.remove(key);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(())
    }

    async fn prefix_scan(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> KernelResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read();
        let lower: Bound<Vec<u8>> = match start_after {
            Some(after) => Bound::Excluded(after.to_vec()),
            None => Bound::Included(prefix.to_vec()),
        };
        let mut out = Vec::new();
        for (key, slot) in entries.range((lower, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.clone(), slot.value.clone()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> KernelResult<bool> {
        let mut entries = self.entries.write();
        let current = entries.get(key).map(|s| s.value.as_slice());
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                let revision = entries.get(key).map_or(0, |s| s.revision) + 1;
                entries.insert(
                    key.to_vec(),
                    Slot {
                        value: value.to_vec(),
                        revision,
                    },
                );
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip_with_revisions() {
        let store = MemoryMetastore::new();
        let r1 = store.put(b"k", b"v1", None).await.unwrap();
        assert_eq!(r1, 1);
        let got = store.get(b"k").await.unwrap().unwrap();
        assert_eq!(got.value, b"v1");
        assert_eq!(got.revision, 1);

        let r2 = store.put(b"k", b"v2", Some(1)).await.unwrap();
        assert_eq!(r2, 2);
    }

    #[tokio::test]
    async fn stale_revision_rejected() {
        let store = MemoryMetastore::new();
        store.put(b"k", b"v1", None).await.unwrap();
        store.put(b"k", b"v2", None).await.unwrap();
        let err = store.put(b"k", b"v3", Some(1)).await.unwrap_err();
        assert!(matches!(err, KernelError::Stale { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent_without_expectation() {
        let store = MemoryMetastore::new();
        store.delete(b"missing", None).await.unwrap();
        store.put(b"k", b"v", None).await.unwrap();
        store.delete(b"k", Some(1)).await.unwrap();
        assert!(store.get(b"k").await.unwrap().is_none());
        let err = store.delete(b"k", Some(1)).await.unwrap_err();
        assert!(matches!(err, KernelError::Stale { .. }));
    }

    #[tokio::test]
    async fn prefix_scan_is_ordered_and_restartable() {
        let store = MemoryMetastore::new();
        for key in ["a/1", "a/2", "a/3", "b/1"] {
            store.put(key.as_bytes(), b"v", None).await.unwrap();
        }

        let page1 = store.prefix_scan(b"a/", None, 2).await.unwrap();
        assert_eq!(
            page1.iter().map(|(k, _)| k.as_slice()).collect::<Vec<_>>(),
            vec![b"a/1".as_slice(), b"a/2".as_slice()]
        );

        let page2 = store
            .prefix_scan(b"a/", Some(b"a/2"), 10)
            .await
            .unwrap();
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].0, b"a/3");
    }

    #[tokio::test]
    async fn cas_insert_and_lose_race() {
        let store = MemoryMetastore::new();
        assert!(store.compare_and_swap(b"k", None, Some(b"v1")).await.unwrap());
        // Second insert-if-absent loses.
        assert!(!store.compare_and_swap(b"k", None, Some(b"v2")).await.unwrap());
        // Swap with correct expectation wins.
        assert!(store
            .compare_and_swap(b"k", Some(b"v1"), Some(b"v2"))
            .await
            .unwrap());
        // CAS-delete.
        assert!(store.compare_and_swap(b"k", Some(b"v2"), None).await.unwrap());
        assert!(store.get(b"k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_many_assigns_revisions_atomically() {
        let store = MemoryMetastore::new();
        store.put(b"a", b"old", None).await.unwrap();
        let revs = store
            .put_many(&[(b"a".to_vec(), b"v".to_vec()), (b"b".to_vec(), b"v".to_vec())])
            .await
            .unwrap();
        assert_eq!(revs, vec![2, 1]);
    }
}
