//! Embedded persistent [`Metastore`] driver backed by `redb`.
//!
//! One table holds all keys; each stored value is the per-key revision
//! (8 bytes little-endian) followed by the caller's bytes. All operations
//! run on the blocking pool since redb I/O is synchronous.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use nexus_core::{KernelError, KernelResult};

use crate::pillar::metastore::{Metastore, VersionedValue};

const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");

/// Persistent ordered-KV driver over a single redb database file.
pub struct RedbMetastore {
    db: Arc<Database>,
}

impl RedbMetastore {
    /// Opens (or creates) the database at `path` and ensures the table exists.
    pub fn open(path: impl AsRef<Path>) -> KernelResult<Self> {
        let db = Database::create(path.as_ref()).map_err(|e| KernelError::unavailable(format!("redb open: {e}")))?;
        let tx = db
            .begin_write()
            .map_err(|e| KernelError::unavailable(format!("redb txn: {e}")))?;
        tx.open_table(ENTRIES)
            .map_err(|e| KernelError::unavailable(format!("redb table: {e}")))?;
        tx.commit()
            .map_err(|e| KernelError::unavailable(format!("redb commit: {e}")))?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn run_blocking<T, F>(&self, f: F) -> KernelResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> KernelResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| KernelError::internal(format!("blocking task: {e}")))?
    }
}

fn unavailable(e: impl std::fmt::Display) -> KernelError {
    KernelError::unavailable(format!("redb: {e}"))
}

fn encode_slot(revision: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&revision.to_le_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_slot(raw: &[u8]) -> (u64, Vec<u8>) {
    let mut rev = [0u8; 8];
    let len = raw.len().min(8);
    rev[..len].copy_from_slice(&raw[..len]);
    (u64::from_le_bytes(rev), raw.get(8..).unwrap_or_default().to_vec())
}

fn read_slot(db: &Database, key: &[u8]) -> KernelResult<Option<(u64, Vec<u8>)>> {
    let tx = db.begin_read().map_err(unavailable)?;
    let table = tx.open_table(ENTRIES).map_err(unavailable)?;
    let guard = table.get(key).map_err(unavailable)?;
    Ok(guard.map(|g| decode_slot(g.value())))
}

#[async_trait]
impl Metastore for RedbMetastore {
    async fn get(&self, key: &[u8]) -> KernelResult<Option<VersionedValue>> {
        let key = key.to_vec();
        self.run_blocking(move |db| {
            Ok(read_slot(db, &key)?.map(|(revision, value)| VersionedValue { value, revision }))
        })
        .await
    }

    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        expected_revision: Option<u64>,
    ) -> KernelResult<u64> {
        let key = key.to_vec();
        let value = value.to_vec();
        self.run_blocking(move |db| {
            let tx = db.begin_write().map_err(unavailable)?;
            let revision;
            {
                let mut table = tx.open_table(ENTRIES).map_err(unavailable)?;
                let current = table
                    .get(key.as_slice())
                    .map_err(unavailable)?
                    .map(|g| decode_slot(g.value()).0);
                if let Some(expected) = expected_revision {
                    if current != Some(expected) {
                        return Err(KernelError::Stale {
                            key: String::from_utf8_lossy(&key).into_owned(),
                        });
                    }
                }
                revision = current.unwrap_or(0) + 1;
                table
                    .insert(key.as_slice(), encode_slot(revision, &value).as_slice())
                    .map_err(unavailable)?;
            }
            tx.commit().map_err(unavailable)?;
            Ok(revision)
        })
        .await
    }

    async fn put_many(&self, batch: &[(Vec<u8>, Vec<u8>)]) -> KernelResult<Vec<u64>> {
        let batch = batch.to_vec();
        self.run_blocking(move |db| {
            let tx = db.begin_write().map_err(unavailable)?;
            let mut revisions = Vec::with_capacity(batch.len());
            {
                let mut table = tx.open_table(ENTRIES).map_err(unavailable)?;
                for (key, value) in &batch {
                    let current = table
                        .get(key.as_slice())
                        .map_err(unavailable)?
                        .map_or(0, |g| decode_slot(g.value()).0);
                    let revision = current + 1;
                    table
                        .insert(key.as_slice(), encode_slot(revision, value).as_slice())
                        .map_err(unavailable)?;
                    revisions.push(revision);
                }
            }
            tx.commit().map_err(unavailable)?;
            Ok(revisions)
        })
        .await
    }

    async fn delete(&self, key: &[u8], expected_revision: Option<u64>) -> KernelResult<()> {
        let key = key.to_vec();
        self.run_blocking(move |db| {
            let tx = db.begin_write().map_err(unavailable)?;
            {
                let mut table = tx.open_table(ENTRIES).map_err(unavailable)?;
                if let Some(expected) = expected_revision {
                    let current = table
                        .get(key.as_slice())
                        .map_err(unavailable)?
                        .map(|g| decode_slot(g.value()).0);
                    if current != Some(expected) {
                        return Err(KernelError::Stale {
                            key: String::from_utf8_lossy(&key).into_owned(),
                        });
                    }
                }
                table.remove(key.as_slice()).map_err(unavailable)?;
            }
            tx.commit().map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn prefix_scan(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> KernelResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = prefix.to_vec();
        let start_after = start_after.map(<[u8]>::to_vec);
        self.run_blocking(move |db| {
            let tx = db.begin_read().map_err(unavailable)?;
            let table = tx.open_table(ENTRIES).map_err(unavailable)?;
            let lower: Bound<&[u8]> = match &start_after {
                Some(after) => Bound::Excluded(after.as_slice()),
                None => Bound::Included(prefix.as_slice()),
            };
            let upper: Bound<&[u8]> = Bound::Unbounded;
            let range: (Bound<&[u8]>, Bound<&[u8]>) = (lower, upper);
            let mut out = Vec::new();
            for item in table.range::<&[u8]>(range).map_err(unavailable)? {
                let (key_guard, value_guard) = item.map_err(unavailable)?;
                let key = key_guard.value().to_vec();
                if !key.starts_with(&prefix) {
                    break;
                }
                out.push((key, decode_slot(value_guard.value()).1));
                if out.len() >= limit {
                    break;
                }
            }
            Ok(out)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> KernelResult<bool> {
        let key = key.to_vec();
        let expected = expected.map(<[u8]>::to_vec);
        let new = new.map(<[u8]>::to_vec);
        self.run_blocking(move |db| {
            let tx = db.begin_write().map_err(unavailable)?;
            let swapped;
            {
                let mut table = tx.open_table(ENTRIES).map_err(unavailable)?;
                let current = table
                    .get(key.as_slice())
                    .map_err(unavailable)?
                    .map(|g| decode_slot(g.value()));
                if current.as_ref().map(|(_, v)| v.as_slice()) != expected.as_deref() {
                    return Ok(false);
                }
                match &new {
                    Some(value) => {
                        let revision = current.map_or(0, |(r, _)| r) + 1;
                        table
                            .insert(key.as_slice(), encode_slot(revision, value).as_slice())
                            .map_err(unavailable)?;
                    }
                    None => {
                        table.remove(key.as_slice()).map_err(unavailable)?;
                    }
                }
                swapped = true;
            }
            tx.commit().map_err(unavailable)?;
            Ok(swapped)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RedbMetastore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbMetastore::open(dir.path().join("meta.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_survives_across_handles() {
        let (_dir, store) = open_temp();
        store.put(b"zone/a", b"v1", None).await.unwrap();
        let got = store.get(b"zone/a").await.unwrap().unwrap();
        assert_eq!(got.value, b"v1");
        assert_eq!(got.revision, 1);
    }

    #[tokio::test]
    async fn stale_put_rejected() {
        let (_dir, store) = open_temp();
        store.put(b"k", b"v1", None).await.unwrap();
        store.put(b"k", b"v2", Some(1)).await.unwrap();
        let err = store.put(b"k", b"v3", Some(1)).await.unwrap_err();
        assert!(matches!(err, KernelError::Stale { .. }));
    }

    #[tokio::test]
    async fn prefix_scan_ordered_with_resume() {
        let (_dir, store) = open_temp();
        for key in ["z/a", "z/b", "z/c", "zz/x"] {
            store.put(key.as_bytes(), key.as_bytes(), None).await.unwrap();
        }
        let page = store.prefix_scan(b"z/", None, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].0, b"z/a");
        let rest = store.prefix_scan(b"z/", Some(b"z/b"), 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0, b"z/c");
    }

    #[tokio::test]
    async fn cas_roundtrip() {
        let (_dir, store) = open_temp();
        assert!(store.compare_and_swap(b"c", None, Some(b"1")).await.unwrap());
        assert!(!store.compare_and_swap(b"c", None, Some(b"2")).await.unwrap());
        assert!(store.compare_and_swap(b"c", Some(b"1"), Some(b"2")).await.unwrap());
        let got = store.get(b"c").await.unwrap().unwrap();
        assert_eq!(got.value, b"2");
        assert_eq!(got.revision, 2);
    }

    #[tokio::test]
    async fn put_many_is_one_transaction() {
        let (_dir, store) = open_temp();
        let revs = store
            .put_many(&[(b"m/1".to_vec(), b"a".to_vec()), (b"m/2".to_vec(), b"b".to_vec())])
            .await
            .unwrap();
        assert_eq!(revs, vec![1, 1]);
        assert_eq!(store.prefix_scan(b"m/", None, 10).await.unwrap().len(), 2);
    }
}
