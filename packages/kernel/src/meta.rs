//! Typed metadata layer over the [`Metastore`] pillar.
//!
//! Owns the key encoding (`<zone_id><virtual_path>` for file metadata,
//! `cas/<hash>` for CAS chunks, `sys/<key>` for system settings) and the
//! MessagePack serialization of values. Everything above this layer works
//! with [`FileMetadata`] and [`ContentChunk`]; everything below works with
//! opaque bytes.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use nexus_core::{ContentChunk, FileMetadata, KernelError, KernelResult, VirtualPath, ZoneId};

use crate::pillar::metastore::Metastore;

/// Page size used when walking prefix scans.
const SCAN_PAGE: usize = 512;

/// Typed wrapper over the ordered-KV pillar.
#[derive(Clone)]
pub struct MetadataStore {
    store: Arc<dyn Metastore>,
}

fn encode<T: Serialize>(value: &T) -> KernelResult<Vec<u8>> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| KernelError::internal(format!("encode metadata: {e}")))
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> KernelResult<T> {
    rmp_serde::from_slice(raw)
        .map_err(|e| KernelError::internal(format!("corrupt metadata value: {e}")))
}

impl MetadataStore {
    #[must_use]
    pub fn new(store: Arc<dyn Metastore>) -> Self {
        Self { store }
    }

    /// The underlying pillar handle (CAS engine shares it for chunk ops).
    #[must_use]
    pub fn pillar(&self) -> &Arc<dyn Metastore> {
        &self.store
    }

    // --- Key encoding ---

    /// `<zone_id><virtual_path>`, e.g. `550e.../workspace/a.txt`.
    #[must_use]
    pub fn file_key(zone_id: ZoneId, path: &VirtualPath) -> Vec<u8> {
        format!("{zone_id}{path}").into_bytes()
    }

    /// Prefix covering the direct and transitive children of `dir`.
    #[must_use]
    pub fn dir_prefix(zone_id: ZoneId, dir: &VirtualPath) -> Vec<u8> {
        if dir.is_root() {
            format!("{zone_id}/").into_bytes()
        } else {
            format!("{zone_id}{dir}/").into_bytes()
        }
    }

    /// `cas/<hash>`. Chunk keys cannot collide with file keys: file keys
    /// start with a UUID.
    #[must_use]
    pub fn chunk_key(content_hash: &str) -> Vec<u8> {
        format!("cas/{content_hash}").into_bytes()
    }

    /// `sys/<key>` for system settings.
    #[must_use]
    pub fn sys_key(key: &str) -> Vec<u8> {
        format!("sys/{key}").into_bytes()
    }

    // --- File metadata ---

    /// Load metadata with its metastore revision, for optimistic updates.
    pub async fn get_file(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
    ) -> KernelResult<Option<(FileMetadata, u64)>> {
        let key = Self::file_key(zone_id, path);
        match self.store.get(&key).await? {
            Some(versioned) => Ok(Some((decode(&versioned.value)?, versioned.revision))),
            None => Ok(None),
        }
    }

    /// Write metadata; `expected_revision` guards against lost updates.
    pub async fn put_file(
        &self,
        zone_id: ZoneId,
        metadata: &FileMetadata,
        expected_revision: Option<u64>,
    ) -> KernelResult<u64> {
        let key = Self::file_key(zone_id, &metadata.path);
        self.store
            .put(&key, &encode(metadata)?, expected_revision)
            .await
    }

    /// Create metadata only if the path is absent.
    pub async fn create_file(&self, zone_id: ZoneId, metadata: &FileMetadata) -> KernelResult<()> {
        let key = Self::file_key(zone_id, &metadata.path);
        let created = self
            .store
            .compare_and_swap(&key, None, Some(&encode(metadata)?))
            .await?;
        if created {
            Ok(())
        } else {
            Err(KernelError::already_exists(metadata.path.as_str()))
        }
    }

    /// Write several metadata entries in one atomic commit.
    pub async fn put_files(
        &self,
        zone_id: ZoneId,
        entries: &[FileMetadata],
    ) -> KernelResult<()> {
        let mut batch = Vec::with_capacity(entries.len());
        for metadata in entries {
            batch.push((Self::file_key(zone_id, &metadata.path), encode(metadata)?));
        }
        self.store.put_many(&batch).await?;
        Ok(())
    }

    pub async fn delete_file(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        expected_revision: Option<u64>,
    ) -> KernelResult<()> {
        let key = Self::file_key(zone_id, path);
        self.store.delete(&key, expected_revision).await
    }

    /// List entries under `dir`, lexicographically ordered.
    ///
    /// Non-recursive listings keep only direct children; the scan itself
    /// always walks the whole subtree prefix since key order interleaves
    /// nested entries with siblings.
    pub async fn list_dir(
        &self,
        zone_id: ZoneId,
        dir: &VirtualPath,
        recursive: bool,
        limit: usize,
    ) -> KernelResult<Vec<FileMetadata>> {
        let prefix = Self::dir_prefix(zone_id, dir);
        let mut out = Vec::new();
        let mut start_after: Option<Vec<u8>> = None;

        loop {
            let page = self
                .store
                .prefix_scan(&prefix, start_after.as_deref(), SCAN_PAGE)
                .await?;
            let page_len = page.len();
            for (key, value) in page {
                let metadata: FileMetadata = decode(&value)?;
                let direct_child = metadata
                    .path
                    .parent()
                    .is_some_and(|parent| parent == *dir);
                if recursive || direct_child {
                    out.push(metadata);
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
                start_after = Some(key);
            }
            if page_len < SCAN_PAGE {
                return Ok(out);
            }
        }
    }

    // --- CAS chunks ---

    /// Load a chunk and its raw encoding (needed for compare-and-swap).
    pub async fn get_chunk(
        &self,
        content_hash: &str,
    ) -> KernelResult<Option<(ContentChunk, Vec<u8>)>> {
        let key = Self::chunk_key(content_hash);
        match self.store.get(&key).await? {
            Some(versioned) => Ok(Some((decode(&versioned.value)?, versioned.value))),
            None => Ok(None),
        }
    }

    /// Atomically transition a chunk entry.
    ///
    /// `expected_raw = None` inserts-if-absent; `new = None` deletes.
    /// Returns `false` when the entry changed underneath the caller.
    pub async fn swap_chunk(
        &self,
        content_hash: &str,
        expected_raw: Option<&[u8]>,
        new: Option<&ContentChunk>,
    ) -> KernelResult<bool> {
        let key = Self::chunk_key(content_hash);
        let encoded = new.map(encode).transpose()?;
        self.store
            .compare_and_swap(&key, expected_raw, encoded.as_deref())
            .await
    }

    /// Page through all chunk entries (garbage-collection sweep).
    pub async fn scan_chunks(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> KernelResult<Vec<ContentChunk>> {
        let start_key = start_after.map(Self::chunk_key);
        let page = self
            .store
            .prefix_scan(b"cas/", start_key.as_deref(), limit)
            .await?;
        page.iter().map(|(_, value)| decode(value)).collect()
    }
}
