//! In-process [`CacheStore`] driver.
//!
//! TTL entries in a concurrent map with lazy expiry, plus one broadcast
//! channel per pub/sub topic. A shared-server driver (Redis-class) plugs in
//! behind the same trait for multi-process deployments.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
// tokio's Instant (not std's) so paused-clock tests can advance expiry.
use tokio::time::Instant;

use nexus_core::KernelResult;

use crate::pillar::cachestore::CacheStore;

const CHANNEL_CAPACITY: usize = 256;

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Ephemeral cache backed by [`DashMap`], channels by `tokio::sync::broadcast`.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, Entry>,
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

impl MemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> KernelResult<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> KernelResult<Option<Bytes>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Lazy expiry: drop the stale entry on observation.
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        Ok(None)
    }

    async fn delete(&self, key: &str) -> KernelResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> KernelResult<()> {
        self.entries.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> KernelResult<()> {
        // A send error only means no subscribers; fire-and-forget.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes> {
        self.sender(channel).subscribe()
    }
}
