//! Ephemeral KV + pub/sub pillar.
//!
//! No durability: entries may be evicted at any time and callers treat
//! misses as normal, recomputing from the authoritative stores. Used for
//! permission-check results, session tokens, content caching, and
//! fire-and-forget file-change events (missed events are reconstructed from
//! the operation log).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use nexus_core::KernelResult;

/// Ephemeral key-value store with TTL and pub/sub channels.
/// Used as `Arc<dyn CacheStore>`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Store a value; `ttl = None` means no expiry (still evictable).
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> KernelResult<()>;

    async fn get(&self, key: &str) -> KernelResult<Option<Bytes>>;

    async fn delete(&self, key: &str) -> KernelResult<()>;

    /// Drop every key with the given prefix (bulk invalidation).
    async fn delete_by_prefix(&self, prefix: &str) -> KernelResult<()>;

    /// Publish a payload; delivery is best-effort to current subscribers.
    async fn publish(&self, channel: &str, payload: Bytes) -> KernelResult<()>;

    /// Subscribe to a channel. Slow receivers observe `Lagged` and resync
    /// from the operation log.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes>;
}
