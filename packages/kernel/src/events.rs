//! File-change events over CacheStore pub/sub.
//!
//! Events are fire-and-forget hints on channel `fs.events.{zone_id}`;
//! subscribers that miss or drop messages reconstruct state from the
//! operation log, which is authoritative.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use nexus_core::{OpType, Subject, VirtualPath, ZoneId};

use crate::pillar::cachestore::CacheStore;

/// Payload published for every committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEvent {
    pub op_type: OpType,
    pub path: VirtualPath,
    pub subject: Subject,
    pub timestamp: i64,
}

/// Channel name for a zone's event stream.
#[must_use]
pub fn channel(zone_id: ZoneId) -> String {
    format!("fs.events.{zone_id}")
}

/// Publish an event; failures are logged, never propagated.
pub async fn publish(cache: &dyn CacheStore, zone_id: ZoneId, event: &FsEvent) {
    let payload = match serde_json::to_vec(event) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode fs event");
            return;
        }
    };
    if let Err(e) = cache.publish(&channel(zone_id), Bytes::from(payload)).await {
        tracing::warn!(zone = %zone_id, error = %e, "failed to publish fs event");
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::driver::memory_cachestore::MemoryCacheStore;

    #[tokio::test]
    async fn published_events_decode_on_the_channel() {
        let cache = MemoryCacheStore::new();
        let zone = Uuid::new_v4();
        let mut rx = cache.subscribe(&channel(zone));

        let event = FsEvent {
            op_type: OpType::Write,
            path: VirtualPath::parse("/workspace/a.txt").unwrap(),
            subject: Subject::agent("alice"),
            timestamp: 123,
        };
        publish(&cache, zone, &event).await;

        let raw = rx.recv().await.unwrap();
        let decoded: FsEvent = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn zones_have_distinct_channels() {
        let zone_a = Uuid::new_v4();
        let zone_b = Uuid::new_v4();
        assert_ne!(channel(zone_a), channel(zone_b));
    }
}
