//! Replicated [`Metastore`] driver layered on an injected replicated log.
//!
//! The kernel treats consensus as a black box: writes are serialized as
//! commands, proposed to the [`ReplicatedLog`], and applied to a local
//! ordered-KV driver once committed. Reads are served locally
//! (stale-bounded) or behind a read barrier (linearizable) depending on the
//! caller's requested consistency. The wire-level peer protocol is not part
//! of this crate.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use nexus_core::{Consistency, KernelError, KernelResult};

use crate::pillar::metastore::{Metastore, VersionedValue};

/// Injected replicated log (the consensus layer seam).
///
/// `propose` returns once the entry is committed on a quorum; the driver
/// then applies the command locally. `read_barrier` completes once the local
/// state machine has caught up with the leader's commit index.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    async fn propose(&self, entry: Vec<u8>) -> KernelResult<u64>;

    async fn read_barrier(&self) -> KernelResult<()>;
}

/// A single-process log for tests and single-node deployments: every
/// proposal commits immediately.
#[derive(Default)]
pub struct LocalLog {
    committed: std::sync::atomic::AtomicU64,
}

impl LocalLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed entries.
    #[must_use]
    pub fn committed_len(&self) -> u64 {
        self.committed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicatedLog for LocalLog {
    async fn propose(&self, _entry: Vec<u8>) -> KernelResult<u64> {
        Ok(self
            .committed
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1)
    }

    async fn read_barrier(&self) -> KernelResult<()> {
        Ok(())
    }
}

/// Commands shipped through the log. MessagePack-encoded.
#[derive(Debug, Serialize, Deserialize)]
enum Command {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        expected_revision: Option<u64>,
    },
    PutMany {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    },
    Delete {
        key: Vec<u8>,
        expected_revision: Option<u64>,
    },
    CompareAndSwap {
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        new: Option<Vec<u8>>,
    },
}

/// Metastore whose writes are linearized through a [`ReplicatedLog`].
pub struct ReplicatedMetastore {
    log: Arc<dyn ReplicatedLog>,
    local: Arc<dyn Metastore>,
    /// Consistency applied to reads that go through this handle.
    read_consistency: Consistency,
}

impl ReplicatedMetastore {
    #[must_use]
    pub fn new(log: Arc<dyn ReplicatedLog>, local: Arc<dyn Metastore>) -> Self {
        Self {
            log,
            local,
            read_consistency: Consistency::Eventual,
        }
    }

    /// Serve reads linearizably (leader read barrier before every get/scan).
    #[must_use]
    pub fn with_strong_reads(mut self) -> Self {
        self.read_consistency = Consistency::Strong;
        self
    }

    async fn replicate(&self, command: &Command) -> KernelResult<()> {
        let entry = rmp_serde::to_vec(command)
            .map_err(|e| KernelError::internal(format!("encode log command: {e}")))?;
        self.log.propose(entry).await?;
        Ok(())
    }

    async fn barrier_if_strong(&self) -> KernelResult<()> {
        if matches!(self.read_consistency, Consistency::Strong) {
            self.log.read_barrier().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Metastore for ReplicatedMetastore {
    async fn get(&self, key: &[u8]) -> KernelResult<Option<VersionedValue>> {
        self.barrier_if_strong().await?;
        self.local.get(key).await
    }

    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        expected_revision: Option<u64>,
    ) -> KernelResult<u64> {
        self.replicate(&Command::Put {
            key: key.to_vec(),
            value: value.to_vec(),
            expected_revision,
        })
        .await?;
        self.local.put(key, value, expected_revision).await
    }

    async fn put_many(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> KernelResult<Vec<u64>> {
        self.replicate(&Command::PutMany {
            entries: entries.to_vec(),
        })
        .await?;
        self.local.put_many(entries).await
    }

    async fn delete(&self, key: &[u8], expected_revision: Option<u64>) -> KernelResult<()> {
        self.replicate(&Command::Delete {
            key: key.to_vec(),
            expected_revision,
        })
        .await?;
        self.local.delete(key, expected_revision).await
    }

    async fn prefix_scan(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> KernelResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.barrier_if_strong().await?;
        self.local.prefix_scan(prefix, start_after, limit).await
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> KernelResult<bool> {
        self.replicate(&Command::CompareAndSwap {
            key: key.to_vec(),
            expected: expected.map(<[u8]>::to_vec),
            new: new.map(<[u8]>::to_vec),
        })
        .await?;
        self.local.compare_and_swap(key, expected, new).await
    }
}
