//! Startup reconciliation of the operation log against the metadata store.
//!
//! Log rows and metadata commit together, so divergence only appears after
//! a crash inside the commit window or storage corruption. The pass walks
//! recent write operations and verifies the state each one claims. A
//! diverged write is re-applied (forward-completed) when the content it
//! claims is still live in the CAS, rolled back from undo state otherwise,
//! and in every case recorded in the quarantine table for operator review.

use std::sync::Arc;

use uuid::Uuid;

use nexus_core::{
    now_micros, EntryType, FileMetadata, KernelResult, OpType, OperationLogEntry, ZoneId,
};

use crate::fs::NexusFilesystem;
use crate::meta::MetadataStore;
use crate::oplog::UndoState;
use crate::pillar::recordstore::{OpLogFilter, QuarantineRecord, RecordStore};

/// Outcome of one reconciliation pass.
///
/// `quarantined` counts every quarantine row the pass wrote, including the
/// ones recording a successful re-apply or rollback.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub ops_checked: usize,
    /// Diverged writes forward-completed to the state their log row claims.
    pub reapplied: usize,
    /// Diverged writes reverted to their pre-operation state.
    pub rolled_back: usize,
    /// Quarantine rows written for operator review.
    pub quarantined: usize,
}

/// Reconcile the most recent `window_micros` of a zone's operation log.
pub async fn reconcile(
    fs: &NexusFilesystem,
    zone_id: ZoneId,
    window_micros: i64,
) -> KernelResult<ReconcileReport> {
    let records = fs.records_handle();
    let meta = fs.metadata_handle();
    let since = now_micros() - window_micros;
    let ops = records
        .query_ops(
            zone_id,
            &OpLogFilter {
                op_type: Some(OpType::Write),
                since_micros: Some(since),
                ..OpLogFilter::default()
            },
        )
        .await?;

    let mut report = ReconcileReport::default();
    for op in ops {
        if op.undone {
            continue;
        }
        report.ops_checked += 1;

        let claimed_hash = op
            .details
            .get("content_hash")
            .and_then(|v| v.as_str())
            .map(ToString::to_string);
        let current = meta.get_file(zone_id, &op.file_path).await?;

        // A later write legitimately supersedes this one; only the newest
        // entry per path can disagree with metadata.
        let newer = records
            .query_ops(
                zone_id,
                &OpLogFilter {
                    path: Some(op.file_path.clone()),
                    since_micros: Some(op.timestamp + 1),
                    ..OpLogFilter::default()
                },
            )
            .await?;
        if !newer.is_empty() {
            continue;
        }

        let consistent = match (&current, &claimed_hash) {
            (Some((metadata, _)), Some(hash)) => {
                metadata.content_hash.as_deref() == Some(hash.as_str())
            }
            (None, _) => false,
            (Some(_), None) => true,
        };
        if consistent {
            continue;
        }

        // Metadata disagrees with the newest log entry for the path: the
        // commit window was interrupted. Prefer completing the logged
        // operation; fall back to reverting it when its content is gone.
        let prior = match UndoState::from_entry(&op) {
            Ok(UndoState::Write { prior }) => prior,
            _ => {
                report.quarantined += 1;
                quarantine(&records, zone_id, &op, "metadata diverged, no usable undo state")
                    .await?;
                continue;
            }
        };

        let live_hash = match &claimed_hash {
            Some(hash) => meta
                .get_chunk(hash)
                .await?
                .filter(|(chunk, _)| chunk.refcount > 0)
                .map(|_| hash.clone()),
            None => None,
        };

        if let Some(hash) = live_hash {
            let restored = forward_complete(&op, prior.as_ref(), &hash, fs);
            match meta.put_file(zone_id, &restored, None).await {
                Ok(_) => {
                    report.reapplied += 1;
                    report.quarantined += 1;
                    tracing::warn!(
                        zone = %zone_id,
                        path = %op.file_path,
                        op = %op.op_id,
                        "re-applied diverged write during recovery"
                    );
                    quarantine(&records, zone_id, &op, "re-applied from log state").await?;
                }
                Err(e) => {
                    report.quarantined += 1;
                    quarantine(&records, zone_id, &op, &format!("re-apply failed: {e}"))
                        .await?;
                }
            }
        } else {
            let restored = match &prior {
                Some(metadata) => meta.put_file(zone_id, metadata, None).await.map(|_| ()),
                None => meta.delete_file(zone_id, &op.file_path, None).await,
            };
            match restored {
                Ok(()) => {
                    report.rolled_back += 1;
                    report.quarantined += 1;
                    tracing::warn!(
                        zone = %zone_id,
                        path = %op.file_path,
                        op = %op.op_id,
                        "rolled back diverged write during recovery"
                    );
                    quarantine(&records, zone_id, &op, "rolled back to pre-write state")
                        .await?;
                }
                Err(e) => {
                    report.quarantined += 1;
                    quarantine(&records, zone_id, &op, &format!("rollback failed: {e}"))
                        .await?;
                }
            }
        }
    }

    if report.reapplied > 0 || report.rolled_back > 0 || report.quarantined > 0 {
        tracing::warn!(
            zone = %zone_id,
            checked = report.ops_checked,
            reapplied = report.reapplied,
            rolled_back = report.rolled_back,
            quarantined = report.quarantined,
            "recovery pass found divergence"
        );
    }
    Ok(report)
}

/// Metadata matching the state a diverged write's log row claims.
///
/// Identity fields come from the prior metadata when the write was an
/// overwrite; a torn create falls back to the log row's subject and the
/// kernel defaults. The etag is fresh: the one the original commit would
/// have produced is unrecoverable, and callers holding the old token get
/// the precondition failure they should.
fn forward_complete(
    op: &OperationLogEntry,
    prior: Option<&FileMetadata>,
    content_hash: &str,
    fs: &NexusFilesystem,
) -> FileMetadata {
    let size_bytes = op
        .details
        .get("size_bytes")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    let backend_id = op
        .details
        .get("backend_id")
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .or_else(|| prior.map(|m| m.backend_id.clone()))
        .unwrap_or_else(|| fs.config().default_backend.clone());

    FileMetadata {
        path: op.file_path.clone(),
        content_hash: Some(content_hash.to_string()),
        size_bytes,
        backend_id,
        etag: Uuid::new_v4().to_string(),
        owner: prior.map_or_else(|| op.subject.clone(), |m| m.owner.clone()),
        group: prior.and_then(|m| m.group.clone()),
        mode: prior.map_or(0o644, |m| m.mode),
        created_at: prior.map_or(op.timestamp, |m| m.created_at),
        modified_at: prior.map_or(op.timestamp, |m| op.timestamp.max(m.modified_at + 1)),
        entry_type: EntryType::Regular,
        target_zone_id: None,
    }
}

async fn quarantine(
    records: &Arc<dyn RecordStore>,
    zone_id: ZoneId,
    op: &OperationLogEntry,
    reason: &str,
) -> KernelResult<()> {
    records
        .append_quarantine(&QuarantineRecord {
            zone_id,
            op_id: op.op_id,
            reason: reason.to_string(),
            recorded_at: now_micros(),
        })
        .await
}

impl NexusFilesystem {
    pub(crate) fn records_handle(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.records)
    }

    pub(crate) fn metadata_handle(&self) -> MetadataStore {
        self.meta.clone()
    }

    /// Operator view of quarantined divergences.
    pub async fn list_quarantine(
        &self,
        zone_id: ZoneId,
    ) -> KernelResult<Vec<QuarantineRecord>> {
        self.records.list_quarantine(zone_id).await
    }
}
