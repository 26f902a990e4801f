//! Operation log: the append-only journal and the undo-state model.
//!
//! Every mutation the filesystem core performs commits a log row in the
//! same write group as the state it describes, so log and metadata cannot
//! diverge. Each row's [`UndoState`] carries the minimum data needed to
//! invert the operation without reading older log entries; applying an
//! inversion yields the redo state recorded on the resulting `undo` row.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nexus_core::{
    now_micros, FileMetadata, KernelError, KernelResult, OpId, OpType, OperationLogEntry,
    Subject, VirtualPath, ZoneId,
};

/// Reversal payload of one log row.
///
/// Every variant describes the state an inversion must restore. Variants
/// come in self-inverse pairs: applying one yields the other as redo data
/// (`Write`/`Chmod`/`Chown`/`Rename`/`Tag` are their own inverses,
/// `Delete`/`Unlink` and `Rmdir`/`Delete` invert each other).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoState {
    /// Restore `prior` as the current metadata (`None`: the write created
    /// the file, so the inversion removes it). Content references move with
    /// the transition: the replaced hash is released, the restored hash
    /// re-referenced.
    Write { prior: Option<FileMetadata> },
    /// Re-create an entry removed by a delete. Applying adds a fresh
    /// content reference for the restored metadata entry (the deleted
    /// content's original reference lives on in the version row the delete
    /// appended).
    Delete { prior: FileMetadata },
    /// Remove the entry again, releasing the restored metadata reference.
    Unlink,
    /// Remove an empty directory created by mkdir.
    Rmdir,
    /// Move the entry back to its prior path.
    Rename { prior_path: VirtualPath },
    Chmod { prior_mode: u16 },
    Chown {
        prior_owner: Subject,
        prior_group: Option<String>,
    },
    /// Restore a tag to `value` (`None` removes it).
    Tag {
        key: String,
        value: Option<String>,
    },
}

impl UndoState {
    /// Encode for the log row's JSON column.
    pub fn to_value(&self) -> KernelResult<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| KernelError::internal(format!("encode undo state: {e}")))
    }

    /// Decode a log row's undo state.
    pub fn from_entry(entry: &OperationLogEntry) -> KernelResult<Self> {
        let raw = entry.undo_state.as_ref().ok_or_else(|| {
            KernelError::internal(format!("op {} has no undo state", entry.op_id))
        })?;
        serde_json::from_value(raw.clone())
            .map_err(|e| KernelError::internal(format!("corrupt undo state: {e}")))
    }
}

/// Details payload of an `undo` row, pointing back at the inverted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoDetails {
    pub original_op_id: OpId,
    pub original_op_type: OpType,
}

/// Builds a log row for a mutation.
pub fn log_entry(
    zone_id: ZoneId,
    subject: &Subject,
    op_type: OpType,
    path: &VirtualPath,
    details: serde_json::Value,
    undo_state: Option<&UndoState>,
) -> KernelResult<OperationLogEntry> {
    let undo_state = undo_state.map(UndoState::to_value).transpose()?;
    Ok(OperationLogEntry {
        op_id: Uuid::new_v4(),
        zone_id,
        subject: subject.clone(),
        op_type,
        file_path: path.clone(),
        timestamp: now_micros(),
        details,
        undo_state,
        undone: false,
    })
}
