//! Persistent entity types of the storage kernel.
//!
//! Every entity below is scoped to exactly one zone; queries against the
//! relational pillar always filter by `zone_id`. Timestamps are microseconds
//! since the Unix epoch (see [`crate::time`]).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KernelError, KernelResult};
use crate::path::VirtualPath;

/// Top-level isolation boundary identifier.
pub type ZoneId = Uuid;

/// Operation-log entry identifier.
pub type OpId = Uuid;

/// Relationship-tuple identifier.
pub type TupleId = Uuid;

// ---------------------------------------------------------------------------
// Subject
// ---------------------------------------------------------------------------

/// Anything that can act on the filesystem, identified as `type:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    /// Subject class: `agent`, `user`, `group`, `service`, ...
    pub kind: String,
    /// Identifier within the class.
    pub id: String,
}

impl Subject {
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn agent(id: impl Into<String>) -> Self {
        Self::new("agent", id)
    }

    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self::new("user", id)
    }

    #[must_use]
    pub fn group(id: impl Into<String>) -> Self {
        Self::new("group", id)
    }

    /// The unauthenticated subject.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new("anonymous", "anonymous")
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.kind == "anonymous"
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        self.kind == "group"
    }

    /// Parses the canonical `type:id` form.
    pub fn parse(s: &str) -> KernelResult<Self> {
        match s.split_once(':') {
            Some((kind, id)) if !kind.is_empty() && !id.is_empty() => {
                Ok(Self::new(kind, id))
            }
            _ => Err(KernelError::invalid_argument(format!(
                "subject must be type:id, got {s:?}"
            ))),
        }
    }

    /// The subject viewed as a ReBAC graph node.
    #[must_use]
    pub fn as_object(&self) -> ObjectRef {
        ObjectRef::new(self.kind.clone(), self.id.clone())
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ---------------------------------------------------------------------------
// ObjectRef
// ---------------------------------------------------------------------------

/// A node in the relationship graph, identified as `type:id`.
///
/// Files appear as `file:/workspace/a.txt`, groups as `group:devs`, zones
/// as `zone:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: String,
    pub id: String,
}

impl ObjectRef {
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn file(path: &VirtualPath) -> Self {
        Self::new("file", path.as_str())
    }

    #[must_use]
    pub fn zone(zone_id: ZoneId) -> Self {
        Self::new("zone", zone_id.to_string())
    }

    /// The object viewed as a subject, for tuple-to-userset recursion.
    #[must_use]
    pub fn as_subject(&self) -> Subject {
        Subject::new(self.kind.clone(), self.id.clone())
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

/// Top-level isolation boundary (formerly "tenant").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: ZoneId,
    /// Unique human-readable name.
    pub name: String,
    pub created_at: i64,
    /// Soft-delete flag; deleted zones reject all access.
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// FileMetadata
// ---------------------------------------------------------------------------

/// Kind of a namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Regular,
    Directory,
    /// Redirects the namespace into another zone.
    Mount,
}

/// The inode-equivalent, stored in the Metastore under `zone_id/virtual_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: VirtualPath,
    /// 64-hex SHA-256 of the content; `None` for directories and mounts.
    pub content_hash: Option<String>,
    pub size_bytes: u64,
    /// Which object store holds the content.
    pub backend_id: String,
    /// Opaque token identifying this version, for optimistic concurrency.
    pub etag: String,
    pub owner: Subject,
    pub group: Option<String>,
    /// POSIX-style permission bits (12 bits used).
    pub mode: u16,
    pub created_at: i64,
    pub modified_at: i64,
    pub entry_type: EntryType,
    /// Set only when `entry_type` is [`EntryType::Mount`].
    pub target_zone_id: Option<ZoneId>,
}

impl FileMetadata {
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self.entry_type, EntryType::Directory)
    }

    #[must_use]
    pub fn is_mount(&self) -> bool {
        matches!(self.entry_type, EntryType::Mount)
    }
}

// ---------------------------------------------------------------------------
// ContentChunk
// ---------------------------------------------------------------------------

/// CAS index entry, keyed by content hash. Local to each node, not replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChunk {
    pub content_hash: String,
    pub size_bytes: u64,
    /// Live references (file metadata, version history, retained undo slots).
    pub refcount: u64,
    pub first_seen_at: i64,
    /// Set when the refcount reached zero; the blob is deleted once the
    /// grace period has elapsed.
    pub tombstoned_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Operation log
// ---------------------------------------------------------------------------

/// Kind of a logged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Write,
    Delete,
    Rename,
    Chmod,
    Chown,
    Mkdir,
    TagSet,
    TagDelete,
    /// The inversion of a prior entry; its undo state is redo data.
    Undo,
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::Chmod => "chmod",
            Self::Chown => "chown",
            Self::Mkdir => "mkdir",
            Self::TagSet => "tag_set",
            Self::TagDelete => "tag_delete",
            Self::Undo => "undo",
        };
        f.write_str(s)
    }
}

/// One row per mutating operation. Append-only; `undone` is the only
/// mutable field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub op_id: OpId,
    pub zone_id: ZoneId,
    pub subject: Subject,
    pub op_type: OpType,
    pub file_path: VirtualPath,
    pub timestamp: i64,
    /// Op-specific payload (new hash, copy source, ...).
    pub details: serde_json::Value,
    /// Minimum data needed to invert the operation without reading earlier
    /// log entries. Non-null for write/delete/rename.
    pub undo_state: Option<serde_json::Value>,
    pub undone: bool,
}

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

/// Free-form key-value attribute attached to a file.
///
/// Kept separate from `FileMetadata` so user-defined attributes need no
/// schema changes. Composite primary key `(zone_id, file_path, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub zone_id: ZoneId,
    pub file_path: VirtualPath,
    pub key: String,
    pub value: String,
}

// ---------------------------------------------------------------------------
// ReBAC
// ---------------------------------------------------------------------------

/// A relationship edge: `(subject) --relation--> (object)`.
///
/// Subject and object always share the tuple's zone; cross-zone tuples are
/// rejected on write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebacTuple {
    pub tuple_id: TupleId,
    pub zone_id: ZoneId,
    pub subject: Subject,
    pub relation: String,
    pub object: ObjectRef,
    pub created_at: i64,
    /// Expiring grants; `None` means permanent.
    pub expires_at: Option<i64>,
}

impl RebacTuple {
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }
}

// ---------------------------------------------------------------------------
// Version history
// ---------------------------------------------------------------------------

/// One row per superseded content binding of a path; append-only.
///
/// The currently live content is described by `FileMetadata`, not by a
/// history row; a row is appended at the moment its content stops being
/// current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryEntry {
    pub zone_id: ZoneId,
    pub path: VirtualPath,
    /// Monotonic per path, assigned by the record store on append.
    pub version_number: u64,
    pub content_hash: String,
    pub size_bytes: u64,
    /// When this content became current (not when it was superseded), so
    /// time-travel reads can binary-search on it.
    pub created_at: i64,
    pub created_by: Subject,
}

// ---------------------------------------------------------------------------
// Path registrations
// ---------------------------------------------------------------------------

/// Discriminant for a registered root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationType {
    Workspace,
    Memory,
}

/// Registration of a workspace or memory root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRegistration {
    pub zone_id: ZoneId,
    pub path: VirtualPath,
    pub registration_type: RegistrationType,
    pub owner: Subject,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}
