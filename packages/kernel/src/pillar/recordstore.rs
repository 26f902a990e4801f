//! Relational ACID pillar.
//!
//! The contract is the set of typed operations the kernel performs against
//! the tables of the data model, not a query language. Every operation takes
//! a `zone_id` and drivers must reject the nil zone, so tenant isolation is
//! enforced at the pillar boundary rather than in each caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use nexus_core::{
    KernelResult, ObjectRef, OpId, OperationLogEntry, PathRegistration, RebacTuple,
    RegistrationType, Subject, Tag, TupleId, VersionHistoryEntry, VirtualPath, Zone, ZoneId,
};

/// Filter for operation-log queries. All clauses are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct OpLogFilter {
    pub subject: Option<Subject>,
    pub op_type: Option<nexus_core::OpType>,
    /// Exact path, or a directory whose subtree matches when `path_prefix`.
    pub path: Option<VirtualPath>,
    pub path_prefix: bool,
    pub since_micros: Option<i64>,
    pub until_micros: Option<i64>,
    pub limit: Option<usize>,
}

/// Kind of a ReBAC changelog row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebacChangeKind {
    Grant,
    Revoke,
    ClosureRebuild,
}

/// One row in the ReBAC changelog; sequence numbers double as the
/// permission-cache version token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebacChange {
    pub sequence: u64,
    pub zone_id: ZoneId,
    pub kind: RebacChangeKind,
    pub tuple_id: Option<TupleId>,
    pub timestamp: i64,
}

/// A divergence quarantined by the startup recovery pass, for operator review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub zone_id: ZoneId,
    pub op_id: OpId,
    pub reason: String,
    pub recorded_at: i64,
}

/// The rows committed atomically for one filesystem mutation.
///
/// The operation log and the state it describes must never diverge, so the
/// log append, the optional version-history append, and the optional
/// undone-flag flip commit as one transaction.
#[derive(Debug, Clone, Default)]
pub struct WriteGroup {
    pub ops: Vec<OperationLogEntry>,
    /// Superseded content bindings; `version_number` is assigned on commit.
    pub versions: Vec<VersionHistoryEntry>,
    /// `(op_id, undone)` flips applied with the group (used by undo/redo).
    pub mark_undone: Vec<(OpId, bool)>,
}

impl WriteGroup {
    #[must_use]
    pub fn for_op(op: OperationLogEntry) -> Self {
        Self {
            ops: vec![op],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: VersionHistoryEntry) -> Self {
        self.versions.push(version);
        self
    }

    #[must_use]
    pub fn with_undone_flip(mut self, op_id: OpId, undone: bool) -> Self {
        self.mark_undone.push((op_id, undone));
        self
    }
}

/// Relational pillar over the kernel's tables.
///
/// Transactions either fully commit or fully abort; constraint violations
/// surface as typed `Constraint` errors naming the broken invariant.
/// Used as `Arc<dyn RecordStore>`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // --- Zones ---

    /// Insert a zone. Fails `Constraint` on duplicate id or name.
    async fn create_zone(&self, zone: &Zone) -> KernelResult<()>;

    async fn get_zone(&self, zone_id: ZoneId) -> KernelResult<Option<Zone>>;

    async fn get_zone_by_name(&self, name: &str) -> KernelResult<Option<Zone>>;

    /// Soft-delete: the zone row stays, all access is rejected.
    async fn soft_delete_zone(&self, zone_id: ZoneId) -> KernelResult<()>;

    // --- Operation log ---

    /// Commit a [`WriteGroup`] atomically.
    ///
    /// Returns the version numbers assigned to `group.versions`, in order.
    async fn commit_write_group(
        &self,
        zone_id: ZoneId,
        group: WriteGroup,
    ) -> KernelResult<Vec<u64>>;

    async fn get_op(&self, zone_id: ZoneId, op_id: OpId)
        -> KernelResult<Option<OperationLogEntry>>;

    /// Query log entries matching `filter`, newest first.
    async fn query_ops(
        &self,
        zone_id: ZoneId,
        filter: &OpLogFilter,
    ) -> KernelResult<Vec<OperationLogEntry>>;

    // --- Tags ---

    /// Upsert a tag, returning the prior value if any.
    async fn set_tag(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        key: &str,
        value: &str,
    ) -> KernelResult<Option<String>>;

    /// Delete a tag, returning the removed value if it existed.
    async fn delete_tag(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        key: &str,
    ) -> KernelResult<Option<String>>;

    async fn list_tags(&self, zone_id: ZoneId, path: &VirtualPath) -> KernelResult<Vec<Tag>>;

    // --- ReBAC tuples ---

    /// Insert a tuple. Idempotent: a tuple with identical
    /// `(subject, relation, object)` returns the existing id.
    async fn insert_tuple(&self, tuple: &RebacTuple) -> KernelResult<TupleId>;

    /// Delete by id, returning the removed tuple.
    async fn delete_tuple(
        &self,
        zone_id: ZoneId,
        tuple_id: TupleId,
    ) -> KernelResult<Option<RebacTuple>>;

    /// Exact-match lookup on `(subject, relation, object)`.
    async fn find_tuple(
        &self,
        zone_id: ZoneId,
        subject: &Subject,
        relation: &str,
        object: &ObjectRef,
    ) -> KernelResult<Option<RebacTuple>>;

    /// Tuples pointing at `object`, optionally restricted to one relation.
    async fn tuples_for_object(
        &self,
        zone_id: ZoneId,
        object: &ObjectRef,
        relation: Option<&str>,
    ) -> KernelResult<Vec<RebacTuple>>;

    /// Tuples whose subject is `subject`.
    async fn tuples_for_subject(
        &self,
        zone_id: ZoneId,
        subject: &Subject,
    ) -> KernelResult<Vec<RebacTuple>>;

    /// All `member-of` tuples in the zone (closure rebuild input).
    async fn member_of_tuples(&self, zone_id: ZoneId) -> KernelResult<Vec<RebacTuple>>;

    /// Tuples matching the given filters (all optional, conjunctive).
    async fn list_tuples(
        &self,
        zone_id: ZoneId,
        subject: Option<&Subject>,
        relation: Option<&str>,
        object: Option<&ObjectRef>,
    ) -> KernelResult<Vec<RebacTuple>>;

    // --- ReBAC changelog ---

    /// Append a changelog row; the store assigns the zone-wide sequence.
    async fn append_rebac_change(
        &self,
        zone_id: ZoneId,
        kind: RebacChangeKind,
        tuple_id: Option<TupleId>,
    ) -> KernelResult<u64>;

    /// Highest changelog sequence for the zone (0 when empty).
    async fn rebac_sequence(&self, zone_id: ZoneId) -> KernelResult<u64>;

    // --- Group closure ---

    /// Replace the full closure for the zone in one transaction.
    ///
    /// `rows` maps each member to every transitively reachable group.
    async fn replace_group_closure(
        &self,
        zone_id: ZoneId,
        rows: Vec<(Subject, ObjectRef)>,
    ) -> KernelResult<()>;

    /// Transitively reachable groups for a member, or `None` while the
    /// closure for this zone has never been built (callers fall back to
    /// on-the-fly traversal).
    async fn closure_groups_for(
        &self,
        zone_id: ZoneId,
        member: &Subject,
    ) -> KernelResult<Option<Vec<ObjectRef>>>;

    /// Members that transitively reach `group` (expand support).
    async fn closure_members_of(
        &self,
        zone_id: ZoneId,
        group: &ObjectRef,
    ) -> KernelResult<Vec<Subject>>;

    // --- Version history ---

    async fn list_versions(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
    ) -> KernelResult<Vec<VersionHistoryEntry>>;

    async fn get_version(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        version_number: u64,
    ) -> KernelResult<Option<VersionHistoryEntry>>;

    /// Latest version row with `created_at <= at_micros`.
    async fn version_at(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        at_micros: i64,
    ) -> KernelResult<Option<VersionHistoryEntry>>;

    /// Re-key tags and version rows from `from` to `to` (rename/move).
    async fn rename_path_rows(
        &self,
        zone_id: ZoneId,
        from: &VirtualPath,
        to: &VirtualPath,
    ) -> KernelResult<()>;

    // --- Path registrations ---

    /// Register a workspace or memory root. Fails `Constraint` when the
    /// path is already registered.
    async fn register_path(&self, registration: &PathRegistration) -> KernelResult<()>;

    async fn list_registrations(
        &self,
        zone_id: ZoneId,
        registration_type: Option<RegistrationType>,
    ) -> KernelResult<Vec<PathRegistration>>;

    // --- Quarantine ---

    async fn append_quarantine(&self, record: &QuarantineRecord) -> KernelResult<()>;

    async fn list_quarantine(&self, zone_id: ZoneId) -> KernelResult<Vec<QuarantineRecord>>;
}
