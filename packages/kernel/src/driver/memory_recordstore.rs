//! In-memory [`RecordStore`] driver.
//!
//! All tables live behind one mutex, which makes write groups trivially
//! atomic: a group either applies entirely inside the critical section or
//! not at all. No await happens while the lock is held.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use nexus_core::{
    KernelError, KernelResult, ObjectRef, OpId, OperationLogEntry, PathRegistration, RebacTuple,
    RegistrationType, Subject, Tag, TupleId, VersionHistoryEntry, VirtualPath, Zone, ZoneId,
};

use crate::pillar::recordstore::{
    OpLogFilter, QuarantineRecord, RebacChange, RebacChangeKind, RecordStore, WriteGroup,
};

#[derive(Default)]
struct Inner {
    zones: HashMap<ZoneId, Zone>,
    ops: Vec<OperationLogEntry>,
    op_index: HashMap<(ZoneId, OpId), usize>,
    tags: HashMap<(ZoneId, VirtualPath, String), String>,
    tuples: Vec<RebacTuple>,
    rebac_changes: Vec<RebacChange>,
    rebac_sequences: HashMap<ZoneId, u64>,
    /// `None` per zone until the first closure build completes.
    closures: HashMap<ZoneId, Vec<(Subject, ObjectRef)>>,
    versions: HashMap<(ZoneId, VirtualPath), Vec<VersionHistoryEntry>>,
    version_counters: HashMap<(ZoneId, VirtualPath), u64>,
    registrations: Vec<PathRegistration>,
    quarantine: Vec<QuarantineRecord>,
}

/// Relational driver for development and tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn require_zone(zone_id: ZoneId) -> KernelResult<()> {
    if zone_id == Uuid::nil() {
        return Err(KernelError::invalid_argument(
            "zone-scoped query without zone_id",
        ));
    }
    Ok(())
}

fn matches_filter(entry: &OperationLogEntry, filter: &OpLogFilter) -> bool {
    if let Some(subject) = &filter.subject {
        if entry.subject != *subject {
            return false;
        }
    }
    if let Some(op_type) = filter.op_type {
        if entry.op_type != op_type {
            return false;
        }
    }
    if let Some(path) = &filter.path {
        let hit = if filter.path_prefix {
            entry.file_path == *path || entry.file_path.is_inside(path)
        } else {
            entry.file_path == *path
        };
        if !hit {
            return false;
        }
    }
    if let Some(since) = filter.since_micros {
        if entry.timestamp < since {
            return false;
        }
    }
    if let Some(until) = filter.until_micros {
        if entry.timestamp > until {
            return false;
        }
    }
    true
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    // --- Zones ---

    async fn create_zone(&self, zone: &Zone) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        if inner.zones.contains_key(&zone.zone_id) {
            return Err(KernelError::Constraint {
                constraint: "zones.zone_id unique".into(),
            });
        }
        if inner.zones.values().any(|z| z.name == zone.name) {
            return Err(KernelError::Constraint {
                constraint: "zones.name unique".into(),
            });
        }
        inner.zones.insert(zone.zone_id, zone.clone());
        Ok(())
    }

    async fn get_zone(&self, zone_id: ZoneId) -> KernelResult<Option<Zone>> {
        require_zone(zone_id)?;
        Ok(self.inner.lock().zones.get(&zone_id).cloned())
    }

    async fn get_zone_by_name(&self, name: &str) -> KernelResult<Option<Zone>> {
        Ok(self
            .inner
            .lock()
            .zones
            .values()
            .find(|z| z.name == name)
            .cloned())
    }

    async fn soft_delete_zone(&self, zone_id: ZoneId) -> KernelResult<()> {
        require_zone(zone_id)?;
        let mut inner = self.inner.lock();
        match inner.zones.get_mut(&zone_id) {
            Some(zone) => {
                zone.deleted = true;
                Ok(())
            }
            None => Err(KernelError::not_found(zone_id.to_string())),
        }
    }

    // --- Operation log ---

    async fn commit_write_group(
        &self,
        zone_id: ZoneId,
        group: WriteGroup,
    ) -> KernelResult<Vec<u64>> {
        require_zone(zone_id)?;
        let mut inner = self.inner.lock();

        // Validate the whole group before mutating anything: full commit or
        // full abort.
        for op in &group.ops {
            if op.zone_id != zone_id {
                return Err(KernelError::Constraint {
                    constraint: "operation_log.zone_id matches group zone".into(),
                });
            }
            if inner.op_index.contains_key(&(zone_id, op.op_id)) {
                return Err(KernelError::Constraint {
                    constraint: "operation_log.op_id unique".into(),
                });
            }
        }
        for (op_id, _) in &group.mark_undone {
            if !inner.op_index.contains_key(&(zone_id, *op_id)) {
                return Err(KernelError::not_found(op_id.to_string()));
            }
        }

        for op in group.ops {
            let idx = inner.ops.len();
            inner.op_index.insert((zone_id, op.op_id), idx);
            inner.ops.push(op);
        }

        let mut assigned = Vec::with_capacity(group.versions.len());
        for mut version in group.versions {
            let key = (zone_id, version.path.clone());
            let counter = inner.version_counters.entry(key.clone()).or_insert(0);
            *counter += 1;
            version.version_number = *counter;
            assigned.push(*counter);
            inner.versions.entry(key).or_default().push(version);
        }

        for (op_id, undone) in group.mark_undone {
            if let Some(&idx) = inner.op_index.get(&(zone_id, op_id)) {
                inner.ops[idx].undone = undone;
            }
        }

        Ok(assigned)
    }

    async fn get_op(
        &self,
        zone_id: ZoneId,
        op_id: OpId,
    ) -> KernelResult<Option<OperationLogEntry>> {
        require_zone(zone_id)?;
        let inner = self.inner.lock();
        Ok(inner
            .op_index
            .get(&(zone_id, op_id))
            .map(|&idx| inner.ops[idx].clone()))
    }

    async fn query_ops(
        &self,
        zone_id: ZoneId,
        filter: &OpLogFilter,
    ) -> KernelResult<Vec<OperationLogEntry>> {
        require_zone(zone_id)?;
        let inner = self.inner.lock();
        let mut out: Vec<OperationLogEntry> = inner
            .ops
            .iter()
            .rev()
            .filter(|op| op.zone_id == zone_id && matches_filter(op, filter))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        // Newest first by append order; rev() above already gives that.
        out.shrink_to_fit();
        Ok(out)
    }

    // --- Tags ---

    async fn set_tag(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        key: &str,
        value: &str,
    ) -> KernelResult<Option<String>> {
        require_zone(zone_id)?;
        Ok(self.inner.lock().tags.insert(
            (zone_id, path.clone(), key.to_string()),
            value.to_string(),
        ))
    }

    async fn delete_tag(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        key: &str,
    ) -> KernelResult<Option<String>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .tags
            .remove(&(zone_id, path.clone(), key.to_string())))
    }

    async fn list_tags(&self, zone_id: ZoneId, path: &VirtualPath) -> KernelResult<Vec<Tag>> {
        require_zone(zone_id)?;
        let inner = self.inner.lock();
        let mut tags: Vec<Tag> = inner
            .tags
            .iter()
            .filter(|((z, p, _), _)| *z == zone_id && p == path)
            .map(|((z, p, k), v)| Tag {
                zone_id: *z,
                file_path: p.clone(),
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        tags.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(tags)
    }

    // --- ReBAC tuples ---

    async fn insert_tuple(&self, tuple: &RebacTuple) -> KernelResult<TupleId> {
        require_zone(tuple.zone_id)?;
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.tuples.iter().find(|t| {
            t.zone_id == tuple.zone_id
                && t.subject == tuple.subject
                && t.relation == tuple.relation
                && t.object == tuple.object
        }) {
            return Ok(existing.tuple_id);
        }
        inner.tuples.push(tuple.clone());
        Ok(tuple.tuple_id)
    }

    async fn delete_tuple(
        &self,
        zone_id: ZoneId,
        tuple_id: TupleId,
    ) -> KernelResult<Option<RebacTuple>> {
        require_zone(zone_id)?;
        let mut inner = self.inner.lock();
        let pos = inner
            .tuples
            .iter()
            .position(|t| t.zone_id == zone_id && t.tuple_id == tuple_id);
        Ok(pos.map(|idx| inner.tuples.remove(idx)))
    }

    async fn find_tuple(
        &self,
        zone_id: ZoneId,
        subject: &Subject,
        relation: &str,
        object: &ObjectRef,
    ) -> KernelResult<Option<RebacTuple>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .tuples
            .iter()
            .find(|t| {
                t.zone_id == zone_id
                    && t.subject == *subject
                    && t.relation == relation
                    && t.object == *object
            })
            .cloned())
    }

    async fn tuples_for_object(
        &self,
        zone_id: ZoneId,
        object: &ObjectRef,
        relation: Option<&str>,
    ) -> KernelResult<Vec<RebacTuple>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .tuples
            .iter()
            .filter(|t| {
                t.zone_id == zone_id
                    && t.object == *object
                    && relation.is_none_or(|r| t.relation == r)
            })
            .cloned()
            .collect())
    }

    async fn tuples_for_subject(
        &self,
        zone_id: ZoneId,
        subject: &Subject,
    ) -> KernelResult<Vec<RebacTuple>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .tuples
            .iter()
            .filter(|t| t.zone_id == zone_id && t.subject == *subject)
            .cloned()
            .collect())
    }

    async fn member_of_tuples(&self, zone_id: ZoneId) -> KernelResult<Vec<RebacTuple>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .tuples
            .iter()
            .filter(|t| t.zone_id == zone_id && t.relation == "member-of")
            .cloned()
            .collect())
    }

    async fn list_tuples(
        &self,
        zone_id: ZoneId,
        subject: Option<&Subject>,
        relation: Option<&str>,
        object: Option<&ObjectRef>,
    ) -> KernelResult<Vec<RebacTuple>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .tuples
            .iter()
            .filter(|t| {
                t.zone_id == zone_id
                    && subject.is_none_or(|s| t.subject == *s)
                    && relation.is_none_or(|r| t.relation == r)
                    && object.is_none_or(|o| t.object == *o)
            })
            .cloned()
            .collect())
    }

    // --- ReBAC changelog ---

    async fn append_rebac_change(
        &self,
        zone_id: ZoneId,
        kind: RebacChangeKind,
        tuple_id: Option<TupleId>,
    ) -> KernelResult<u64> {
        require_zone(zone_id)?;
        let mut inner = self.inner.lock();
        let sequence = inner.rebac_sequences.entry(zone_id).or_insert(0);
        *sequence += 1;
        let sequence = *sequence;
        inner.rebac_changes.push(RebacChange {
            sequence,
            zone_id,
            kind,
            tuple_id,
            timestamp: nexus_core::now_micros(),
        });
        Ok(sequence)
    }

    async fn rebac_sequence(&self, zone_id: ZoneId) -> KernelResult<u64> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .rebac_sequences
            .get(&zone_id)
            .copied()
            .unwrap_or(0))
    }

    // --- Group closure ---

    async fn replace_group_closure(
        &self,
        zone_id: ZoneId,
        rows: Vec<(Subject, ObjectRef)>,
    ) -> KernelResult<()> {
        require_zone(zone_id)?;
        self.inner.lock().closures.insert(zone_id, rows);
        Ok(())
    }

    async fn closure_groups_for(
        &self,
        zone_id: ZoneId,
        member: &Subject,
    ) -> KernelResult<Option<Vec<ObjectRef>>> {
        require_zone(zone_id)?;
        let inner = self.inner.lock();
        Ok(inner.closures.get(&zone_id).map(|rows| {
            rows.iter()
                .filter(|(m, _)| m == member)
                .map(|(_, g)| g.clone())
                .collect()
        }))
    }

    async fn closure_members_of(
        &self,
        zone_id: ZoneId,
        group: &ObjectRef,
    ) -> KernelResult<Vec<Subject>> {
        require_zone(zone_id)?;
        let inner = self.inner.lock();
        Ok(inner
            .closures
            .get(&zone_id)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, g)| g == group)
                    .map(|(m, _)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    // --- Version history ---

    async fn list_versions(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
    ) -> KernelResult<Vec<VersionHistoryEntry>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .versions
            .get(&(zone_id, path.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_version(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        version_number: u64,
    ) -> KernelResult<Option<VersionHistoryEntry>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .versions
            .get(&(zone_id, path.clone()))
            .and_then(|rows| rows.iter().find(|v| v.version_number == version_number))
            .cloned())
    }

    async fn version_at(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        at_micros: i64,
    ) -> KernelResult<Option<VersionHistoryEntry>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .versions
            .get(&(zone_id, path.clone()))
            .and_then(|rows| {
                rows.iter()
                    .filter(|v| v.created_at <= at_micros)
                    .max_by_key(|v| (v.created_at, v.version_number))
            })
            .cloned())
    }

    async fn rename_path_rows(
        &self,
        zone_id: ZoneId,
        from: &VirtualPath,
        to: &VirtualPath,
    ) -> KernelResult<()> {
        require_zone(zone_id)?;
        let mut inner = self.inner.lock();

        let tag_keys: Vec<(ZoneId, VirtualPath, String)> = inner
            .tags
            .keys()
            .filter(|(z, p, _)| *z == zone_id && p == from)
            .cloned()
            .collect();
        for key in tag_keys {
            if let Some(value) = inner.tags.remove(&key) {
                inner.tags.insert((zone_id, to.clone(), key.2), value);
            }
        }

        if let Some(mut rows) = inner.versions.remove(&(zone_id, from.clone())) {
            for row in &mut rows {
                row.path = to.clone();
            }
            inner.versions.insert((zone_id, to.clone()), rows);
        }
        if let Some(counter) = inner.version_counters.remove(&(zone_id, from.clone())) {
            inner.version_counters.insert((zone_id, to.clone()), counter);
        }
        Ok(())
    }

    // --- Path registrations ---

    async fn register_path(&self, registration: &PathRegistration) -> KernelResult<()> {
        require_zone(registration.zone_id)?;
        let mut inner = self.inner.lock();
        if inner
            .registrations
            .iter()
            .any(|r| r.zone_id == registration.zone_id && r.path == registration.path)
        {
            return Err(KernelError::Constraint {
                constraint: "path_registrations.(zone_id, path) unique".into(),
            });
        }
        inner.registrations.push(registration.clone());
        Ok(())
    }

    async fn list_registrations(
        &self,
        zone_id: ZoneId,
        registration_type: Option<RegistrationType>,
    ) -> KernelResult<Vec<PathRegistration>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .registrations
            .iter()
            .filter(|r| {
                r.zone_id == zone_id
                    && registration_type.is_none_or(|t| r.registration_type == t)
            })
            .cloned()
            .collect())
    }

    // --- Quarantine ---

    async fn append_quarantine(&self, record: &QuarantineRecord) -> KernelResult<()> {
        require_zone(record.zone_id)?;
        self.inner.lock().quarantine.push(record.clone());
        Ok(())
    }

    async fn list_quarantine(&self, zone_id: ZoneId) -> KernelResult<Vec<QuarantineRecord>> {
        require_zone(zone_id)?;
        Ok(self
            .inner
            .lock()
            .quarantine
            .iter()
            .filter(|q| q.zone_id == zone_id)
            .cloned()
            .collect())
    }
}
