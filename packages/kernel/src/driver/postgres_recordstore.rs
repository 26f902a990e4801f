//! Networked SQL [`RecordStore`] driver over PostgreSQL (feature `postgres`).
//!
//! Runtime-checked `sqlx` queries; write groups commit inside one
//! transaction so the operation log and the state it describes cannot
//! diverge. Unique and foreign-key violations surface as typed `Constraint`
//! errors naming the violated invariant.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

use nexus_core::{
    KernelError, KernelResult, ObjectRef, OpId, OpType, OperationLogEntry, PathRegistration,
    RebacTuple, RegistrationType, Subject, Tag, TupleId, VersionHistoryEntry, VirtualPath, Zone,
    ZoneId,
};

use crate::pillar::recordstore::{
    OpLogFilter, QuarantineRecord, RebacChangeKind, RecordStore, WriteGroup,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS zones (
    zone_id UUID PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at BIGINT NOT NULL,
    deleted BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE TABLE IF NOT EXISTS operation_log (
    op_id UUID NOT NULL,
    zone_id UUID NOT NULL REFERENCES zones(zone_id),
    subject TEXT NOT NULL,
    op_type TEXT NOT NULL,
    file_path TEXT NOT NULL,
    timestamp BIGINT NOT NULL,
    details JSONB NOT NULL,
    undo_state JSONB,
    undone BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY (zone_id, op_id)
);
CREATE INDEX IF NOT EXISTS operation_log_path_idx
    ON operation_log (zone_id, file_path, timestamp);
CREATE TABLE IF NOT EXISTS tags (
    zone_id UUID NOT NULL REFERENCES zones(zone_id),
    file_path TEXT NOT NULL,
    tag_key TEXT NOT NULL,
    tag_value TEXT NOT NULL,
    PRIMARY KEY (zone_id, file_path, tag_key)
);
CREATE TABLE IF NOT EXISTS rebac_tuples (
    tuple_id UUID PRIMARY KEY,
    zone_id UUID NOT NULL REFERENCES zones(zone_id),
    subject_type TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    object_type TEXT NOT NULL,
    object_id TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    expires_at BIGINT,
    UNIQUE (zone_id, subject_type, subject_id, relation, object_type, object_id)
);
CREATE INDEX IF NOT EXISTS rebac_tuples_subject_idx
    ON rebac_tuples (zone_id, subject_type, subject_id);
CREATE INDEX IF NOT EXISTS rebac_tuples_object_idx
    ON rebac_tuples (zone_id, object_type, object_id, relation);
CREATE TABLE IF NOT EXISTS rebac_changelog (
    zone_id UUID NOT NULL REFERENCES zones(zone_id),
    sequence BIGINT NOT NULL,
    kind TEXT NOT NULL,
    tuple_id UUID,
    timestamp BIGINT NOT NULL,
    PRIMARY KEY (zone_id, sequence)
);
CREATE TABLE IF NOT EXISTS rebac_group_closure (
    zone_id UUID NOT NULL REFERENCES zones(zone_id),
    member_type TEXT NOT NULL,
    member_id TEXT NOT NULL,
    group_type TEXT NOT NULL,
    group_id TEXT NOT NULL,
    PRIMARY KEY (zone_id, member_type, member_id, group_type, group_id)
);
CREATE TABLE IF NOT EXISTS rebac_closure_builds (
    zone_id UUID PRIMARY KEY REFERENCES zones(zone_id),
    built_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS version_history (
    zone_id UUID NOT NULL REFERENCES zones(zone_id),
    file_path TEXT NOT NULL,
    version_number BIGINT NOT NULL,
    content_hash TEXT NOT NULL,
    size_bytes BIGINT NOT NULL,
    created_at BIGINT NOT NULL,
    created_by TEXT NOT NULL,
    PRIMARY KEY (zone_id, file_path, version_number)
);
CREATE TABLE IF NOT EXISTS path_registrations (
    zone_id UUID NOT NULL REFERENCES zones(zone_id),
    file_path TEXT NOT NULL,
    registration_type TEXT NOT NULL,
    owner TEXT NOT NULL,
    metadata JSONB NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (zone_id, file_path)
);
CREATE TABLE IF NOT EXISTS quarantine (
    zone_id UUID NOT NULL REFERENCES zones(zone_id),
    op_id UUID NOT NULL,
    reason TEXT NOT NULL,
    recorded_at BIGINT NOT NULL,
    PRIMARY KEY (zone_id, op_id)
);
";

/// PostgreSQL-backed relational driver.
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Connects and ensures the schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> KernelResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> KernelResult<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> KernelError {
    match &e {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() || db.is_foreign_key_violation() {
                KernelError::Constraint {
                    constraint: db.constraint().unwrap_or("unknown").to_string(),
                }
            } else {
                KernelError::unavailable(format!("postgres: {e}"))
            }
        }
        sqlx::Error::RowNotFound => KernelError::not_found("row"),
        _ => KernelError::unavailable(format!("postgres: {e}")),
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

fn op_type_str(op_type: OpType) -> String {
    op_type.to_string()
}

fn parse_op_type(s: &str) -> KernelResult<OpType> {
    Ok(match s {
        "write" => OpType::Write,
        "delete" => OpType::Delete,
        "rename" => OpType::Rename,
        "chmod" => OpType::Chmod,
        "chown" => OpType::Chown,
        "mkdir" => OpType::Mkdir,
        "tag_set" => OpType::TagSet,
        "tag_delete" => OpType::TagDelete,
        "undo" => OpType::Undo,
        other => {
            return Err(KernelError::internal(format!("unknown op_type: {other}")));
        }
    })
}

fn registration_type_str(t: RegistrationType) -> &'static str {
    match t {
        RegistrationType::Workspace => "workspace",
        RegistrationType::Memory => "memory",
    }
}

fn parse_registration_type(s: &str) -> KernelResult<RegistrationType> {
    match s {
        "workspace" => Ok(RegistrationType::Workspace),
        "memory" => Ok(RegistrationType::Memory),
        other => Err(KernelError::internal(format!(
            "unknown registration type: {other}"
        ))),
    }
}

fn change_kind_str(kind: RebacChangeKind) -> &'static str {
    match kind {
        RebacChangeKind::Grant => "grant",
        RebacChangeKind::Revoke => "revoke",
        RebacChangeKind::ClosureRebuild => "closure_rebuild",
    }
}

fn row_to_op(row: &sqlx::postgres::PgRow) -> KernelResult<OperationLogEntry> {
    Ok(OperationLogEntry {
        op_id: row.try_get("op_id").map_err(db_err)?,
        zone_id: row.try_get("zone_id").map_err(db_err)?,
        subject: Subject::parse(&row.try_get::<String, _>("subject").map_err(db_err)?)?,
        op_type: parse_op_type(&row.try_get::<String, _>("op_type").map_err(db_err)?)?,
        file_path: VirtualPath::parse(&row.try_get::<String, _>("file_path").map_err(db_err)?)?,
        timestamp: row.try_get("timestamp").map_err(db_err)?,
        details: row.try_get("details").map_err(db_err)?,
        undo_state: row.try_get("undo_state").map_err(db_err)?,
        undone: row.try_get("undone").map_err(db_err)?,
    })
}

fn row_to_tuple(row: &sqlx::postgres::PgRow) -> KernelResult<RebacTuple> {
    Ok(RebacTuple {
        tuple_id: row.try_get("tuple_id").map_err(db_err)?,
        zone_id: row.try_get("zone_id").map_err(db_err)?,
        subject: Subject::new(
            row.try_get::<String, _>("subject_type").map_err(db_err)?,
            row.try_get::<String, _>("subject_id").map_err(db_err)?,
        ),
        relation: row.try_get("relation").map_err(db_err)?,
        object: ObjectRef::new(
            row.try_get::<String, _>("object_type").map_err(db_err)?,
            row.try_get::<String, _>("object_id").map_err(db_err)?,
        ),
        created_at: row.try_get("created_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
    })
}

fn row_to_version(row: &sqlx::postgres::PgRow) -> KernelResult<VersionHistoryEntry> {
    Ok(VersionHistoryEntry {
        zone_id: row.try_get("zone_id").map_err(db_err)?,
        path: VirtualPath::parse(&row.try_get::<String, _>("file_path").map_err(db_err)?)?,
        version_number: u64::try_from(row.try_get::<i64, _>("version_number").map_err(db_err)?)
            .map_err(|_| KernelError::internal("negative version number"))?,
        content_hash: row.try_get("content_hash").map_err(db_err)?,
        size_bytes: u64::try_from(row.try_get::<i64, _>("size_bytes").map_err(db_err)?)
            .map_err(|_| KernelError::internal("negative size"))?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        created_by: Subject::parse(&row.try_get::<String, _>("created_by").map_err(db_err)?)?,
    })
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    // --- Zones ---

    async fn create_zone(&self, zone: &Zone) -> KernelResult<()> {
        sqlx::query("INSERT INTO zones (zone_id, name, created_at, deleted) VALUES ($1, $2, $3, $4)")
            .bind(zone.zone_id)
            .bind(&zone.name)
            .bind(zone.created_at)
            .bind(zone.deleted)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_zone(&self, zone_id: ZoneId) -> KernelResult<Option<Zone>> {
        require_zone(zone_id)?;
        let row = sqlx::query("SELECT zone_id, name, created_at, deleted FROM zones WHERE zone_id = $1")
            .bind(zone_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| {
            Ok(Zone {
                zone_id: r.try_get("zone_id").map_err(db_err)?,
                name: r.try_get("name").map_err(db_err)?,
                created_at: r.try_get("created_at").map_err(db_err)?,
                deleted: r.try_get("deleted").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn get_zone_by_name(&self, name: &str) -> KernelResult<Option<Zone>> {
        let row = sqlx::query("SELECT zone_id, name, created_at, deleted FROM zones WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| {
            Ok(Zone {
                zone_id: r.try_get("zone_id").map_err(db_err)?,
                name: r.try_get("name").map_err(db_err)?,
                created_at: r.try_get("created_at").map_err(db_err)?,
                deleted: r.try_get("deleted").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn soft_delete_zone(&self, zone_id: ZoneId) -> KernelResult<()> {
        require_zone(zone_id)?;
        let result = sqlx::query("UPDATE zones SET deleted = TRUE WHERE zone_id = $1")
            .bind(zone_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(KernelError::not_found(zone_id.to_string()));
        }
        Ok(())
    }

    // --- Operation log ---

    async fn commit_write_group(
        &self,
        zone_id: ZoneId,
        group: WriteGroup,
    ) -> KernelResult<Vec<u64>> {
        require_zone(zone_id)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for op in &group.ops {
            if op.zone_id != zone_id {
                return Err(KernelError::Constraint {
                    constraint: "operation_log.zone_id matches group zone".into(),
                });
            }
            sqlx::query(
                "INSERT INTO operation_log \
                 (op_id, zone_id, subject, op_type, file_path, timestamp, details, undo_state, undone) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(op.op_id)
            .bind(op.zone_id)
            .bind(op.subject.to_string())
            .bind(op_type_str(op.op_type))
            .bind(op.file_path.as_str())
            .bind(op.timestamp)
            .bind(&op.details)
            .bind(&op.undo_state)
            .bind(op.undone)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let mut assigned = Vec::with_capacity(group.versions.len());
        for version in &group.versions {
            let next: i64 = sqlx::query(
                "SELECT COALESCE(MAX(version_number), 0) + 1 AS next \
                 FROM version_history WHERE zone_id = $1 AND file_path = $2",
            )
            .bind(zone_id)
            .bind(version.path.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .try_get("next")
            .map_err(db_err)?;

            sqlx::query(
                "INSERT INTO version_history \
                 (zone_id, file_path, version_number, content_hash, size_bytes, created_at, created_by) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(zone_id)
            .bind(version.path.as_str())
            .bind(next)
            .bind(&version.content_hash)
            .bind(i64::try_from(version.size_bytes).unwrap_or(i64::MAX))
            .bind(version.created_at)
            .bind(version.created_by.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            assigned.push(u64::try_from(next).unwrap_or(0));
        }

        for (op_id, undone) in &group.mark_undone {
            let result = sqlx::query(
                "UPDATE operation_log SET undone = $3 WHERE zone_id = $1 AND op_id = $2",
            )
            .bind(zone_id)
            .bind(op_id)
            .bind(undone)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            if result.rows_affected() == 0 {
                return Err(KernelError::not_found(op_id.to_string()));
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(assigned)
    }

    async fn get_op(
        &self,
        zone_id: ZoneId,
        op_id: OpId,
    ) -> KernelResult<Option<OperationLogEntry>> {
        require_zone(zone_id)?;
        let row = sqlx::query("SELECT * FROM operation_log WHERE zone_id = $1 AND op_id = $2")
            .bind(zone_id)
            .bind(op_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| row_to_op(&r)).transpose()
    }

    async fn query_ops(
        &self,
        zone_id: ZoneId,
        filter: &OpLogFilter,
    ) -> KernelResult<Vec<OperationLogEntry>> {
        require_zone(zone_id)?;
        // Assembled from optional clauses; every branch binds zone_id first.
        let mut sql = String::from("SELECT * FROM operation_log WHERE zone_id = $1");
        let mut arg = 1;
        if filter.subject.is_some() {
            arg += 1;
            sql.push_str(&format!(" AND subject = ${arg}"));
        }
        if filter.op_type.is_some() {
            arg += 1;
            sql.push_str(&format!(" AND op_type = ${arg}"));
        }
        if filter.path.is_some() {
            arg += 1;
            if filter.path_prefix {
                sql.push_str(&format!(
                    " AND (file_path = ${arg} OR file_path LIKE ${arg} || '/%')"
                ));
            } else {
                sql.push_str(&format!(" AND file_path = ${arg}"));
            }
        }
        if filter.since_micros.is_some() {
            arg += 1;
            sql.push_str(&format!(" AND timestamp >= ${arg}"));
        }
        if filter.until_micros.is_some() {
            arg += 1;
            sql.push_str(&format!(" AND timestamp <= ${arg}"));
        }
        sql.push_str(" ORDER BY timestamp DESC");
        if filter.limit.is_some() {
            arg += 1;
            sql.push_str(&format!(" LIMIT ${arg}"));
        }

        let mut query = sqlx::query(&sql).bind(zone_id);
        if let Some(subject) = &filter.subject {
            query = query.bind(subject.to_string());
        }
        if let Some(op_type) = filter.op_type {
            query = query.bind(op_type_str(op_type));
        }
        if let Some(path) = &filter.path {
            query = query.bind(path.as_str().to_string());
        }
        if let Some(since) = filter.since_micros {
            query = query.bind(since);
        }
        if let Some(until) = filter.until_micros {
            query = query.bind(until);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_op).collect()
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let prior: Option<String> = sqlx::query(
            "SELECT tag_value FROM tags WHERE zone_id = $1 AND file_path = $2 AND tag_key = $3",
        )
        .bind(zone_id)
        .bind(path.as_str())
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .map(|r| r.try_get("tag_value").map_err(db_err))
        .transpose()?;

        sqlx::query(
            "INSERT INTO tags (zone_id, file_path, tag_key, tag_value) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (zone_id, file_path, tag_key) DO UPDATE SET tag_value = $4",
        )
        .bind(zone_id)
        .bind(path.as_str())
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(prior)
    }

    async fn delete_tag(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        key: &str,
    ) -> KernelResult<Option<String>> {
        require_zone(zone_id)?;
        let row = sqlx::query(
            "DELETE FROM tags WHERE zone_id = $1 AND file_path = $2 AND tag_key = $3 \
             RETURNING tag_value",
        )
        .bind(zone_id)
        .bind(path.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| r.try_get("tag_value").map_err(db_err)).transpose()
    }

    async fn list_tags(&self, zone_id: ZoneId, path: &VirtualPath) -> KernelResult<Vec<Tag>> {
        require_zone(zone_id)?;
        let rows = sqlx::query(
            "SELECT tag_key, tag_value FROM tags \
             WHERE zone_id = $1 AND file_path = $2 ORDER BY tag_key",
        )
        .bind(zone_id)
        .bind(path.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                Ok(Tag {
                    zone_id,
                    file_path: path.clone(),
                    key: r.try_get("tag_key").map_err(db_err)?,
                    value: r.try_get("tag_value").map_err(db_err)?,
                })
            })
            .collect()
    }

    // --- ReBAC tuples ---

    async fn insert_tuple(&self, tuple: &RebacTuple) -> KernelResult<TupleId> {
        require_zone(tuple.zone_id)?;
        let row = sqlx::query(
            "INSERT INTO rebac_tuples \
             (tuple_id, zone_id, subject_type, subject_id, relation, object_type, object_id, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (zone_id, subject_type, subject_id, relation, object_type, object_id) \
             DO UPDATE SET zone_id = rebac_tuples.zone_id \
             RETURNING tuple_id",
        )
        .bind(tuple.tuple_id)
        .bind(tuple.zone_id)
        .bind(&tuple.subject.kind)
        .bind(&tuple.subject.id)
        .bind(&tuple.relation)
        .bind(&tuple.object.kind)
        .bind(&tuple.object.id)
        .bind(tuple.created_at)
        .bind(tuple.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("tuple_id").map_err(db_err)
    }

    async fn delete_tuple(
        &self,
        zone_id: ZoneId,
        tuple_id: TupleId,
    ) -> KernelResult<Option<RebacTuple>> {
        require_zone(zone_id)?;
        let row = sqlx::query(
            "DELETE FROM rebac_tuples WHERE zone_id = $1 AND tuple_id = $2 RETURNING *",
        )
        .bind(zone_id)
        .bind(tuple_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_tuple(&r)).transpose()
    }

    async fn find_tuple(
        &self,
        zone_id: ZoneId,
        subject: &Subject,
        relation: &str,
        object: &ObjectRef,
    ) -> KernelResult<Option<RebacTuple>> {
        require_zone(zone_id)?;
        let row = sqlx::query(
            "SELECT * FROM rebac_tuples WHERE zone_id = $1 AND subject_type = $2 \
             AND subject_id = $3 AND relation = $4 AND object_type = $5 AND object_id = $6",
        )
        .bind(zone_id)
        .bind(&subject.kind)
        .bind(&subject.id)
        .bind(relation)
        .bind(&object.kind)
        .bind(&object.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_tuple(&r)).transpose()
    }

    async fn tuples_for_object(
        &self,
        zone_id: ZoneId,
        object: &ObjectRef,
        relation: Option<&str>,
    ) -> KernelResult<Vec<RebacTuple>> {
        require_zone(zone_id)?;
        let rows = match relation {
            Some(relation) => {
                sqlx::query(
                    "SELECT * FROM rebac_tuples WHERE zone_id = $1 AND object_type = $2 \
                     AND object_id = $3 AND relation = $4",
                )
                .bind(zone_id)
                .bind(&object.kind)
                .bind(&object.id)
                .bind(relation)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM rebac_tuples WHERE zone_id = $1 AND object_type = $2 \
                     AND object_id = $3",
                )
                .bind(zone_id)
                .bind(&object.kind)
                .bind(&object.id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(row_to_tuple).collect()
    }

    async fn tuples_for_subject(
        &self,
        zone_id: ZoneId,
        subject: &Subject,
    ) -> KernelResult<Vec<RebacTuple>> {
        require_zone(zone_id)?;
        let rows = sqlx::query(
            "SELECT * FROM rebac_tuples WHERE zone_id = $1 AND subject_type = $2 AND subject_id = $3",
        )
        .bind(zone_id)
        .bind(&subject.kind)
        .bind(&subject.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_tuple).collect()
    }

    async fn member_of_tuples(&self, zone_id: ZoneId) -> KernelResult<Vec<RebacTuple>> {
        require_zone(zone_id)?;
        let rows = sqlx::query(
            "SELECT * FROM rebac_tuples WHERE zone_id = $1 AND relation = 'member-of'",
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_tuple).collect()
    }

    async fn list_tuples(
        &self,
        zone_id: ZoneId,
        subject: Option<&Subject>,
        relation: Option<&str>,
        object: Option<&ObjectRef>,
    ) -> KernelResult<Vec<RebacTuple>> {
        require_zone(zone_id)?;
        let mut sql = String::from("SELECT * FROM rebac_tuples WHERE zone_id = $1");
        let mut arg = 1;
        if subject.is_some() {
            sql.push_str(&format!(
                " AND subject_type = ${} AND subject_id = ${}",
                arg + 1,
                arg + 2
            ));
            arg += 2;
        }
        if relation.is_some() {
            arg += 1;
            sql.push_str(&format!(" AND relation = ${arg}"));
        }
        if object.is_some() {
            sql.push_str(&format!(
                " AND object_type = ${} AND object_id = ${}",
                arg + 1,
                arg + 2
            ));
        }

        let mut query = sqlx::query(&sql).bind(zone_id);
        if let Some(subject) = subject {
            query = query.bind(&subject.kind).bind(&subject.id);
        }
        if let Some(relation) = relation {
            query = query.bind(relation);
        }
        if let Some(object) = object {
            query = query.bind(&object.kind).bind(&object.id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_tuple).collect()
    }

    // --- ReBAC changelog ---

    async fn append_rebac_change(
        &self,
        zone_id: ZoneId,
        kind: RebacChangeKind,
        tuple_id: Option<TupleId>,
    ) -> KernelResult<u64> {
        require_zone(zone_id)?;
        let row = sqlx::query(
            "INSERT INTO rebac_changelog (zone_id, sequence, kind, tuple_id, timestamp) \
             SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2, $3, $4 \
             FROM rebac_changelog WHERE zone_id = $1 \
             RETURNING sequence",
        )
        .bind(zone_id)
        .bind(change_kind_str(kind))
        .bind(tuple_id)
        .bind(nexus_core::now_micros())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let sequence: i64 = row.try_get("sequence").map_err(db_err)?;
        Ok(u64::try_from(sequence).unwrap_or(0))
    }

    async fn rebac_sequence(&self, zone_id: ZoneId) -> KernelResult<u64> {
        require_zone(zone_id)?;
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) AS seq FROM rebac_changelog WHERE zone_id = $1",
        )
        .bind(zone_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let sequence: i64 = row.try_get("seq").map_err(db_err)?;
        Ok(u64::try_from(sequence).unwrap_or(0))
    }

    // --- Group closure ---

    async fn replace_group_closure(
        &self,
        zone_id: ZoneId,
        rows: Vec<(Subject, ObjectRef)>,
    ) -> KernelResult<()> {
        require_zone(zone_id)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM rebac_group_closure WHERE zone_id = $1")
            .bind(zone_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for (member, group) in &rows {
            sqlx::query(
                "INSERT INTO rebac_group_closure \
                 (zone_id, member_type, member_id, group_type, group_id) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
            )
            .bind(zone_id)
            .bind(&member.kind)
            .bind(&member.id)
            .bind(&group.kind)
            .bind(&group.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        sqlx::query(
            "INSERT INTO rebac_closure_builds (zone_id, built_at) VALUES ($1, $2) \
             ON CONFLICT (zone_id) DO UPDATE SET built_at = $2",
        )
        .bind(zone_id)
        .bind(nexus_core::now_micros())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn closure_groups_for(
        &self,
        zone_id: ZoneId,
        member: &Subject,
    ) -> KernelResult<Option<Vec<ObjectRef>>> {
        require_zone(zone_id)?;
        let built = sqlx::query("SELECT 1 AS one FROM rebac_closure_builds WHERE zone_id = $1")
            .bind(zone_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if built.is_none() {
            return Ok(None);
        }
        let rows = sqlx::query(
            "SELECT group_type, group_id FROM rebac_group_closure \
             WHERE zone_id = $1 AND member_type = $2 AND member_id = $3",
        )
        .bind(zone_id)
        .bind(&member.kind)
        .bind(&member.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let groups = rows
            .iter()
            .map(|r| {
                Ok(ObjectRef::new(
                    r.try_get::<String, _>("group_type").map_err(db_err)?,
                    r.try_get::<String, _>("group_id").map_err(db_err)?,
                ))
            })
            .collect::<KernelResult<Vec<_>>>()?;
        Ok(Some(groups))
    }

    async fn closure_members_of(
        &self,
        zone_id: ZoneId,
        group: &ObjectRef,
    ) -> KernelResult<Vec<Subject>> {
        require_zone(zone_id)?;
        let rows = sqlx::query(
            "SELECT member_type, member_id FROM rebac_group_closure \
             WHERE zone_id = $1 AND group_type = $2 AND group_id = $3",
        )
        .bind(zone_id)
        .bind(&group.kind)
        .bind(&group.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                Ok(Subject::new(
                    r.try_get::<String, _>("member_type").map_err(db_err)?,
                    r.try_get::<String, _>("member_id").map_err(db_err)?,
                ))
            })
            .collect()
    }

    // --- Version history ---

    async fn list_versions(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
    ) -> KernelResult<Vec<VersionHistoryEntry>> {
        require_zone(zone_id)?;
        let rows = sqlx::query(
            "SELECT * FROM version_history WHERE zone_id = $1 AND file_path = $2 \
             ORDER BY version_number",
        )
        .bind(zone_id)
        .bind(path.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_version).collect()
    }

    async fn get_version(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        version_number: u64,
    ) -> KernelResult<Option<VersionHistoryEntry>> {
        require_zone(zone_id)?;
        let row = sqlx::query(
            "SELECT * FROM version_history \
             WHERE zone_id = $1 AND file_path = $2 AND version_number = $3",
        )
        .bind(zone_id)
        .bind(path.as_str())
        .bind(i64::try_from(version_number).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_version(&r)).transpose()
    }

    async fn version_at(
        &self,
        zone_id: ZoneId,
        path: &VirtualPath,
        at_micros: i64,
    ) -> KernelResult<Option<VersionHistoryEntry>> {
        require_zone(zone_id)?;
        let row = sqlx::query(
            "SELECT * FROM version_history \
             WHERE zone_id = $1 AND file_path = $2 AND created_at <= $3 \
             ORDER BY created_at DESC, version_number DESC LIMIT 1",
        )
        .bind(zone_id)
        .bind(path.as_str())
        .bind(at_micros)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_version(&r)).transpose()
    }

    async fn rename_path_rows(
        &self,
        zone_id: ZoneId,
        from: &VirtualPath,
        to: &VirtualPath,
    ) -> KernelResult<()> {
        require_zone(zone_id)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("UPDATE tags SET file_path = $3 WHERE zone_id = $1 AND file_path = $2")
            .bind(zone_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "UPDATE version_history SET file_path = $3 WHERE zone_id = $1 AND file_path = $2",
        )
        .bind(zone_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    // --- Path registrations ---

    async fn register_path(&self, registration: &PathRegistration) -> KernelResult<()> {
        require_zone(registration.zone_id)?;
        sqlx::query(
            "INSERT INTO path_registrations \
             (zone_id, file_path, registration_type, owner, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(registration.zone_id)
        .bind(registration.path.as_str())
        .bind(registration_type_str(registration.registration_type))
        .bind(registration.owner.to_string())
        .bind(&registration.metadata)
        .bind(registration.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_registrations(
        &self,
        zone_id: ZoneId,
        registration_type: Option<RegistrationType>,
    ) -> KernelResult<Vec<PathRegistration>> {
        require_zone(zone_id)?;
        let rows = match registration_type {
            Some(t) => {
                sqlx::query(
                    "SELECT * FROM path_registrations \
                     WHERE zone_id = $1 AND registration_type = $2 ORDER BY file_path",
                )
                .bind(zone_id)
                .bind(registration_type_str(t))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM path_registrations WHERE zone_id = $1 ORDER BY file_path",
                )
                .bind(zone_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                Ok(PathRegistration {
                    zone_id: r.try_get("zone_id").map_err(db_err)?,
                    path: VirtualPath::parse(
                        &r.try_get::<String, _>("file_path").map_err(db_err)?,
                    )?,
                    registration_type: parse_registration_type(
                        &r.try_get::<String, _>("registration_type").map_err(db_err)?,
                    )?,
                    owner: Subject::parse(&r.try_get::<String, _>("owner").map_err(db_err)?)?,
                    metadata: r.try_get("metadata").map_err(db_err)?,
                    created_at: r.try_get("created_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    // --- Quarantine ---

    async fn append_quarantine(&self, record: &QuarantineRecord) -> KernelResult<()> {
        require_zone(record.zone_id)?;
        sqlx::query(
            "INSERT INTO quarantine (zone_id, op_id, reason, recorded_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT DO NOTHING",
        )
        .bind(record.zone_id)
        .bind(record.op_id)
        .bind(&record.reason)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_quarantine(&self, zone_id: ZoneId) -> KernelResult<Vec<QuarantineRecord>> {
        require_zone(zone_id)?;
        let rows = sqlx::query(
            "SELECT * FROM quarantine WHERE zone_id = $1 ORDER BY recorded_at",
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                Ok(QuarantineRecord {
                    zone_id: r.try_get("zone_id").map_err(db_err)?,
                    op_id: r.try_get("op_id").map_err(db_err)?,
                    reason: r.try_get("reason").map_err(db_err)?,
                    recorded_at: r.try_get("recorded_at").map_err(db_err)?,
                })
            })
            .collect()
    }
}
