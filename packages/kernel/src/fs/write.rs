//! Write-side operations: write, batch write, mkdir, delete.
//!
//! The write pipeline follows a fixed sequence: resolve, authorize, gate
//! hooks, CAS put, metadata commit, then the record-store write group (log
//! row + version row) -- and compensates on every failure edge so a CAS
//! refcount bumped for a write that never commits is always released and
//! metadata never diverges from the log.

use bytes::Bytes;
use uuid::Uuid;

use nexus_core::{
    now_micros, EntryType, FileMetadata, KernelError, KernelResult, OpType, OperationContext,
    VersionHistoryEntry, VirtualPath,
};

use crate::oplog::{log_entry, UndoState};
use crate::pillar::recordstore::WriteGroup;
use crate::router::ResolvedPath;

use super::NexusFilesystem;

/// Options for [`NexusFilesystem::write`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Commit only if the current etag matches (optimistic concurrency).
    pub if_match: Option<String>,
    /// Commit only if the path does not exist yet.
    pub if_none_match: bool,
    /// Mode for newly created files (default `0o644`).
    pub mode: Option<u16>,
    pub group: Option<String>,
}

impl NexusFilesystem {
    /// Write `bytes` to `path`, returning the new etag.
    pub async fn write(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        bytes: Bytes,
        options: &WriteOptions,
    ) -> KernelResult<String> {
        let resolved = self.resolve(ctx, path, true).await?;
        self.ensure_zone_live(resolved.zone_id).await?;

        let current = self.meta.get_file(resolved.zone_id, &resolved.path).await?;
        match &current {
            Some((metadata, _)) => {
                if metadata.is_directory() || metadata.is_mount() {
                    return Err(KernelError::invalid_argument(format!(
                        "not a regular file: {path}"
                    )));
                }
                self.authorize_entry(ctx, "write", &resolved, metadata).await?;
            }
            None => self.authorize_parent_write(ctx, &resolved).await?,
        }

        self.hooks.before_write(ctx, &resolved.path, &bytes).await?;
        ctx.check_deadline()?;

        let content_hash = self
            .cas
            .put_content(&resolved.backend_id, &bytes)
            .await?;
        // From here on every failure edge must release the reference taken
        // above.
        let etag = match self
            .commit_write(ctx, &resolved, current, &bytes, &content_hash, options)
            .await
        {
            Ok(etag) => etag,
            Err(e) => {
                if let Err(release_err) = self.cas.release(&content_hash).await {
                    tracing::warn!(hash = %content_hash, error = %release_err, "failed to release CAS ref after aborted write");
                }
                return Err(e);
            }
        };

        self.invalidate_content(resolved.zone_id, &resolved.path).await;
        self.publish_event(resolved.zone_id, OpType::Write, &resolved.path, &ctx.subject)
            .await;
        self.hooks.after_write(ctx, &resolved.path, &etag).await;
        metrics::counter!("nexus_fs_writes_total").increment(1);
        Ok(etag)
    }

    /// The commit phase of the write pipeline (everything after the CAS
    /// put). Separated so the caller can compensate the CAS reference on
    /// any error.
    async fn commit_write(
        &self,
        ctx: &OperationContext,
        resolved: &ResolvedPath,
        current: Option<(FileMetadata, u64)>,
        bytes: &Bytes,
        content_hash: &str,
        options: &WriteOptions,
    ) -> KernelResult<String> {
        // Precondition checks against the state read before the CAS put.
        if let Some(expected) = &options.if_match {
            match &current {
                Some((metadata, _)) if metadata.etag == *expected => {}
                _ => {
                    return Err(KernelError::PreconditionFailed {
                        path: resolved.path.as_str().to_string(),
                    });
                }
            }
        }
        if options.if_none_match && current.is_some() {
            return Err(KernelError::PreconditionFailed {
                path: resolved.path.as_str().to_string(),
            });
        }
        ctx.check_deadline()?;

        let now = now_micros();
        let prior = current.as_ref().map(|(m, _)| m.clone());
        let expected_revision = current.as_ref().map(|(_, rev)| *rev);
        let same_content = prior
            .as_ref()
            .is_some_and(|m| m.content_hash.as_deref() == Some(content_hash));

        let metadata = FileMetadata {
            path: resolved.path.clone(),
            content_hash: Some(content_hash.to_string()),
            size_bytes: bytes.len() as u64,
            backend_id: resolved.backend_id.clone(),
            etag: Uuid::new_v4().to_string(),
            owner: prior
                .as_ref()
                .map_or_else(|| ctx.subject.clone(), |m| m.owner.clone()),
            group: prior
                .as_ref()
                .map_or_else(|| options.group.clone(), |m| m.group.clone()),
            mode: prior
                .as_ref()
                .map_or(options.mode.unwrap_or(0o644), |m| m.mode),
            created_at: prior.as_ref().map_or(now, |m| m.created_at),
            // Strictly monotonic per path so version_at() can order on it.
            modified_at: prior
                .as_ref()
                .map_or(now, |m| now.max(m.modified_at + 1)),
            entry_type: EntryType::Regular,
            target_zone_id: None,
        };

        // Commit metadata first, then the write group; a failed group rolls
        // the metadata back so log and state cannot diverge.
        match expected_revision {
            Some(revision) => {
                self.meta
                    .put_file(resolved.zone_id, &metadata, Some(revision))
                    .await
                    .map_err(|e| match e {
                        // A concurrent writer slipped between our read and
                        // this commit; the caller may retry.
                        KernelError::Stale { key } => KernelError::Conflict { key },
                        other => other,
                    })?;
            }
            None => self.meta.create_file(resolved.zone_id, &metadata).await.map_err(
                |e| match e {
                    KernelError::AlreadyExists { path } => KernelError::Conflict { key: path },
                    other => other,
                },
            )?,
        }

        let mut group = WriteGroup::for_op(log_entry(
            resolved.zone_id,
            &ctx.subject,
            OpType::Write,
            &resolved.path,
            serde_json::json!({
                "content_hash": content_hash,
                "size_bytes": bytes.len(),
                "backend_id": resolved.backend_id,
            }),
            Some(&UndoState::Write {
                prior: prior.clone(),
            }),
        )?);
        // The superseded content's metadata reference transfers to its
        // version row; identical-content rewrites supersede nothing.
        if let Some(prior_meta) = &prior {
            if let Some(prior_hash) = &prior_meta.content_hash {
                if !same_content {
                    group = group.with_version(VersionHistoryEntry {
                        zone_id: resolved.zone_id,
                        path: resolved.path.clone(),
                        version_number: 0,
                        content_hash: prior_hash.clone(),
                        size_bytes: prior_meta.size_bytes,
                        created_at: prior_meta.modified_at,
                        created_by: prior_meta.owner.clone(),
                    });
                }
            }
        }

        if let Err(e) = self
            .records
            .commit_write_group(resolved.zone_id, group)
            .await
        {
            // Roll the metadata back to keep log and state agreeing.
            let rollback = match &prior {
                Some(prior_meta) => {
                    self.meta
                        .put_file(resolved.zone_id, prior_meta, None)
                        .await
                        .map(|_| ())
                }
                None => {
                    self.meta
                        .delete_file(resolved.zone_id, &resolved.path, None)
                        .await
                }
            };
            if let Err(rollback_err) = rollback {
                tracing::error!(
                    path = %resolved.path,
                    error = %rollback_err,
                    "metadata rollback failed after log append failure"
                );
            }
            return Err(e);
        }

        if same_content {
            // Identical bytes rewritten: the CAS put bumped a reference the
            // metadata transition does not consume.
            self.cas.release(content_hash).await?;
        }
        Ok(metadata.etag)
    }

    /// Write several entries with one record-store commit.
    ///
    /// The pipeline matches [`write`](Self::write) per entry but the log
    /// rows and version rows of all entries commit as a single group, and
    /// the metadata entries as one multi-key batch.
    pub async fn write_batch(
        &self,
        ctx: &OperationContext,
        entries: Vec<(VirtualPath, Bytes)>,
        options: &WriteOptions,
    ) -> KernelResult<Vec<String>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut prepared = Vec::with_capacity(entries.len());
        let mut zone_id = None;
        for (path, bytes) in &entries {
            let resolved = self.resolve(ctx, path, true).await?;
            match zone_id {
                None => zone_id = Some(resolved.zone_id),
                Some(zone) if zone == resolved.zone_id => {}
                Some(_) => {
                    return Err(KernelError::invalid_argument(
                        "batch entries must share one zone",
                    ));
                }
            }
            let current = self.meta.get_file(resolved.zone_id, &resolved.path).await?;
            match &current {
                Some((metadata, _)) => {
                    self.authorize_entry(ctx, "write", &resolved, metadata).await?;
                }
                None => self.authorize_parent_write(ctx, &resolved).await?,
            }
            self.hooks.before_write(ctx, &resolved.path, bytes).await?;
            prepared.push((resolved, current, bytes.clone()));
        }
        let zone_id = zone_id.unwrap_or_default();
        self.ensure_zone_live(zone_id).await?;

        // CAS puts; on any later failure all bumped references are released.
        let mut hashes = Vec::with_capacity(prepared.len());
        for (resolved, _, bytes) in &prepared {
            match self.cas.put_content(&resolved.backend_id, bytes).await {
                Ok(hash) => hashes.push(hash),
                Err(e) => {
                    self.release_many(&hashes).await;
                    return Err(e);
                }
            }
        }

        match self
            .commit_batch(ctx, zone_id, &prepared, &hashes, options)
            .await
        {
            Ok(etags) => {
                for ((resolved, _, _), etag) in prepared.iter().zip(&etags) {
                    self.invalidate_content(zone_id, &resolved.path).await;
                    self.publish_event(zone_id, OpType::Write, &resolved.path, &ctx.subject)
                        .await;
                    self.hooks.after_write(ctx, &resolved.path, etag).await;
                }
                Ok(etags)
            }
            Err(e) => {
                self.release_many(&hashes).await;
                Err(e)
            }
        }
    }

    async fn release_many(&self, hashes: &[String]) {
        for hash in hashes {
            if let Err(e) = self.cas.release(hash).await {
                tracing::warn!(hash = %hash, error = %e, "failed to release CAS ref after aborted batch");
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn commit_batch(
        &self,
        ctx: &OperationContext,
        zone_id: nexus_core::ZoneId,
        prepared: &[(ResolvedPath, Option<(FileMetadata, u64)>, Bytes)],
        hashes: &[String],
        options: &WriteOptions,
    ) -> KernelResult<Vec<String>> {
        let now = now_micros();
        let mut metadata_batch = Vec::with_capacity(prepared.len());
        let mut group = WriteGroup::default();
        let mut etags = Vec::with_capacity(prepared.len());
        let mut released_for_same_content = Vec::new();

        for ((resolved, current, bytes), content_hash) in prepared.iter().zip(hashes) {
            if let Some(expected) = &options.if_match {
                match current {
                    Some((metadata, _)) if metadata.etag == *expected => {}
                    _ => {
                        return Err(KernelError::PreconditionFailed {
                            path: resolved.path.as_str().to_string(),
                        });
                    }
                }
            }
            if options.if_none_match && current.is_some() {
                return Err(KernelError::PreconditionFailed {
                    path: resolved.path.as_str().to_string(),
                });
            }

            let prior = current.as_ref().map(|(m, _)| m.clone());
            let same_content = prior
                .as_ref()
                .is_some_and(|m| m.content_hash.as_deref() == Some(content_hash.as_str()));
            let metadata = FileMetadata {
                path: resolved.path.clone(),
                content_hash: Some(content_hash.clone()),
                size_bytes: bytes.len() as u64,
                backend_id: resolved.backend_id.clone(),
                etag: Uuid::new_v4().to_string(),
                owner: prior
                    .as_ref()
                    .map_or_else(|| ctx.subject.clone(), |m| m.owner.clone()),
                group: prior
                    .as_ref()
                    .map_or_else(|| options.group.clone(), |m| m.group.clone()),
                mode: prior
                    .as_ref()
                    .map_or(options.mode.unwrap_or(0o644), |m| m.mode),
                created_at: prior.as_ref().map_or(now, |m| m.created_at),
                modified_at: prior.as_ref().map_or(now, |m| now.max(m.modified_at + 1)),
                entry_type: EntryType::Regular,
                target_zone_id: None,
            };

            group.ops.push(log_entry(
                zone_id,
                &ctx.subject,
                OpType::Write,
                &resolved.path,
                serde_json::json!({
                    "content_hash": content_hash,
                    "size_bytes": bytes.len(),
                    "backend_id": resolved.backend_id,
                    "batch": true,
                }),
                Some(&UndoState::Write {
                    prior: prior.clone(),
                }),
            )?);
            if let Some(prior_meta) = &prior {
                if let Some(prior_hash) = &prior_meta.content_hash {
                    if same_content {
                        released_for_same_content.push(content_hash.clone());
                    } else {
                        group.versions.push(VersionHistoryEntry {
                            zone_id,
                            path: resolved.path.clone(),
                            version_number: 0,
                            content_hash: prior_hash.clone(),
                            size_bytes: prior_meta.size_bytes,
                            created_at: prior_meta.modified_at,
                            created_by: prior_meta.owner.clone(),
                        });
                    }
                }
            }

            etags.push(metadata.etag.clone());
            metadata_batch.push(metadata);
        }

        ctx.check_deadline()?;
        self.meta.put_files(zone_id, &metadata_batch).await?;

        if let Err(e) = self.records.commit_write_group(zone_id, group).await {
            // Restore every prior metadata entry.
            for (resolved, current, _) in prepared {
                let rollback = match current {
                    Some((prior_meta, _)) => self
                        .meta
                        .put_file(zone_id, prior_meta, None)
                        .await
                        .map(|_| ()),
                    None => self.meta.delete_file(zone_id, &resolved.path, None).await,
                };
                if let Err(rollback_err) = rollback {
                    tracing::error!(path = %resolved.path, error = %rollback_err, "batch metadata rollback failed");
                }
            }
            return Err(e);
        }

        for hash in released_for_same_content {
            self.cas.release(&hash).await?;
        }
        Ok(etags)
    }

    /// Create a directory entry.
    pub async fn mkdir(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        create_parents: bool,
    ) -> KernelResult<()> {
        let resolved = self.resolve(ctx, path, true).await?;
        self.ensure_zone_live(resolved.zone_id).await?;

        if create_parents {
            if let Some(parent) = resolved.path.parent() {
                if parent.depth() > 1
                    && self.meta.get_file(resolved.zone_id, &parent).await?.is_none()
                {
                    Box::pin(self.mkdir(ctx, &parent, true)).await?;
                }
            }
        }
        self.authorize_parent_write(ctx, &resolved).await?;

        let now = now_micros();
        let metadata = FileMetadata {
            path: resolved.path.clone(),
            content_hash: None,
            size_bytes: 0,
            backend_id: resolved.backend_id.clone(),
            etag: Uuid::new_v4().to_string(),
            owner: ctx.subject.clone(),
            group: None,
            mode: 0o755,
            created_at: now,
            modified_at: now,
            entry_type: EntryType::Directory,
            target_zone_id: None,
        };
        self.meta.create_file(resolved.zone_id, &metadata).await?;

        let group = WriteGroup::for_op(log_entry(
            resolved.zone_id,
            &ctx.subject,
            OpType::Mkdir,
            &resolved.path,
            serde_json::Value::Null,
            Some(&UndoState::Rmdir),
        )?);
        if let Err(e) = self.records.commit_write_group(resolved.zone_id, group).await {
            let _ = self
                .meta
                .delete_file(resolved.zone_id, &resolved.path, None)
                .await;
            return Err(e);
        }

        self.publish_event(resolved.zone_id, OpType::Mkdir, &resolved.path, &ctx.subject)
            .await;
        Ok(())
    }

    /// Create a mount entry redirecting `path`'s descendants into another
    /// zone. The subject must already hold `read` on the target zone.
    pub async fn mount(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        target_zone: nexus_core::ZoneId,
    ) -> KernelResult<()> {
        let resolved = self.resolve(ctx, path, true).await?;
        self.ensure_zone_live(resolved.zone_id).await?;
        self.ensure_zone_live(target_zone).await?;
        self.authorize_parent_write(ctx, &resolved).await?;

        let (allowed, _) = self
            .rebac
            .check(
                ctx,
                &ctx.subject,
                "read",
                &nexus_core::ObjectRef::zone(target_zone),
                target_zone,
            )
            .await?;
        if !allowed {
            return Err(KernelError::PermissionDenied {
                subject: ctx.subject.to_string(),
                permission: "read".to_string(),
                object: format!("zone:{target_zone}"),
            });
        }

        let now = now_micros();
        let metadata = FileMetadata {
            path: resolved.path.clone(),
            content_hash: None,
            size_bytes: 0,
            backend_id: resolved.backend_id.clone(),
            etag: Uuid::new_v4().to_string(),
            owner: ctx.subject.clone(),
            group: None,
            mode: 0o755,
            created_at: now,
            modified_at: now,
            entry_type: EntryType::Mount,
            target_zone_id: Some(target_zone),
        };
        self.meta.create_file(resolved.zone_id, &metadata).await?;

        let group = WriteGroup::for_op(log_entry(
            resolved.zone_id,
            &ctx.subject,
            OpType::Mkdir,
            &resolved.path,
            serde_json::json!({ "mount_target": target_zone }),
            Some(&UndoState::Rmdir),
        )?);
        if let Err(e) = self.records.commit_write_group(resolved.zone_id, group).await {
            let _ = self
                .meta
                .delete_file(resolved.zone_id, &resolved.path, None)
                .await;
            return Err(e);
        }
        self.publish_event(resolved.zone_id, OpType::Mkdir, &resolved.path, &ctx.subject)
            .await;
        Ok(())
    }

    /// Delete a file or empty directory.
    ///
    /// The content reference moves from the metadata entry to a version
    /// row appended with the delete, so time-travel reads still see the
    /// final content and `undo` can restore the entry without re-ingesting
    /// bytes.
    pub async fn delete(&self, ctx: &OperationContext, path: &VirtualPath) -> KernelResult<()> {
        let resolved = self.resolve(ctx, path, true).await?;
        self.ensure_zone_live(resolved.zone_id).await?;

        // A missing path fails before any log entry is produced.
        let Some((metadata, revision)) =
            self.meta.get_file(resolved.zone_id, &resolved.path).await?
        else {
            return Err(KernelError::not_found(path.as_str()));
        };
        self.authorize_entry(ctx, "write", &resolved, &metadata).await?;

        if metadata.is_directory() {
            // Recursive scan: a file under an implicit subdirectory still
            // makes this directory non-empty.
            let children = self
                .meta
                .list_dir(resolved.zone_id, &resolved.path, true, 1)
                .await?;
            if !children.is_empty() {
                return Err(KernelError::Constraint {
                    constraint: format!("directory not empty: {path}"),
                });
            }
        }

        self.hooks.before_delete(ctx, &resolved.path).await?;
        ctx.check_deadline()?;

        self.meta
            .delete_file(resolved.zone_id, &resolved.path, Some(revision))
            .await
            .map_err(|e| match e {
                KernelError::Stale { key } => KernelError::Conflict { key },
                other => other,
            })?;

        let mut group = WriteGroup::for_op(log_entry(
            resolved.zone_id,
            &ctx.subject,
            OpType::Delete,
            &resolved.path,
            serde_json::json!({ "entry_type": metadata.entry_type }),
            Some(&UndoState::Delete {
                prior: metadata.clone(),
            }),
        )?);
        if let Some(hash) = &metadata.content_hash {
            group = group.with_version(VersionHistoryEntry {
                zone_id: resolved.zone_id,
                path: resolved.path.clone(),
                version_number: 0,
                content_hash: hash.clone(),
                size_bytes: metadata.size_bytes,
                created_at: metadata.modified_at,
                created_by: metadata.owner.clone(),
            });
        }
        if let Err(e) = self.records.commit_write_group(resolved.zone_id, group).await {
            if let Err(restore_err) = self.meta.put_file(resolved.zone_id, &metadata, None).await {
                tracing::error!(path = %resolved.path, error = %restore_err, "metadata restore failed after delete log failure");
            }
            return Err(e);
        }

        self.invalidate_content(resolved.zone_id, &resolved.path).await;
        self.publish_event(resolved.zone_id, OpType::Delete, &resolved.path, &ctx.subject)
            .await;
        self.hooks.after_delete(ctx, &resolved.path).await;
        metrics::counter!("nexus_fs_deletes_total").increment(1);
        Ok(())
    }
}
