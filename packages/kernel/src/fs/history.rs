//! Versioning, time-travel, rollback, diff, and undo.
//!
//! Undo applies the inverse described by a log row's [`UndoState`] and, in
//! the same write group, appends an `undo` row whose undo state is the redo
//! data -- the state the inversion just replaced. Undoing an `undo` row
//! therefore re-applies the original operation and flips its `undone` flag
//! back.

use bytes::Bytes;

use nexus_core::{
    KernelError, KernelResult, OpId, OpType, OperationContext, VersionHistoryEntry, VirtualPath,
    ZoneId,
};

use crate::oplog::{log_entry, UndoDetails, UndoState};
use crate::pillar::recordstore::WriteGroup;
use crate::router::ResolvedPath;

use super::NexusFilesystem;

impl NexusFilesystem {
    /// Recorded versions of a path (superseded contents, oldest first).
    pub async fn list_versions(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
    ) -> KernelResult<Vec<VersionHistoryEntry>> {
        let resolved = self.resolve(ctx, path, false).await?;
        self.authorize_history_read(ctx, &resolved).await?;
        self.records
            .list_versions(resolved.zone_id, &resolved.path)
            .await
    }

    /// Read the bytes a path held at `at_micros`.
    pub async fn read_at(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        at_micros: i64,
    ) -> KernelResult<Bytes> {
        let resolved = self.resolve(ctx, path, false).await?;
        self.authorize_history_read(ctx, &resolved).await?;

        // The live metadata covers timestamps at or after its last write.
        if let Some((metadata, _)) = self.meta.get_file(resolved.zone_id, &resolved.path).await?
        {
            if metadata.modified_at <= at_micros {
                if let Some(hash) = metadata.content_hash.as_deref() {
                    return self
                        .with_deadline(ctx, self.cas.get_content(&metadata.backend_id, hash))
                        .await;
                }
                return Ok(Bytes::new());
            }
        }

        let Some(version) = self
            .records
            .version_at(resolved.zone_id, &resolved.path, at_micros)
            .await?
        else {
            return Err(KernelError::not_found(format!("{path}@{at_micros}")));
        };
        self.with_deadline(
            ctx,
            self.cas
                .get_content(&resolved.backend_id, &version.content_hash),
        )
        .await
    }

    /// Make a recorded version current again by writing its bytes through
    /// the normal write pipeline. Returns the new etag.
    pub async fn rollback(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        version_number: u64,
    ) -> KernelResult<String> {
        let resolved = self.resolve(ctx, path, true).await?;
        let Some(version) = self
            .records
            .get_version(resolved.zone_id, &resolved.path, version_number)
            .await?
        else {
            return Err(KernelError::not_found(format!("{path}@v{version_number}")));
        };
        let bytes = self
            .with_deadline(
                ctx,
                self.cas
                    .get_content(&resolved.backend_id, &version.content_hash),
            )
            .await?;
        self.write(ctx, path, bytes, &super::WriteOptions::default())
            .await
    }

    /// Line-oriented diff between two versions of a path.
    ///
    /// Version number 0 addresses the current content; recorded versions
    /// use their `version_number`.
    pub async fn diff(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        from_version: u64,
        to_version: u64,
    ) -> KernelResult<Bytes> {
        let old = self.version_bytes(ctx, path, from_version).await?;
        let new = self.version_bytes(ctx, path, to_version).await?;
        Ok(Bytes::from(line_diff(
            &format!("{path}@v{from_version}"),
            &format!("{path}@v{to_version}"),
            &old,
            &new,
        )))
    }

    async fn version_bytes(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        version_number: u64,
    ) -> KernelResult<Bytes> {
        if version_number == 0 {
            return self.read(ctx, path).await;
        }
        let resolved = self.resolve(ctx, path, false).await?;
        self.authorize_history_read(ctx, &resolved).await?;
        let Some(version) = self
            .records
            .get_version(resolved.zone_id, &resolved.path, version_number)
            .await?
        else {
            return Err(KernelError::not_found(format!("{path}@v{version_number}")));
        };
        self.with_deadline(
            ctx,
            self.cas
                .get_content(&resolved.backend_id, &version.content_hash),
        )
        .await
    }

    /// History reads work on paths whose live entry may be gone, so the
    /// owner fast-path only applies when an entry still exists.
    async fn authorize_history_read(
        &self,
        ctx: &OperationContext,
        resolved: &ResolvedPath,
    ) -> KernelResult<()> {
        if let Some((metadata, _)) = self.meta.get_file(resolved.zone_id, &resolved.path).await?
        {
            return self.authorize_entry(ctx, "read", resolved, &metadata).await;
        }
        let object = nexus_core::ObjectRef::new("file", resolved.path.as_str());
        let (allowed, _) = self
            .rebac
            .check(ctx, &ctx.subject, "read", &object, resolved.zone_id)
            .await?;
        if allowed {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied {
                subject: ctx.subject.to_string(),
                permission: "read".to_string(),
                object: resolved.path.as_str().to_string(),
            })
        }
    }

    /// Invert a logged operation.
    ///
    /// The subject must currently hold `write` on the target; the inversion
    /// and the log bookkeeping (new `undo` row, `undone` flips) commit as
    /// one write group.
    pub async fn undo(&self, ctx: &OperationContext, op_id: OpId) -> KernelResult<()> {
        let zone_id = ctx.require_zone()?;
        self.ensure_zone_live(zone_id).await?;

        let Some(op) = self.records.get_op(zone_id, op_id).await? else {
            return Err(KernelError::not_found(op_id.to_string()));
        };
        if op.undone {
            return Err(KernelError::AlreadyUndone {
                op_id: op_id.to_string(),
            });
        }

        let resolved = self.resolve(ctx, &op.file_path, true).await?;
        match self.meta.get_file(resolved.zone_id, &resolved.path).await? {
            Some((metadata, _)) => {
                self.authorize_entry(ctx, "write", &resolved, &metadata).await?;
            }
            None => self.authorize_parent_write(ctx, &resolved).await?,
        }

        let state = UndoState::from_entry(&op)?;
        let (redo, result_path) = self
            .apply_undo_state(ctx, zone_id, &resolved, state)
            .await?;

        let details = UndoDetails {
            original_op_id: op.op_id,
            original_op_type: op.op_type,
        };
        let mut group = WriteGroup::for_op(log_entry(
            zone_id,
            &ctx.subject,
            OpType::Undo,
            &result_path,
            serde_json::to_value(&details)
                .map_err(|e| KernelError::internal(format!("encode undo details: {e}")))?,
            Some(&redo),
        )?)
        .with_undone_flip(op.op_id, true);

        // Undoing an `undo` row re-activates the operation it had undone.
        if op.op_type == OpType::Undo {
            let original: UndoDetails = serde_json::from_value(op.details.clone())
                .map_err(|e| KernelError::internal(format!("corrupt undo details: {e}")))?;
            if let Some(root) = self
                .records
                .get_op(zone_id, original.original_op_id)
                .await?
            {
                group = group.with_undone_flip(root.op_id, !root.undone);
            }
        }

        if let Err(e) = self.records.commit_write_group(zone_id, group).await {
            // The inversion applied but its log row did not commit: put the
            // state back so log and metadata keep agreeing.
            let result_resolved = ResolvedPath {
                path: result_path.clone(),
                ..resolved
            };
            if let Err(revert_err) = self
                .apply_undo_state(ctx, zone_id, &result_resolved, redo)
                .await
            {
                tracing::error!(
                    op = %op.op_id,
                    error = %revert_err,
                    "failed to revert inversion after undo log failure"
                );
            }
            return Err(e);
        }
        self.invalidate_content(zone_id, &op.file_path).await;
        self.invalidate_content(zone_id, &result_path).await;
        self.publish_event(zone_id, OpType::Undo, &result_path, &ctx.subject)
            .await;
        metrics::counter!("nexus_fs_undos_total").increment(1);
        Ok(())
    }

    /// Apply an inversion, returning the redo state and the path the entry
    /// lives at afterwards.
    async fn apply_undo_state(
        &self,
        ctx: &OperationContext,
        zone_id: ZoneId,
        resolved: &ResolvedPath,
        state: UndoState,
    ) -> KernelResult<(UndoState, VirtualPath)> {
        ctx.check_deadline()?;
        let path = resolved.path.clone();

        match state {
            UndoState::Write { prior } => {
                let current = self
                    .meta
                    .get_file(zone_id, &path)
                    .await?
                    .map(|(metadata, _)| metadata);
                let current_hash = current.as_ref().and_then(|m| m.content_hash.clone());
                let restored_hash = prior.as_ref().and_then(|m| m.content_hash.clone());

                // Content references follow the transition; an identical
                // hash on both sides moves nothing.
                if restored_hash != current_hash {
                    if let Some(hash) = &restored_hash {
                        self.cas.increment(hash).await?;
                    }
                }
                match &prior {
                    Some(metadata) => {
                        self.meta.put_file(zone_id, metadata, None).await?;
                    }
                    None => {
                        self.meta.delete_file(zone_id, &path, None).await?;
                    }
                }
                if restored_hash != current_hash {
                    if let Some(hash) = &current_hash {
                        self.cas.release(hash).await?;
                    }
                }
                Ok((UndoState::Write { prior: current }, path))
            }
            UndoState::Delete { prior } => {
                if let Some(hash) = &prior.content_hash {
                    self.cas.increment(hash).await?;
                }
                if let Err(e) = self.meta.create_file(zone_id, &prior).await {
                    if let Some(hash) = &prior.content_hash {
                        let _ = self.cas.release(hash).await;
                    }
                    return Err(e);
                }
                Ok((UndoState::Unlink, path))
            }
            UndoState::Unlink => {
                let Some((current, revision)) = self.meta.get_file(zone_id, &path).await? else {
                    return Err(KernelError::not_found(path.as_str()));
                };
                self.meta
                    .delete_file(zone_id, &path, Some(revision))
                    .await?;
                if let Some(hash) = &current.content_hash {
                    self.cas.release(hash).await?;
                }
                Ok((UndoState::Delete { prior: current }, path))
            }
            UndoState::Rmdir => {
                let Some((current, revision)) = self.meta.get_file(zone_id, &path).await? else {
                    return Err(KernelError::not_found(path.as_str()));
                };
                let children = self.meta.list_dir(zone_id, &path, true, 1).await?;
                if !children.is_empty() {
                    return Err(KernelError::Constraint {
                        constraint: format!("directory not empty: {path}"),
                    });
                }
                self.meta
                    .delete_file(zone_id, &path, Some(revision))
                    .await?;
                Ok((UndoState::Delete { prior: current }, path))
            }
            UndoState::Rename { prior_path } => {
                self.relocate(zone_id, &path, &prior_path).await?;
                Ok((
                    UndoState::Rename {
                        prior_path: path,
                    },
                    prior_path,
                ))
            }
            UndoState::Chmod { prior_mode } => {
                let Some((mut metadata, revision)) =
                    self.meta.get_file(zone_id, &path).await?
                else {
                    return Err(KernelError::not_found(path.as_str()));
                };
                let redo = UndoState::Chmod {
                    prior_mode: metadata.mode,
                };
                metadata.mode = prior_mode;
                self.meta
                    .put_file(zone_id, &metadata, Some(revision))
                    .await?;
                Ok((redo, path))
            }
            UndoState::Chown {
                prior_owner,
                prior_group,
            } => {
                let Some((mut metadata, revision)) =
                    self.meta.get_file(zone_id, &path).await?
                else {
                    return Err(KernelError::not_found(path.as_str()));
                };
                let redo = UndoState::Chown {
                    prior_owner: metadata.owner.clone(),
                    prior_group: metadata.group.clone(),
                };
                metadata.owner = prior_owner;
                metadata.group = prior_group;
                self.meta
                    .put_file(zone_id, &metadata, Some(revision))
                    .await?;
                Ok((redo, path))
            }
            UndoState::Tag { key, value } => {
                let prior = match &value {
                    Some(value) => {
                        self.records
                            .set_tag(zone_id, &path, &key, value)
                            .await?
                    }
                    None => self.records.delete_tag(zone_id, &path, &key).await?,
                };
                Ok((UndoState::Tag { key, value: prior }, path))
            }
        }
    }
}

/// Plain line diff: unchanged lines prefixed with two spaces, removals with
/// `- `, additions with `+ `. Falls back to a summary for binary content.
fn line_diff(old_label: &str, new_label: &str, old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut out = format!("--- {old_label}\n+++ {new_label}\n").into_bytes();
    if old == new {
        return out;
    }
    if old.contains(&0) || new.contains(&0) {
        out.extend_from_slice(b"(binary contents differ)\n");
        return out;
    }

    let old_lines: Vec<&[u8]> = split_lines(old);
    let new_lines: Vec<&[u8]> = split_lines(new);

    // LCS table; bounded so pathological inputs stay cheap.
    const MAX_LINES: usize = 4096;
    if old_lines.len() > MAX_LINES || new_lines.len() > MAX_LINES {
        out.extend_from_slice(
            format!(
                "(files differ: {} -> {} lines)\n",
                old_lines.len(),
                new_lines.len()
            )
            .as_bytes(),
        );
        return out;
    }

    let rows = old_lines.len();
    let cols = new_lines.len();
    let mut lcs = vec![0_u32; (rows + 1) * (cols + 1)];
    let idx = |r: usize, c: usize| r * (cols + 1) + c;
    for r in (0..rows).rev() {
        for c in (0..cols).rev() {
            lcs[idx(r, c)] = if old_lines[r] == new_lines[c] {
                lcs[idx(r + 1, c + 1)] + 1
            } else {
                lcs[idx(r + 1, c)].max(lcs[idx(r, c + 1)])
            };
        }
    }

    let (mut r, mut c) = (0, 0);
    while r < rows && c < cols {
        if old_lines[r] == new_lines[c] {
            out.extend_from_slice(b"  ");
            out.extend_from_slice(old_lines[r]);
            out.push(b'\n');
            r += 1;
            c += 1;
        } else if lcs[idx(r + 1, c)] >= lcs[idx(r, c + 1)] {
            out.extend_from_slice(b"- ");
            out.extend_from_slice(old_lines[r]);
            out.push(b'\n');
            r += 1;
        } else {
            out.extend_from_slice(b"+ ");
            out.extend_from_slice(new_lines[c]);
            out.push(b'\n');
            c += 1;
        }
    }
    for line in &old_lines[r..] {
        out.extend_from_slice(b"- ");
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    for line in &new_lines[c..] {
        out.extend_from_slice(b"+ ");
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out
}

fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    if bytes.is_empty() {
        return Vec::new();
    }
    bytes
        .strip_suffix(b"\n")
        .unwrap_or(bytes)
        .split(|b| *b == b'\n')
        .collect()
}
