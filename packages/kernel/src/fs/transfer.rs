//! Copy and move.
//!
//! Within one backend both are metadata-only: copy bumps the CAS refcount
//! and writes a second metadata entry; move re-keys metadata and drags the
//! relational path rows (tags, version history) along. Only a cross-backend
//! copy touches bytes, streaming them through CAS on the destination side.

use uuid::Uuid;

use nexus_core::{
    now_micros, EntryType, FileMetadata, KernelError, KernelResult, OpType, OperationContext,
    VirtualPath, ZoneId,
};

use crate::oplog::{log_entry, UndoState};
use crate::pillar::recordstore::WriteGroup;

use super::NexusFilesystem;

impl NexusFilesystem {
    /// Copy `src` to `dst`. Directories copy recursively.
    pub async fn copy(
        &self,
        ctx: &OperationContext,
        src: &VirtualPath,
        dst: &VirtualPath,
    ) -> KernelResult<()> {
        let src_resolved = self.resolve(ctx, src, false).await?;
        let dst_resolved = self.resolve(ctx, dst, true).await?;
        if src_resolved.zone_id != dst_resolved.zone_id {
            return Err(KernelError::invalid_argument(
                "cross-zone copy goes through the federation router",
            ));
        }
        self.ensure_zone_live(dst_resolved.zone_id).await?;

        let Some((src_meta, _)) = self
            .meta
            .get_file(src_resolved.zone_id, &src_resolved.path)
            .await?
        else {
            return Err(KernelError::not_found(src.as_str()));
        };
        self.authorize_entry(ctx, "read", &src_resolved, &src_meta).await?;
        self.authorize_parent_write(ctx, &dst_resolved).await?;
        if self
            .meta
            .get_file(dst_resolved.zone_id, &dst_resolved.path)
            .await?
            .is_some()
        {
            return Err(KernelError::already_exists(dst.as_str()));
        }

        if src_meta.is_directory() {
            // Whole-subtree walk so files under implicit subdirectories
            // come along too.
            self.mkdir(ctx, dst, false).await?;
            let children = self
                .meta
                .list_dir(src_resolved.zone_id, &src_resolved.path, true, usize::MAX)
                .await?;
            for child in children {
                let Some(target) = child.path.rebase(&src_resolved.path, &dst_resolved.path)
                else {
                    continue;
                };
                match child.entry_type {
                    EntryType::Directory => self.mkdir(ctx, &target, true).await?,
                    EntryType::Regular => {
                        let child_src = crate::router::ResolvedPath {
                            path: child.path.clone(),
                            ..src_resolved.clone()
                        };
                        self.authorize_entry(ctx, "read", &child_src, &child).await?;
                        let child_dst = crate::router::ResolvedPath {
                            path: target,
                            ..dst_resolved.clone()
                        };
                        self.copy_file(ctx, &child, &src_resolved.backend_id, &child_dst)
                            .await?;
                    }
                    EntryType::Mount => {
                        return Err(KernelError::invalid_argument(
                            "cannot copy a mount entry",
                        ));
                    }
                }
            }
            return Ok(());
        }
        if src_meta.is_mount() {
            return Err(KernelError::invalid_argument("cannot copy a mount entry"));
        }

        self.copy_file(ctx, &src_meta, &src_resolved.backend_id, &dst_resolved)
            .await
    }

    async fn copy_file(
        &self,
        ctx: &OperationContext,
        src_meta: &FileMetadata,
        src_backend: &str,
        dst_resolved: &crate::router::ResolvedPath,
    ) -> KernelResult<()> {
        let content_hash = match &src_meta.content_hash {
            Some(hash) => {
                if src_backend == dst_resolved.backend_id {
                    self.cas.increment(hash).await?;
                } else {
                    // Cross-backend: re-ingest so the destination backend
                    // holds the blob.
                    let bytes = self
                        .with_deadline(ctx, self.cas.get_content(src_backend, hash))
                        .await?;
                    self.cas
                        .put_content(&dst_resolved.backend_id, &bytes)
                        .await?;
                }
                Some(hash.clone())
            }
            None => None,
        };

        let now = now_micros();
        let metadata = FileMetadata {
            path: dst_resolved.path.clone(),
            content_hash: content_hash.clone(),
            size_bytes: src_meta.size_bytes,
            backend_id: dst_resolved.backend_id.clone(),
            etag: Uuid::new_v4().to_string(),
            owner: ctx.subject.clone(),
            group: src_meta.group.clone(),
            mode: src_meta.mode,
            created_at: now,
            modified_at: now,
            entry_type: EntryType::Regular,
            target_zone_id: None,
        };

        if let Err(e) = self.meta.create_file(dst_resolved.zone_id, &metadata).await {
            if let Some(hash) = &content_hash {
                let _ = self.cas.release(hash).await;
            }
            return Err(e);
        }

        let group = WriteGroup::for_op(log_entry(
            dst_resolved.zone_id,
            &ctx.subject,
            OpType::Write,
            &dst_resolved.path,
            serde_json::json!({
                "copy_from": src_meta.path.as_str(),
                "content_hash": content_hash,
            }),
            Some(&UndoState::Write { prior: None }),
        )?);
        if let Err(e) = self
            .records
            .commit_write_group(dst_resolved.zone_id, group)
            .await
        {
            let _ = self
                .meta
                .delete_file(dst_resolved.zone_id, &dst_resolved.path, None)
                .await;
            if let Some(hash) = &content_hash {
                let _ = self.cas.release(hash).await;
            }
            return Err(e);
        }

        self.publish_event(
            dst_resolved.zone_id,
            OpType::Write,
            &dst_resolved.path,
            &ctx.subject,
        )
        .await;
        Ok(())
    }

    /// Move `src` to `dst` (metadata-only within a backend; directories
    /// move with their whole subtree).
    pub async fn r#move(
        &self,
        ctx: &OperationContext,
        src: &VirtualPath,
        dst: &VirtualPath,
    ) -> KernelResult<()> {
        let src_resolved = self.resolve(ctx, src, true).await?;
        let dst_resolved = self.resolve(ctx, dst, true).await?;
        if src_resolved.zone_id != dst_resolved.zone_id {
            return Err(KernelError::invalid_argument(
                "cross-zone move is not supported",
            ));
        }
        if src_resolved.backend_id != dst_resolved.backend_id {
            return Err(KernelError::invalid_argument(
                "cross-backend move: copy then delete instead",
            ));
        }
        if dst == src || dst.is_inside(src) {
            return Err(KernelError::invalid_argument(
                "cannot move a path into itself",
            ));
        }
        self.ensure_zone_live(src_resolved.zone_id).await?;

        let Some((src_meta, _)) = self
            .meta
            .get_file(src_resolved.zone_id, &src_resolved.path)
            .await?
        else {
            return Err(KernelError::not_found(src.as_str()));
        };
        self.authorize_entry(ctx, "write", &src_resolved, &src_meta).await?;
        self.authorize_parent_write(ctx, &dst_resolved).await?;
        if self
            .meta
            .get_file(dst_resolved.zone_id, &dst_resolved.path)
            .await?
            .is_some()
        {
            return Err(KernelError::already_exists(dst.as_str()));
        }

        self.relocate(src_resolved.zone_id, &src_resolved.path, &dst_resolved.path)
            .await?;

        let group = WriteGroup::for_op(log_entry(
            src_resolved.zone_id,
            &ctx.subject,
            OpType::Rename,
            &dst_resolved.path,
            serde_json::json!({ "from": src.as_str() }),
            Some(&UndoState::Rename {
                prior_path: src_resolved.path.clone(),
            }),
        )?);
        if let Err(e) = self
            .records
            .commit_write_group(src_resolved.zone_id, group)
            .await
        {
            // Move back; the log never saw the rename.
            if let Err(revert_err) = self
                .relocate(src_resolved.zone_id, &dst_resolved.path, &src_resolved.path)
                .await
            {
                tracing::error!(src = %src, dst = %dst, error = %revert_err, "failed to revert rename after log failure");
            }
            return Err(e);
        }

        self.invalidate_content(src_resolved.zone_id, &src_resolved.path).await;
        self.publish_event(
            src_resolved.zone_id,
            OpType::Rename,
            &dst_resolved.path,
            &ctx.subject,
        )
        .await;
        Ok(())
    }

    /// Re-key an entry (and its subtree for directories) from `from` to
    /// `to`, dragging tags and version rows along. No log row is written;
    /// callers own logging and its compensation.
    pub(crate) async fn relocate(
        &self,
        zone_id: ZoneId,
        from: &VirtualPath,
        to: &VirtualPath,
    ) -> KernelResult<()> {
        let Some((root_meta, _)) = self.meta.get_file(zone_id, from).await? else {
            return Err(KernelError::not_found(from.as_str()));
        };

        let mut moves: Vec<(FileMetadata, VirtualPath)> = vec![(root_meta.clone(), to.clone())];
        if root_meta.is_directory() {
            for child in self.meta.list_dir(zone_id, from, true, usize::MAX).await? {
                if let Some(target) = child.path.rebase(from, to) {
                    moves.push((child, target));
                }
            }
        }

        let batch: Vec<FileMetadata> = moves
            .iter()
            .map(|(meta, target)| FileMetadata {
                path: target.clone(),
                ..meta.clone()
            })
            .collect();
        self.meta.put_files(zone_id, &batch).await?;
        for (meta, target) in &moves {
            self.meta.delete_file(zone_id, &meta.path, None).await?;
            self.records
                .rename_path_rows(zone_id, &meta.path, target)
                .await?;
        }
        Ok(())
    }
}
