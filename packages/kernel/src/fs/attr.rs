//! Attribute operations: chmod/chown/chgrp and tags.

use nexus_core::{
    KernelError, KernelResult, OpType, OperationContext, Subject, Tag, VirtualPath,
};

use crate::oplog::{log_entry, UndoState};
use crate::pillar::recordstore::WriteGroup;

use super::NexusFilesystem;

impl NexusFilesystem {
    /// Change permission bits.
    pub async fn chmod(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        mode: u16,
    ) -> KernelResult<()> {
        if mode > 0o7777 {
            return Err(KernelError::invalid_argument(format!(
                "mode out of range: {mode:o}"
            )));
        }
        let resolved = self.resolve(ctx, path, true).await?;
        self.ensure_zone_live(resolved.zone_id).await?;
        let Some((mut metadata, revision)) =
            self.meta.get_file(resolved.zone_id, &resolved.path).await?
        else {
            return Err(KernelError::not_found(path.as_str()));
        };
        self.authorize_entry(ctx, "write", &resolved, &metadata).await?;

        let prior_mode = metadata.mode;
        metadata.mode = mode;
        self.meta
            .put_file(resolved.zone_id, &metadata, Some(revision))
            .await
            .map_err(stale_to_conflict)?;

        let group = WriteGroup::for_op(log_entry(
            resolved.zone_id,
            &ctx.subject,
            OpType::Chmod,
            &resolved.path,
            serde_json::json!({ "mode": mode }),
            Some(&UndoState::Chmod { prior_mode }),
        )?);
        self.records
            .commit_write_group(resolved.zone_id, group)
            .await?;
        self.publish_event(resolved.zone_id, OpType::Chmod, &resolved.path, &ctx.subject)
            .await;
        Ok(())
    }

    /// Change the owning subject.
    pub async fn chown(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        owner: Subject,
    ) -> KernelResult<()> {
        self.change_ownership(ctx, path, Some(owner), None).await
    }

    /// Change the group.
    pub async fn chgrp(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        group: Option<String>,
    ) -> KernelResult<()> {
        self.change_ownership(ctx, path, None, Some(group)).await
    }

    async fn change_ownership(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        owner: Option<Subject>,
        group: Option<Option<String>>,
    ) -> KernelResult<()> {
        let resolved = self.resolve(ctx, path, true).await?;
        self.ensure_zone_live(resolved.zone_id).await?;
        let Some((mut metadata, revision)) =
            self.meta.get_file(resolved.zone_id, &resolved.path).await?
        else {
            return Err(KernelError::not_found(path.as_str()));
        };
        self.authorize_entry(ctx, "write", &resolved, &metadata).await?;

        let prior_owner = metadata.owner.clone();
        let prior_group = metadata.group.clone();
        if let Some(owner) = owner {
            metadata.owner = owner;
        }
        if let Some(group) = group {
            metadata.group = group;
        }
        self.meta
            .put_file(resolved.zone_id, &metadata, Some(revision))
            .await
            .map_err(stale_to_conflict)?;

        let group = WriteGroup::for_op(log_entry(
            resolved.zone_id,
            &ctx.subject,
            OpType::Chown,
            &resolved.path,
            serde_json::json!({
                "owner": metadata.owner.to_string(),
                "group": metadata.group,
            }),
            Some(&UndoState::Chown {
                prior_owner,
                prior_group,
            }),
        )?);
        self.records
            .commit_write_group(resolved.zone_id, group)
            .await?;
        self.publish_event(resolved.zone_id, OpType::Chown, &resolved.path, &ctx.subject)
            .await;
        Ok(())
    }

    /// Set (or overwrite) a tag on a file.
    pub async fn set_tag(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        key: &str,
        value: &str,
    ) -> KernelResult<()> {
        if key.is_empty() {
            return Err(KernelError::invalid_argument("empty tag key"));
        }
        let resolved = self.resolve(ctx, path, true).await?;
        self.ensure_zone_live(resolved.zone_id).await?;
        let Some((metadata, _)) = self.meta.get_file(resolved.zone_id, &resolved.path).await?
        else {
            return Err(KernelError::not_found(path.as_str()));
        };
        self.authorize_entry(ctx, "write", &resolved, &metadata).await?;

        let prior = self
            .records
            .set_tag(resolved.zone_id, &resolved.path, key, value)
            .await?;
        let group = WriteGroup::for_op(log_entry(
            resolved.zone_id,
            &ctx.subject,
            OpType::TagSet,
            &resolved.path,
            serde_json::json!({ "key": key, "value": value }),
            Some(&UndoState::Tag {
                key: key.to_string(),
                value: prior,
            }),
        )?);
        self.records
            .commit_write_group(resolved.zone_id, group)
            .await?;
        self.publish_event(resolved.zone_id, OpType::TagSet, &resolved.path, &ctx.subject)
            .await;
        Ok(())
    }

    /// Delete a tag. `NotFound` when the tag does not exist.
    pub async fn delete_tag(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        key: &str,
    ) -> KernelResult<()> {
        let resolved = self.resolve(ctx, path, true).await?;
        self.ensure_zone_live(resolved.zone_id).await?;
        let Some((metadata, _)) = self.meta.get_file(resolved.zone_id, &resolved.path).await?
        else {
            return Err(KernelError::not_found(path.as_str()));
        };
        self.authorize_entry(ctx, "write", &resolved, &metadata).await?;

        let Some(prior) = self
            .records
            .delete_tag(resolved.zone_id, &resolved.path, key)
            .await?
        else {
            return Err(KernelError::not_found(format!("{path}#{key}")));
        };
        let group = WriteGroup::for_op(log_entry(
            resolved.zone_id,
            &ctx.subject,
            OpType::TagDelete,
            &resolved.path,
            serde_json::json!({ "key": key }),
            Some(&UndoState::Tag {
                key: key.to_string(),
                value: Some(prior),
            }),
        )?);
        self.records
            .commit_write_group(resolved.zone_id, group)
            .await?;
        self.publish_event(
            resolved.zone_id,
            OpType::TagDelete,
            &resolved.path,
            &ctx.subject,
        )
        .await;
        Ok(())
    }

    /// List a file's tags.
    pub async fn list_tags(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
    ) -> KernelResult<Vec<Tag>> {
        let resolved = self.resolve(ctx, path, false).await?;
        let Some((metadata, _)) = self.meta.get_file(resolved.zone_id, &resolved.path).await?
        else {
            return Err(KernelError::not_found(path.as_str()));
        };
        self.authorize_entry(ctx, "read", &resolved, &metadata).await?;
        self.records.list_tags(resolved.zone_id, &resolved.path).await
    }
}

fn stale_to_conflict(e: KernelError) -> KernelError {
    match e {
        KernelError::Stale { key } => KernelError::Conflict { key },
        other => other,
    }
}
