//! Relationship-based authorization engine.
//!
//! Evaluates permission checks against the tuple graph under hard
//! graph-safety limits, caches results in the CacheStore keyed by a
//! per-zone version token, and owns tuple writes (grant/revoke) including
//! changelog appends, closure rebuilds, and cache invalidation.
//!
//! The cache is an optimization, never a correctness dependency: a check
//! against a frozen RecordStore snapshot is deterministic regardless of
//! cache state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::time::Instant;
use uuid::Uuid;

use nexus_core::{
    now_micros, Consistency, KernelError, KernelResult, ObjectRef, OperationContext, RebacTuple,
    Subject, TupleId, ZoneId,
};

use crate::config::RebacConfig;
use crate::pillar::cachestore::CacheStore;
use crate::pillar::recordstore::{RebacChangeKind, RecordStore};
use crate::rebac::closure;
use crate::rebac::namespace::{builtin_namespaces, NamespaceConfig, Userset};

/// Per-check budget tracking. Exceeding any limit fails closed.
struct EvalBudget {
    nodes: usize,
    queries: usize,
    deadline: Instant,
}

impl EvalBudget {
    fn new(config: &RebacConfig) -> Self {
        Self {
            nodes: 0,
            queries: 0,
            deadline: Instant::now() + config.check_timeout,
        }
    }

    fn visit_node(&mut self, config: &RebacConfig) -> KernelResult<()> {
        self.nodes += 1;
        if self.nodes > config.max_nodes {
            return Err(exhausted("max_nodes"));
        }
        if Instant::now() >= self.deadline {
            return Err(exhausted("check_timeout"));
        }
        Ok(())
    }

    fn count_query(&mut self, config: &RebacConfig) -> KernelResult<()> {
        self.queries += 1;
        if self.queries > config.max_queries {
            return Err(exhausted("max_queries"));
        }
        Ok(())
    }
}

fn exhausted(limit: &str) -> KernelError {
    KernelError::ResourceExhausted {
        limit: limit.to_string(),
    }
}

/// The authorization engine.
pub struct RebacEngine {
    records: Arc<dyn RecordStore>,
    cache: Arc<dyn CacheStore>,
    configs: ArcSwap<HashMap<String, NamespaceConfig>>,
    config: RebacConfig,
    /// Per-zone version tokens, seeded lazily from the changelog.
    versions: DashMap<ZoneId, u64>,
}

impl RebacEngine {
    #[must_use]
    pub fn new(
        records: Arc<dyn RecordStore>,
        cache: Arc<dyn CacheStore>,
        config: RebacConfig,
    ) -> Self {
        let configs = builtin_namespaces()
            .into_iter()
            .map(|c| (c.object_type.clone(), c))
            .collect::<HashMap<_, _>>();
        Self {
            records,
            cache,
            configs: ArcSwap::from_pointee(configs),
            config,
            versions: DashMap::new(),
        }
    }

    /// Replace the namespace configuration set (hot swap).
    pub fn load_namespaces(&self, namespaces: Vec<NamespaceConfig>) {
        let configs = namespaces
            .into_iter()
            .map(|c| (c.object_type.clone(), c))
            .collect::<HashMap<_, _>>();
        self.configs.store(Arc::new(configs));
    }

    /// Current version token for a zone.
    pub async fn version(&self, zone_id: ZoneId) -> KernelResult<u64> {
        if let Some(version) = self.versions.get(&zone_id) {
            return Ok(*version);
        }
        let version = self.records.rebac_sequence(zone_id).await?;
        self.versions.insert(zone_id, version);
        Ok(version)
    }

    fn cache_key(
        zone_id: ZoneId,
        version: u64,
        subject: &Subject,
        permission: &str,
        object: &ObjectRef,
    ) -> String {
        format!("rebac/{zone_id}/{version}/{subject}/{permission}/{object}")
    }

    /// Evaluate whether `subject` holds `permission` on `object` in
    /// `zone_id`. Returns the result and the version token it is valid for.
    pub async fn check(
        &self,
        ctx: &OperationContext,
        subject: &Subject,
        permission: &str,
        object: &ObjectRef,
        zone_id: ZoneId,
    ) -> KernelResult<(bool, u64)> {
        if zone_id == Uuid::nil() {
            return Err(KernelError::invalid_argument(
                "permission check without zone_id",
            ));
        }
        if self.config.admin_bypass && ctx.is_admin {
            return Ok((true, self.version(zone_id).await?));
        }

        let version = self.version(zone_id).await?;
        let key = Self::cache_key(zone_id, version, subject, permission, object);

        let use_cache = match ctx.consistency {
            Consistency::Eventual => true,
            // The version token is monotonic, so any entry under the
            // current version satisfies a bound at or below it.
            Consistency::Bounded(token) => token <= version,
            Consistency::Strong => false,
        };
        if use_cache {
            if let Some(cached) = self.cache.get(&key).await? {
                metrics::counter!("nexus_rebac_cache_hits_total").increment(1);
                return Ok((cached.as_ref() == b"1", version));
            }
        }
        metrics::counter!("nexus_rebac_cache_misses_total").increment(1);

        let mut budget = EvalBudget::new(&self.config);
        let allowed = self
            .check_object(&mut budget, zone_id, subject, permission, object, 0)
            .await?;

        let value = if allowed { b"1" } else { b"0" };
        let _ = self
            .cache
            .set(&key, Bytes::from_static(value), Some(self.config.cache_ttl))
            .await;
        Ok((allowed, version))
    }

    /// Evaluate `permission` on one object (recursion entry point).
    fn check_object<'a>(
        &'a self,
        budget: &'a mut EvalBudget,
        zone_id: ZoneId,
        subject: &'a Subject,
        permission: &'a str,
        object: &'a ObjectRef,
        depth: usize,
    ) -> BoxFuture<'a, KernelResult<bool>> {
        Box::pin(async move {
            if depth > self.config.max_depth {
                return Err(exhausted("max_depth"));
            }
            budget.visit_node(&self.config)?;

            let rule = self.rule_for(&object.kind, permission);
            self.eval(budget, zone_id, subject, permission, object, &rule, depth)
                .await
        })
    }

    /// Resolve the rewrite rule for a permission on an object type.
    fn rule_for(&self, object_type: &str, permission: &str) -> Userset {
        self.configs
            .load()
            .get(object_type)
            .map_or_else(|| Userset::relation(permission), |c| c.rule_for(permission))
    }

    #[allow(clippy::too_many_arguments)]
    fn eval<'a>(
        &'a self,
        budget: &'a mut EvalBudget,
        zone_id: ZoneId,
        subject: &'a Subject,
        permission: &'a str,
        object: &'a ObjectRef,
        rule: &'a Userset,
        depth: usize,
    ) -> BoxFuture<'a, KernelResult<bool>> {
        Box::pin(async move {
            budget.visit_node(&self.config)?;
            match rule {
                Userset::Relation { relation } => {
                    self.direct_grant(budget, zone_id, subject, relation, object)
                        .await
                }
                Userset::Union { children } => {
                    for child in children {
                        if self
                            .eval(budget, zone_id, subject, permission, object, child, depth)
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Userset::Intersection { children } => {
                    if children.is_empty() {
                        // Vacuous truth would grant by misconfiguration.
                        return Ok(false);
                    }
                    for child in children {
                        if !self
                            .eval(budget, zone_id, subject, permission, object, child, depth)
                            .await?
                        {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Userset::Exclusion { base, subtract } => {
                    let base_ok = self
                        .eval(budget, zone_id, subject, permission, object, base, depth)
                        .await?;
                    if !base_ok {
                        return Ok(false);
                    }
                    let excluded = self
                        .eval(budget, zone_id, subject, permission, object, subtract, depth)
                        .await?;
                    Ok(!excluded)
                }
                Userset::TupleToUserset { tupleset, computed } => {
                    budget.count_query(&self.config)?;
                    let referenced = self
                        .records
                        .tuples_for_object(zone_id, object, Some(tupleset))
                        .await?;
                    if referenced.len() > self.config.max_fanout {
                        return Err(exhausted("max_fanout"));
                    }
                    let now = now_micros();
                    for tuple in referenced {
                        if tuple.is_expired(now) {
                            continue;
                        }
                        let target = tuple.subject.as_object();
                        if self
                            .check_object(budget, zone_id, subject, computed, &target, depth + 1)
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            }
        })
    }

    /// Direct grant: a tuple from the subject itself or from any group the
    /// subject transitively belongs to.
    async fn direct_grant(
        &self,
        budget: &mut EvalBudget,
        zone_id: ZoneId,
        subject: &Subject,
        relation: &str,
        object: &ObjectRef,
    ) -> KernelResult<bool> {
        let now = now_micros();

        budget.count_query(&self.config)?;
        if let Some(tuple) = self
            .records
            .find_tuple(zone_id, subject, relation, object)
            .await?
        {
            if !tuple.is_expired(now) {
                return Ok(true);
            }
        }

        budget.count_query(&self.config)?;
        let groups = closure::groups_for(&self.records, zone_id, subject).await?;
        if groups.len() > self.config.max_fanout {
            return Err(exhausted("max_fanout"));
        }
        for group in groups {
            budget.visit_node(&self.config)?;
            budget.count_query(&self.config)?;
            if let Some(tuple) = self
                .records
                .find_tuple(zone_id, &group.as_subject(), relation, object)
                .await?
            {
                if !tuple.is_expired(now) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Grant a relationship. Idempotent for identical edges.
    pub async fn grant(&self, tuple: &RebacTuple) -> KernelResult<TupleId> {
        if tuple.zone_id == Uuid::nil() {
            return Err(KernelError::invalid_argument("tuple without zone_id"));
        }
        if tuple.relation.is_empty() {
            return Err(KernelError::invalid_argument("tuple with empty relation"));
        }

        let tuple_id = self.records.insert_tuple(tuple).await?;
        let version = self
            .records
            .append_rebac_change(tuple.zone_id, RebacChangeKind::Grant, Some(tuple_id))
            .await?;
        self.after_tuple_change(tuple.zone_id, &tuple.relation, version)
            .await?;
        Ok(tuple_id)
    }

    /// Revoke a relationship by tuple id.
    pub async fn revoke(&self, zone_id: ZoneId, tuple_id: TupleId) -> KernelResult<()> {
        let removed = self
            .records
            .delete_tuple(zone_id, tuple_id)
            .await?
            .ok_or_else(|| KernelError::not_found(tuple_id.to_string()))?;
        let version = self
            .records
            .append_rebac_change(zone_id, RebacChangeKind::Revoke, Some(tuple_id))
            .await?;
        self.after_tuple_change(zone_id, &removed.relation, version)
            .await?;
        Ok(())
    }

    async fn after_tuple_change(
        &self,
        zone_id: ZoneId,
        relation: &str,
        version: u64,
    ) -> KernelResult<()> {
        let mut version = version;
        if relation == "member-of" {
            closure::rebuild(&self.records, zone_id).await?;
            version = self
                .records
                .append_rebac_change(zone_id, RebacChangeKind::ClosureRebuild, None)
                .await?;
        }
        self.versions.insert(zone_id, version);
        // Version-keyed entries go stale on their own; the prefix delete
        // just reclaims them eagerly. Best-effort.
        if let Err(e) = self.cache.delete_by_prefix(&format!("rebac/{zone_id}/")).await {
            tracing::warn!(zone = %zone_id, error = %e, "permission cache invalidation failed");
        }
        Ok(())
    }

    /// All subjects holding `permission` on `object`.
    pub async fn expand(
        &self,
        zone_id: ZoneId,
        permission: &str,
        object: &ObjectRef,
    ) -> KernelResult<Vec<Subject>> {
        let mut budget = EvalBudget::new(&self.config);
        let rule = self.rule_for(&object.kind, permission);
        let mut subjects = self
            .expand_userset(&mut budget, zone_id, object, &rule, 0)
            .await?
            .into_iter()
            .collect::<Vec<_>>();
        subjects.sort_by_key(ToString::to_string);
        Ok(subjects)
    }

    fn expand_userset<'a>(
        &'a self,
        budget: &'a mut EvalBudget,
        zone_id: ZoneId,
        object: &'a ObjectRef,
        rule: &'a Userset,
        depth: usize,
    ) -> BoxFuture<'a, KernelResult<HashSet<Subject>>> {
        Box::pin(async move {
            if depth > self.config.max_depth {
                return Err(exhausted("max_depth"));
            }
            budget.visit_node(&self.config)?;
            let now = now_micros();

            match rule {
                Userset::Relation { relation } => {
                    budget.count_query(&self.config)?;
                    let tuples = self
                        .records
                        .tuples_for_object(zone_id, object, Some(relation))
                        .await?;
                    let mut out = HashSet::new();
                    for tuple in tuples {
                        if tuple.is_expired(now) {
                            continue;
                        }
                        if tuple.subject.is_group() {
                            budget.count_query(&self.config)?;
                            let members = self
                                .records
                                .closure_members_of(zone_id, &tuple.subject.as_object())
                                .await?;
                            out.extend(members);
                        }
                        out.insert(tuple.subject);
                    }
                    Ok(out)
                }
                Userset::Union { children } => {
                    let mut out = HashSet::new();
                    for child in children {
                        out.extend(
                            self.expand_userset(budget, zone_id, object, child, depth)
                                .await?,
                        );
                    }
                    Ok(out)
                }
                Userset::Intersection { children } => {
                    let mut iter = children.iter();
                    let Some(first) = iter.next() else {
                        return Ok(HashSet::new());
                    };
                    let mut out = self
                        .expand_userset(budget, zone_id, object, first, depth)
                        .await?;
                    for child in iter {
                        let next = self
                            .expand_userset(budget, zone_id, object, child, depth)
                            .await?;
                        out.retain(|s| next.contains(s));
                    }
                    Ok(out)
                }
                Userset::Exclusion { base, subtract } => {
                    let mut out = self
                        .expand_userset(budget, zone_id, object, base, depth)
                        .await?;
                    let excluded = self
                        .expand_userset(budget, zone_id, object, subtract, depth)
                        .await?;
                    out.retain(|s| !excluded.contains(s));
                    Ok(out)
                }
                Userset::TupleToUserset { tupleset, computed } => {
                    budget.count_query(&self.config)?;
                    let referenced = self
                        .records
                        .tuples_for_object(zone_id, object, Some(tupleset))
                        .await?;
                    if referenced.len() > self.config.max_fanout {
                        return Err(exhausted("max_fanout"));
                    }
                    let mut out = HashSet::new();
                    for tuple in referenced {
                        if tuple.is_expired(now) {
                            continue;
                        }
                        let target = tuple.subject.as_object();
                        let rule = self.rule_for(&target.kind, computed);
                        out.extend(
                            self.expand_userset(budget, zone_id, &target, &rule, depth + 1)
                                .await?,
                        );
                    }
                    Ok(out)
                }
            }
        })
    }

    /// Tuples matching the given filters.
    pub async fn list_tuples(
        &self,
        zone_id: ZoneId,
        subject: Option<&Subject>,
        relation: Option<&str>,
        object: Option<&ObjectRef>,
    ) -> KernelResult<Vec<RebacTuple>> {
        self.records
            .list_tuples(zone_id, subject, relation, object)
            .await
    }
}

#[cfg(test)]
mod tests {
    use nexus_core::Zone;

    use super::*;
    use crate::driver::memory_cachestore::MemoryCacheStore;
    use crate::driver::memory_recordstore::MemoryRecordStore;

    async fn setup() -> (RebacEngine, ZoneId, Arc<dyn RecordStore>) {
        let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let zone_id = Uuid::new_v4();
        records
            .create_zone(&Zone {
                zone_id,
                name: format!("z-{zone_id}"),
                created_at: now_micros(),
                deleted: false,
            })
            .await
            .unwrap();
        let engine = RebacEngine::new(records.clone(), cache, RebacConfig::default());
        (engine, zone_id, records)
    }

    fn tuple(zone_id: ZoneId, subject: Subject, relation: &str, object: ObjectRef) -> RebacTuple {
        RebacTuple {
            tuple_id: Uuid::new_v4(),
            zone_id,
            subject,
            relation: relation.into(),
            object,
            created_at: now_micros(),
            expires_at: None,
        }
    }

    fn ctx(zone_id: ZoneId) -> OperationContext {
        OperationContext::new(Subject::agent("alice"), zone_id)
    }

    #[tokio::test]
    async fn direct_grant_and_revoke_round_trip() {
        let (engine, zone_id, _) = setup().await;
        let alice = Subject::agent("alice");
        let file = ObjectRef::new("file", "/proj/x");

        let (allowed, _) = engine
            .check(&ctx(zone_id), &alice, "viewer-of", &file, zone_id)
            .await
            .unwrap();
        assert!(!allowed);

        let id = engine
            .grant(&tuple(zone_id, alice.clone(), "viewer-of", file.clone()))
            .await
            .unwrap();
        let (allowed, _) = engine
            .check(&ctx(zone_id), &alice, "viewer-of", &file, zone_id)
            .await
            .unwrap();
        assert!(allowed);

        engine.revoke(zone_id, id).await.unwrap();
        let (allowed, _) = engine
            .check(&ctx(zone_id), &alice, "viewer-of", &file, zone_id)
            .await
            .unwrap();
        assert!(!allowed, "revoke restores the prior result");
    }

    #[tokio::test]
    async fn transitive_group_grant() {
        let (engine, zone_id, _) = setup().await;
        let alice = Subject::agent("alice");
        let file = ObjectRef::new("file", "/proj/x");

        let membership = engine
            .grant(&tuple(
                zone_id,
                alice.clone(),
                "member-of",
                ObjectRef::new("group", "devs"),
            ))
            .await
            .unwrap();
        engine
            .grant(&tuple(
                zone_id,
                Subject::group("devs"),
                "owner-of",
                file.clone(),
            ))
            .await
            .unwrap();

        let (allowed, _) = engine
            .check(&ctx(zone_id), &alice, "owner-of", &file, zone_id)
            .await
            .unwrap();
        assert!(allowed, "membership carries the group's grant");

        engine.revoke(zone_id, membership).await.unwrap();
        let (allowed, _) = engine
            .check(&ctx(zone_id), &alice, "owner-of", &file, zone_id)
            .await
            .unwrap();
        assert!(!allowed, "revoking membership severs the chain");
    }

    #[tokio::test]
    async fn permission_rewrites_grant_read_to_editors() {
        let (engine, zone_id, _) = setup().await;
        let alice = Subject::agent("alice");
        let file = ObjectRef::new("file", "/proj/x");

        engine
            .grant(&tuple(zone_id, alice.clone(), "editor-of", file.clone()))
            .await
            .unwrap();

        let (read, _) = engine
            .check(&ctx(zone_id), &alice, "read", &file, zone_id)
            .await
            .unwrap();
        let (write, _) = engine
            .check(&ctx(zone_id), &alice, "write", &file, zone_id)
            .await
            .unwrap();
        let (execute, _) = engine
            .check(&ctx(zone_id), &alice, "execute", &file, zone_id)
            .await
            .unwrap();
        assert!(read);
        assert!(write);
        assert!(!execute, "execute requires ownership");
    }

    #[tokio::test]
    async fn parent_of_inherits_read_through_tuple_to_userset() {
        let (engine, zone_id, _) = setup().await;
        let alice = Subject::agent("alice");
        let dir = ObjectRef::new("dir", "/proj");
        let file = ObjectRef::new("file", "/proj/x");

        engine
            .grant(&tuple(zone_id, alice.clone(), "viewer-of", dir.clone()))
            .await
            .unwrap();
        engine
            .grant(&tuple(zone_id, dir.as_subject(), "parent-of", file.clone()))
            .await
            .unwrap();

        let (allowed, _) = engine
            .check(&ctx(zone_id), &alice, "read", &file, zone_id)
            .await
            .unwrap();
        assert!(allowed, "read flows from the parent directory");
    }

    #[tokio::test]
    async fn cross_zone_check_sees_nothing() {
        let (engine, zone_a, records) = setup().await;
        let zone_b = Uuid::new_v4();
        records
            .create_zone(&Zone {
                zone_id: zone_b,
                name: format!("z-{zone_b}"),
                created_at: now_micros(),
                deleted: false,
            })
            .await
            .unwrap();

        let alice = Subject::agent("alice");
        let file = ObjectRef::new("file", "/x");
        engine
            .grant(&tuple(zone_a, alice.clone(), "viewer-of", file.clone()))
            .await
            .unwrap();

        let (allowed, _) = engine
            .check(&ctx(zone_b), &alice, "viewer-of", &file, zone_b)
            .await
            .unwrap();
        assert!(!allowed, "a same-named object in another zone grants nothing");
    }

    #[tokio::test]
    async fn version_token_advances_on_writes() {
        let (engine, zone_id, _) = setup().await;
        let alice = Subject::agent("alice");
        let file = ObjectRef::new("file", "/x");

        let (_, v1) = engine
            .check(&ctx(zone_id), &alice, "viewer-of", &file, zone_id)
            .await
            .unwrap();
        engine
            .grant(&tuple(zone_id, alice.clone(), "viewer-of", file.clone()))
            .await
            .unwrap();
        let (allowed, v2) = engine
            .check(&ctx(zone_id), &alice, "viewer-of", &file, zone_id)
            .await
            .unwrap();
        assert!(allowed);
        assert!(v2 > v1, "tuple writes advance the version token");
    }

    #[tokio::test]
    async fn cached_result_respects_consistency_levels() {
        let (engine, zone_id, _) = setup().await;
        let alice = Subject::agent("alice");
        let file = ObjectRef::new("file", "/x");
        engine
            .grant(&tuple(zone_id, alice.clone(), "viewer-of", file.clone()))
            .await
            .unwrap();

        // Prime the cache.
        let (first, version) = engine
            .check(&ctx(zone_id), &alice, "viewer-of", &file, zone_id)
            .await
            .unwrap();
        assert!(first);

        // Strong bypasses the cache but must agree on a frozen store.
        let strong_ctx = ctx(zone_id).with_consistency(Consistency::Strong);
        let (strong, _) = engine
            .check(&strong_ctx, &alice, "viewer-of", &file, zone_id)
            .await
            .unwrap();
        assert_eq!(strong, first);

        // Bounded at the returned token is satisfiable from cache.
        let bounded_ctx = ctx(zone_id).with_consistency(Consistency::Bounded(version));
        let (bounded, _) = engine
            .check(&bounded_ctx, &alice, "viewer-of", &file, zone_id)
            .await
            .unwrap();
        assert_eq!(bounded, first);
    }

    #[tokio::test]
    async fn admin_bypass_short_circuits() {
        let (engine, zone_id, _) = setup().await;
        let admin_ctx = ctx(zone_id).with_admin(true);
        let (allowed, _) = engine
            .check(
                &admin_ctx,
                &Subject::agent("root"),
                "write",
                &ObjectRef::new("file", "/anything"),
                zone_id,
            )
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    async fn depth_limit_fails_closed_with_resource_exhausted() {
        let (engine, zone_id, records) = setup().await;
        // parent-of chain deeper than max_depth.
        let mut child = ObjectRef::new("file", "/d/0");
        for i in 1..=15 {
            let parent = ObjectRef::new("dir", format!("/d/{i}"));
            records
                .insert_tuple(&tuple(
                    zone_id,
                    parent.as_subject(),
                    "parent-of",
                    child.clone(),
                ))
                .await
                .unwrap();
            child = parent;
        }

        let err = engine
            .check(
                &ctx(zone_id),
                &Subject::agent("alice"),
                "read",
                &ObjectRef::new("file", "/d/0"),
                zone_id,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, KernelError::ResourceExhausted { .. }),
            "limits must not masquerade as PermissionDenied: {err}"
        );
    }

    #[tokio::test]
    async fn expired_tuples_do_not_grant() {
        let (engine, zone_id, records) = setup().await;
        let alice = Subject::agent("alice");
        let file = ObjectRef::new("file", "/x");
        let mut t = tuple(zone_id, alice.clone(), "viewer-of", file.clone());
        t.expires_at = Some(now_micros() - 1);
        records.insert_tuple(&t).await.unwrap();

        let (allowed, _) = engine
            .check(&ctx(zone_id), &alice, "viewer-of", &file, zone_id)
            .await
            .unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn expand_lists_direct_and_group_subjects() {
        let (engine, zone_id, _) = setup().await;
        let alice = Subject::agent("alice");
        let bob = Subject::agent("bob");
        let file = ObjectRef::new("file", "/x");

        engine
            .grant(&tuple(zone_id, alice.clone(), "member-of", ObjectRef::new("group", "devs")))
            .await
            .unwrap();
        engine
            .grant(&tuple(zone_id, Subject::group("devs"), "viewer-of", file.clone()))
            .await
            .unwrap();
        engine
            .grant(&tuple(zone_id, bob.clone(), "viewer-of", file.clone()))
            .await
            .unwrap();

        let subjects = engine.expand(zone_id, "read", &file).await.unwrap();
        assert!(subjects.contains(&alice), "group member expanded");
        assert!(subjects.contains(&bob), "direct grant expanded");
        assert!(subjects.contains(&Subject::group("devs")));
    }

    #[tokio::test]
    async fn grant_is_idempotent() {
        let (engine, zone_id, _) = setup().await;
        let t = tuple(
            zone_id,
            Subject::agent("alice"),
            "viewer-of",
            ObjectRef::new("file", "/x"),
        );
        let id1 = engine.grant(&t).await.unwrap();
        let id2 = engine
            .grant(&RebacTuple {
                tuple_id: Uuid::new_v4(),
                ..t
            })
            .await
            .unwrap();
        assert_eq!(id1, id2);
    }
}
