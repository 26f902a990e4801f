//! Filesystem core: orchestrates the pillars and engines behind the public
//! operation surface.
//!
//! The core holds its collaborators by capability contract only
//! (composition over any driver), and every operation threads an
//! [`OperationContext`] through resolution, authorization, mutation, and
//! event publication. Dependency direction is strictly downward: core to
//! engines to pillars to drivers; the only upward references are the
//! injected [`Hook`](crate::hooks::Hook) callbacks.

mod attr;
mod history;
mod transfer;
mod write;

pub use write::WriteOptions;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use nexus_core::{
    now_micros, FileMetadata, KernelError, KernelResult, ObjectRef, OperationContext,
    OperationLogEntry, PathRegistration, RegistrationType, Subject, VirtualPath, Zone, ZoneId,
};

use crate::cas::CasEngine;
use crate::config::KernelConfig;
use crate::events::{self, FsEvent};
use crate::federation::{FederationRouter, PeerKernel};
use crate::hooks::{Hook, HookRegistry};
use crate::meta::MetadataStore;
use crate::pillar::cachestore::CacheStore;
use crate::pillar::metastore::Metastore;
use crate::pillar::objectstore::ObjectStore;
use crate::pillar::recordstore::{OpLogFilter, RecordStore};
use crate::rebac::RebacEngine;
use crate::router::{PathRouter, ResolvedPath};

/// The storage kernel's filesystem surface.
pub struct NexusFilesystem {
    pub(crate) config: KernelConfig,
    pub(crate) meta: MetadataStore,
    pub(crate) records: Arc<dyn RecordStore>,
    pub(crate) cache: Arc<dyn CacheStore>,
    pub(crate) cas: CasEngine,
    pub(crate) rebac: RebacEngine,
    pub(crate) router: PathRouter,
    pub(crate) hooks: HookRegistry,
    pub(crate) federation: FederationRouter,
}

/// Wires a [`NexusFilesystem`] from pillar drivers.
///
/// Anything not supplied falls back to the in-memory driver, which makes a
/// fully-working dev kernel a one-liner: `KernelBuilder::new().build()`.
pub struct KernelBuilder {
    config: KernelConfig,
    metastore: Option<Arc<dyn Metastore>>,
    records: Option<Arc<dyn RecordStore>>,
    cache: Option<Arc<dyn CacheStore>>,
    backends: HashMap<String, Arc<dyn ObjectStore>>,
    hooks: HookRegistry,
    federation: FederationRouter,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            metastore: None,
            records: None,
            cache: None,
            backends: HashMap::new(),
            hooks: HookRegistry::new(),
            federation: FederationRouter::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_metastore(mut self, metastore: Arc<dyn Metastore>) -> Self {
        self.metastore = Some(metastore);
        self
    }

    #[must_use]
    pub fn with_recordstore(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    #[must_use]
    pub fn with_cachestore(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Register an ObjectStore backend under its own `backend_id`.
    #[must_use]
    pub fn with_backend(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.backends.insert(store.backend_id().to_string(), store);
        self
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.register(hook);
        self
    }

    /// Route a path prefix to a peer kernel (federation).
    #[must_use]
    pub fn with_peer(mut self, prefix: VirtualPath, peer: Arc<dyn PeerKernel>) -> Self {
        self.federation.add_route(prefix, peer);
        self
    }

    pub fn build(mut self) -> KernelResult<NexusFilesystem> {
        use crate::driver::{
            MemoryCacheStore, MemoryMetastore, MemoryObjectStore, MemoryRecordStore,
        };

        let metastore = self
            .metastore
            .unwrap_or_else(|| Arc::new(MemoryMetastore::new()));
        let records = self
            .records
            .unwrap_or_else(|| Arc::new(MemoryRecordStore::new()));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCacheStore::new()));
        if !self.backends.contains_key(&self.config.default_backend) {
            let store = Arc::new(MemoryObjectStore::new(self.config.default_backend.clone()));
            self.backends
                .insert(self.config.default_backend.clone(), store);
        }
        for route_backend in self.config.backend_routes.values() {
            if !self.backends.contains_key(route_backend) {
                return Err(KernelError::invalid_argument(format!(
                    "backend route targets unregistered backend: {route_backend}"
                )));
            }
        }

        let meta = MetadataStore::new(metastore);
        let cas = CasEngine::new(meta.clone(), self.backends, self.config.cas_grace);
        let rebac = RebacEngine::new(records.clone(), cache.clone(), self.config.rebac.clone());
        let router = PathRouter::new(self.config.clone(), meta.clone());

        Ok(NexusFilesystem {
            config: self.config,
            meta,
            records,
            cache,
            cas,
            rebac,
            router,
            hooks: self.hooks,
            federation: self.federation,
        })
    }
}

impl NexusFilesystem {
    /// The authorization engine (grant/revoke/check/expand surface).
    #[must_use]
    pub fn rebac(&self) -> &RebacEngine {
        &self.rebac
    }

    /// The CAS engine (internal plumbing surface).
    #[must_use]
    pub fn cas(&self) -> &CasEngine {
        &self.cas
    }

    /// The federation routing table.
    #[must_use]
    pub fn federation(&self) -> &FederationRouter {
        &self.federation
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // --- Zone administration ---

    /// Create a zone with a unique name.
    pub async fn create_zone(&self, name: &str) -> KernelResult<Zone> {
        let zone = Zone {
            zone_id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: now_micros(),
            deleted: false,
        };
        self.records.create_zone(&zone).await?;
        Ok(zone)
    }

    pub async fn get_zone(&self, name: &str) -> KernelResult<Option<Zone>> {
        self.records.get_zone_by_name(name).await
    }

    /// Soft-delete a zone; all subsequent mutations in it are rejected.
    pub async fn delete_zone(&self, zone_id: ZoneId) -> KernelResult<()> {
        self.records.soft_delete_zone(zone_id).await
    }

    pub(crate) async fn ensure_zone_live(&self, zone_id: ZoneId) -> KernelResult<()> {
        match self.records.get_zone(zone_id).await? {
            Some(zone) if !zone.deleted => Ok(()),
            Some(_) => Err(KernelError::PermissionDenied {
                subject: "-".to_string(),
                permission: "access".to_string(),
                object: format!("zone:{zone_id} (deleted)"),
            }),
            None => Err(KernelError::not_found(format!("zone:{zone_id}"))),
        }
    }

    // --- Shared plumbing ---

    pub(crate) async fn resolve(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        mutating: bool,
    ) -> KernelResult<ResolvedPath> {
        ctx.check_deadline()?;
        let resolved = self.router.resolve(ctx, path, mutating).await?;
        // Crossing a mount requires access to every target zone; both the
        // origin zone (router policy) and the target zone (this check) must
        // admit the subject.
        for crossed in &resolved.crossed_zones {
            let (allowed, _) = self
                .rebac
                .check(
                    ctx,
                    &ctx.subject,
                    "read",
                    &ObjectRef::zone(*crossed),
                    *crossed,
                )
                .await?;
            if !allowed {
                return Err(KernelError::PermissionDenied {
                    subject: ctx.subject.to_string(),
                    permission: "read".to_string(),
                    object: format!("zone:{crossed}"),
                });
            }
        }
        Ok(resolved)
    }

    /// Authorize `permission` on an existing entry. Owners pass without a
    /// graph walk; everyone else goes through the ReBAC engine.
    pub(crate) async fn authorize_entry(
        &self,
        ctx: &OperationContext,
        permission: &str,
        resolved: &ResolvedPath,
        metadata: &FileMetadata,
    ) -> KernelResult<()> {
        if metadata.owner == ctx.subject {
            return Ok(());
        }
        let kind = if metadata.is_directory() { "dir" } else { "file" };
        let object = ObjectRef::new(kind, resolved.path.as_str());
        let (allowed, _) = self
            .rebac
            .check(ctx, &ctx.subject, permission, &object, resolved.zone_id)
            .await?;
        if allowed {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied {
                subject: ctx.subject.to_string(),
                permission: permission.to_string(),
                object: resolved.path.as_str().to_string(),
            })
        }
    }

    /// Authorize creating an entry under `path`'s parent.
    ///
    /// Namespace roots and implicit (entry-less) directories admit any
    /// zone-scoped subject; explicit directories gate on `write`.
    pub(crate) async fn authorize_parent_write(
        &self,
        ctx: &OperationContext,
        resolved: &ResolvedPath,
    ) -> KernelResult<()> {
        if ctx.subject.is_anonymous() {
            return Err(KernelError::PermissionDenied {
                subject: ctx.subject.to_string(),
                permission: "write".to_string(),
                object: resolved.path.as_str().to_string(),
            });
        }
        let Some(parent) = resolved.path.parent() else {
            return Err(KernelError::invalid_argument("cannot write to /"));
        };
        if parent.depth() <= 1 {
            // Root-level directory: router policy already gated it.
            return Ok(());
        }
        match self.meta.get_file(resolved.zone_id, &parent).await? {
            Some((metadata, _)) => {
                let parent_resolved = ResolvedPath {
                    path: parent,
                    ..resolved.clone()
                };
                self.authorize_entry(ctx, "write", &parent_resolved, &metadata)
                    .await
            }
            // Implicit directory: open to zone members.
            None => Ok(()),
        }
    }

    pub(crate) fn content_cache_key(zone_id: ZoneId, path: &VirtualPath, etag: &str) -> String {
        format!("content/{zone_id}{path}#{etag}")
    }

    pub(crate) async fn invalidate_content(&self, zone_id: ZoneId, path: &VirtualPath) {
        let prefix = format!("content/{zone_id}{path}#");
        if let Err(e) = self.cache.delete_by_prefix(&prefix).await {
            tracing::warn!(zone = %zone_id, path = %path, error = %e, "content cache invalidation failed");
        }
    }

    pub(crate) async fn publish_event(
        &self,
        zone_id: ZoneId,
        op_type: nexus_core::OpType,
        path: &VirtualPath,
        subject: &Subject,
    ) {
        let event = FsEvent {
            op_type,
            path: path.clone(),
            subject: subject.clone(),
            timestamp: now_micros(),
        };
        events::publish(self.cache.as_ref(), zone_id, &event).await;
    }

    /// Run a pillar I/O future under the context deadline (or the
    /// configured default when the context carries none), mapping elapse to
    /// `DeadlineExceeded`.
    pub(crate) async fn with_deadline<T>(
        &self,
        ctx: &OperationContext,
        fut: impl std::future::Future<Output = KernelResult<T>>,
    ) -> KernelResult<T> {
        let remaining = ctx.remaining().unwrap_or(self.config.default_op_timeout);
        tokio::time::timeout(remaining, fut)
            .await
            .map_err(|_| KernelError::DeadlineExceeded)?
    }

    // --- Read surface ---

    /// Read a file's bytes.
    pub async fn read(&self, ctx: &OperationContext, path: &VirtualPath) -> KernelResult<Bytes> {
        let resolved = self.resolve(ctx, path, false).await?;
        let Some((metadata, _)) = self.meta.get_file(resolved.zone_id, &resolved.path).await?
        else {
            return Err(KernelError::not_found(path.as_str()));
        };
        if metadata.is_directory() || metadata.is_mount() {
            return Err(KernelError::invalid_argument(format!(
                "not a regular file: {path}"
            )));
        }
        self.authorize_entry(ctx, "read", &resolved, &metadata).await?;

        let Some(hash) = metadata.content_hash.as_deref() else {
            return Ok(Bytes::new());
        };

        let cache_key = Self::content_cache_key(resolved.zone_id, &resolved.path, &metadata.etag);
        if let Ok(Some(cached)) = self.cache.get(&cache_key).await {
            metrics::counter!("nexus_content_cache_hits_total").increment(1);
            return Ok(cached);
        }

        let bytes = self
            .with_deadline(ctx, self.cas.get_content(&metadata.backend_id, hash))
            .await?;
        if bytes.len() <= self.config.content_cache_max_bytes {
            let _ = self
                .cache
                .set(&cache_key, bytes.clone(), Some(self.config.content_cache_ttl))
                .await;
        }
        Ok(bytes)
    }

    /// Metadata of an entry.
    pub async fn stat(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
    ) -> KernelResult<FileMetadata> {
        let resolved = self.resolve(ctx, path, false).await?;
        let Some((metadata, _)) = self.meta.get_file(resolved.zone_id, &resolved.path).await?
        else {
            return Err(KernelError::not_found(path.as_str()));
        };
        self.authorize_entry(ctx, "read", &resolved, &metadata).await?;
        Ok(metadata)
    }

    /// List a directory, filtered to entries the subject may read.
    pub async fn list(
        &self,
        ctx: &OperationContext,
        dir: &VirtualPath,
        recursive: bool,
    ) -> KernelResult<Vec<FileMetadata>> {
        let resolved = self.resolve(ctx, dir, false).await?;
        let entries = self
            .meta
            .list_dir(resolved.zone_id, &resolved.path, recursive, usize::MAX)
            .await?;

        let mut visible = Vec::with_capacity(entries.len());
        for metadata in entries {
            let entry_resolved = ResolvedPath {
                path: metadata.path.clone(),
                ..resolved.clone()
            };
            match self.authorize_entry(ctx, "read", &entry_resolved, &metadata).await {
                Ok(()) => visible.push(metadata),
                Err(KernelError::PermissionDenied { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(visible)
    }

    // --- Operation log & CAS plumbing ---

    /// Subscribe to a zone's file-change events (best-effort hints; the
    /// operation log is the authoritative record).
    #[must_use]
    pub fn subscribe_events(&self, zone_id: ZoneId) -> tokio::sync::broadcast::Receiver<Bytes> {
        self.cache.subscribe(&events::channel(zone_id))
    }

    /// Query the operation log for the context's zone.
    pub async fn query_operation_log(
        &self,
        ctx: &OperationContext,
        filter: &OpLogFilter,
    ) -> KernelResult<Vec<OperationLogEntry>> {
        ctx.check_deadline()?;
        let zone_id = ctx.require_zone()?;
        self.records.query_ops(zone_id, filter).await
    }

    /// Fetch raw CAS content by hash (internal plumbing, normally unused by
    /// end users).
    pub async fn get_content(
        &self,
        backend_id: Option<&str>,
        content_hash: &str,
    ) -> KernelResult<Bytes> {
        let backend = backend_id.unwrap_or(&self.config.default_backend);
        self.cas.get_content(backend, content_hash).await
    }

    // --- Path registrations ---

    /// Register a workspace or memory root for the context's zone.
    pub async fn register_path(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        registration_type: RegistrationType,
        metadata: serde_json::Value,
    ) -> KernelResult<()> {
        let resolved = self.resolve(ctx, path, true).await?;
        self.records
            .register_path(&PathRegistration {
                zone_id: resolved.zone_id,
                path: resolved.path,
                registration_type,
                owner: ctx.subject.clone(),
                metadata,
                created_at: now_micros(),
            })
            .await
    }

    pub async fn list_registrations(
        &self,
        ctx: &OperationContext,
        registration_type: Option<RegistrationType>,
    ) -> KernelResult<Vec<PathRegistration>> {
        let zone_id = ctx.require_zone()?;
        self.records
            .list_registrations(zone_id, registration_type)
            .await
    }
}
