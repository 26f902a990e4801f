//! Path router: namespace policy and mount traversal.
//!
//! Every access parses the root segment, applies the root's policy flags
//! (readonly roots reject mutations before any permission check runs), and
//! follows mount entries into their target zones. Routing never infers a
//! zone from the path: the zone comes from the operation context or from a
//! mount entry.

use nexus_core::{KernelError, KernelResult, OperationContext, VirtualPath, ZoneId};

use crate::config::{KernelConfig, NamespaceRootConfig};
use crate::meta::MetadataStore;

/// Outcome of resolving a virtual path.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// Zone the path finally lands in (differs from the context's zone
    /// after crossing a mount).
    pub zone_id: ZoneId,
    pub path: VirtualPath,
    /// ObjectStore backend serving this root.
    pub backend_id: String,
    pub root: NamespaceRootConfig,
    /// Zones whose mounts were traversed, in order. The caller must hold
    /// access to every one of them.
    pub crossed_zones: Vec<ZoneId>,
}

/// Namespace router over the metadata layer.
pub struct PathRouter {
    config: KernelConfig,
    meta: MetadataStore,
}

impl PathRouter {
    #[must_use]
    pub fn new(config: KernelConfig, meta: MetadataStore) -> Self {
        Self { config, meta }
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Resolve a path for the given context.
    ///
    /// `mutating` selects the readonly-root rejection; it runs before any
    /// ReBAC evaluation by design.
    pub async fn resolve(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        mutating: bool,
    ) -> KernelResult<ResolvedPath> {
        let root_name = path
            .root_segment()
            .ok_or_else(|| KernelError::invalid_argument("path has no namespace root"))?;
        let root = self
            .config
            .root(root_name)
            .ok_or_else(|| KernelError::not_found(path.as_str()))?
            .clone();

        if root.admin_only && !ctx.is_admin {
            return Err(KernelError::PermissionDenied {
                subject: ctx.subject.to_string(),
                permission: "admin".to_string(),
                object: format!("/{root_name}"),
            });
        }
        if ctx.subject.is_anonymous() && !root.public {
            return Err(KernelError::PermissionDenied {
                subject: ctx.subject.to_string(),
                permission: "enter".to_string(),
                object: format!("/{root_name}"),
            });
        }

        // Zone scoping is checked before the readonly flag: a caller with
        // no zone is denied entry even where a mutation would only be
        // rejected as read-only.
        let zone_id = match ctx.zone_id {
            Some(zone) => zone,
            None if root.requires_zone => {
                return Err(KernelError::PermissionDenied {
                    subject: ctx.subject.to_string(),
                    permission: "zone-scoped access".to_string(),
                    object: format!("/{root_name}"),
                });
            }
            None => self.config.public_zone_id.ok_or_else(|| {
                KernelError::PermissionDenied {
                    subject: ctx.subject.to_string(),
                    permission: "enter".to_string(),
                    object: format!("/{root_name}"),
                }
            })?,
        };

        if root.readonly && mutating {
            return Err(KernelError::ReadOnly {
                root: root_name.to_string(),
            });
        }

        let (zone_id, crossed_zones) = self.follow_mounts(zone_id, path).await?;

        Ok(ResolvedPath {
            zone_id,
            path: path.clone(),
            backend_id: self.config.backend_for_root(root_name).to_string(),
            root,
            crossed_zones,
        })
    }

    /// Follow mount entries along the path's ancestors.
    ///
    /// A mount redirects its strict descendants into the target zone; the
    /// mount entry itself stays visible in the parent zone so listings show
    /// it. Bounded by the configured mount depth.
    async fn follow_mounts(
        &self,
        start_zone: ZoneId,
        path: &VirtualPath,
    ) -> KernelResult<(ZoneId, Vec<ZoneId>)> {
        let mut zone_id = start_zone;
        let mut crossed = Vec::new();

        'outer: for _ in 0..self.config.mount_depth_limit {
            // Ancestors from the root downwards; the outermost mount wins.
            let mut ancestors: Vec<VirtualPath> = Vec::new();
            let mut cursor = path.parent();
            while let Some(dir) = cursor {
                if dir.is_root() {
                    break;
                }
                cursor = dir.parent();
                ancestors.push(dir);
            }
            ancestors.reverse();

            for ancestor in ancestors {
                let Some((metadata, _)) = self.meta.get_file(zone_id, &ancestor).await? else {
                    continue;
                };
                if metadata.is_mount() {
                    let target = metadata.target_zone_id.ok_or_else(|| {
                        KernelError::internal(format!(
                            "mount entry without target zone: {ancestor}"
                        ))
                    })?;
                    if target != zone_id {
                        crossed.push(target);
                        zone_id = target;
                        continue 'outer;
                    }
                }
            }
            return Ok((zone_id, crossed));
        }

        Err(KernelError::ResourceExhausted {
            limit: "mount_depth".to_string(),
        })
    }
}
