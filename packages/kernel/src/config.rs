//! Kernel-level configuration.
//!
//! Controls the namespace root table, backend routing, CAS grace period,
//! ReBAC graph-safety limits, and default deadlines. `Default` yields the
//! standard root set with production-shaped limits; tests tighten or relax
//! individual fields.

use std::collections::HashMap;
use std::time::Duration;

/// Policy flags for one top-level namespace root.
#[derive(Debug, Clone)]
pub struct NamespaceRootConfig {
    /// Root segment name (`workspace`, `shared`, ...).
    pub name: String,
    /// Mutating operations are rejected with `ReadOnly` before any
    /// permission check runs.
    pub readonly: bool,
    /// Only admin subjects may enter.
    pub admin_only: bool,
    /// Entering requires a zone in the operation context.
    pub requires_zone: bool,
    /// Anonymous contexts may read here.
    pub public: bool,
}

impl NamespaceRootConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            readonly: false,
            admin_only: false,
            requires_zone: true,
            public: false,
        }
    }

    #[must_use]
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    #[must_use]
    pub fn admin_only(mut self) -> Self {
        self.admin_only = true;
        self.requires_zone = false;
        self
    }

    #[must_use]
    pub fn public(mut self) -> Self {
        self.public = true;
        self.requires_zone = false;
        self
    }
}

/// Graph-safety limits and cache policy for permission checks.
///
/// Every limit is hard-enforced per check; exceeding any of them fails
/// closed with `ResourceExhausted`.
#[derive(Debug, Clone)]
pub struct RebacConfig {
    pub max_depth: usize,
    pub max_nodes: usize,
    pub max_fanout: usize,
    pub max_queries: usize,
    pub check_timeout: Duration,
    /// Admin subjects short-circuit to allow when set.
    pub admin_bypass: bool,
    pub cache_ttl: Duration,
}

impl Default for RebacConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_nodes: 10_000,
            max_fanout: 1000,
            max_queries: 100,
            check_timeout: Duration::from_millis(100),
            admin_bypass: true,
            cache_ttl: Duration::from_secs(30),
        }
    }
}

/// Top-level kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Namespace roots with their policy flags.
    pub roots: Vec<NamespaceRootConfig>,
    /// Root name to ObjectStore backend id; roots not listed use
    /// `default_backend`.
    pub backend_routes: HashMap<String, String>,
    pub default_backend: String,
    /// How long a zero-refcount CAS blob survives before the sweep may
    /// reclaim it.
    pub cas_grace: Duration,
    /// Bound on mount-entry traversals per path resolution.
    pub mount_depth_limit: usize,
    /// Zone hosting public (zone-less) namespace roots. `None` means
    /// anonymous access is disabled even on roots flagged public.
    pub public_zone_id: Option<uuid::Uuid>,
    pub rebac: RebacConfig,
    /// Applied when a context carries no deadline.
    pub default_op_timeout: Duration,
    /// Files up to this size are served from the content cache.
    pub content_cache_max_bytes: usize,
    pub content_cache_ttl: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            roots: vec![
                NamespaceRootConfig::new("workspace"),
                NamespaceRootConfig::new("shared"),
                NamespaceRootConfig::new("archives").readonly(),
                NamespaceRootConfig::new("external"),
                NamespaceRootConfig::new("system").admin_only(),
            ],
            backend_routes: HashMap::new(),
            default_backend: "local".to_string(),
            cas_grace: Duration::from_secs(24 * 60 * 60),
            mount_depth_limit: 8,
            public_zone_id: None,
            rebac: RebacConfig::default(),
            default_op_timeout: Duration::from_secs(30),
            content_cache_max_bytes: 256 * 1024,
            content_cache_ttl: Duration::from_secs(60),
        }
    }
}

impl KernelConfig {
    /// Look up a root's config by name.
    #[must_use]
    pub fn root(&self, name: &str) -> Option<&NamespaceRootConfig> {
        self.roots.iter().find(|r| r.name == name)
    }

    /// Backend id serving a root.
    #[must_use]
    pub fn backend_for_root(&self, root: &str) -> &str {
        self.backend_routes
            .get(root)
            .map_or(self.default_backend.as_str(), String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roots_carry_expected_flags() {
        let config = KernelConfig::default();
        assert!(config.root("archives").unwrap().readonly);
        assert!(config.root("system").unwrap().admin_only);
        assert!(config.root("workspace").unwrap().requires_zone);
        assert!(config.root("nope").is_none());
    }

    #[test]
    fn backend_routing_falls_back_to_default() {
        let mut config = KernelConfig::default();
        config
            .backend_routes
            .insert("archives".into(), "s3-cold".into());
        assert_eq!(config.backend_for_root("archives"), "s3-cold");
        assert_eq!(config.backend_for_root("workspace"), "local");
    }

    #[test]
    fn rebac_limits_have_production_defaults() {
        let rebac = RebacConfig::default();
        assert_eq!(rebac.max_depth, 10);
        assert_eq!(rebac.max_nodes, 10_000);
        assert_eq!(rebac.max_fanout, 1000);
        assert_eq!(rebac.max_queries, 100);
        assert_eq!(rebac.check_timeout, Duration::from_millis(100));
    }
}
