//! Federation router (interface level).
//!
//! Multi-box deployments forward requests for non-local path prefixes to
//! peer kernels. The kernel only defines the seam: a [`PeerKernel`] trait
//! matching the filesystem contract, and a prefix routing table. Transport,
//! retry, and authentication between kernels live with the embedding
//! process. Cross-zone mounts resolved by the local kernel still enforce
//! the permissions of both zones before any forwarding happens.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use nexus_core::{FileMetadata, KernelResult, OperationContext, VirtualPath};

/// A remote kernel serving some path prefix.
#[async_trait]
pub trait PeerKernel: Send + Sync {
    /// Peer identifier for logging and routing tables.
    fn peer_id(&self) -> &str;

    async fn read(&self, ctx: &OperationContext, path: &VirtualPath) -> KernelResult<Bytes>;

    async fn write(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        bytes: Bytes,
    ) -> KernelResult<String>;

    async fn stat(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
    ) -> KernelResult<FileMetadata>;

    async fn list(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
    ) -> KernelResult<Vec<FileMetadata>>;
}

/// Where a path is served.
pub enum Route {
    /// This kernel owns the prefix.
    Local,
    /// A peer owns the prefix.
    Peer(Arc<dyn PeerKernel>),
}

/// Longest-prefix routing table over peer kernels.
#[derive(Default, Clone)]
pub struct FederationRouter {
    routes: Vec<(VirtualPath, Arc<dyn PeerKernel>)>,
}

impl FederationRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer for a path prefix.
    pub fn add_route(&mut self, prefix: VirtualPath, peer: Arc<dyn PeerKernel>) {
        self.routes.push((prefix, peer));
        // Longest prefix first so the most specific route wins.
        self.routes
            .sort_by(|(a, _), (b, _)| b.as_str().len().cmp(&a.as_str().len()));
    }

    /// Route a path to its owner.
    #[must_use]
    pub fn route(&self, path: &VirtualPath) -> Route {
        for (prefix, peer) in &self.routes {
            if path == prefix || path.is_inside(prefix) {
                return Route::Peer(Arc::clone(peer));
            }
        }
        Route::Local
    }
}
