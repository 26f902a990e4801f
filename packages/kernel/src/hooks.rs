//! Mutation hooks: the external plugin seam of the filesystem core.
//!
//! `before_*` hooks gate the operation (an error aborts it); `after_*`
//! hooks run best-effort once the operation has committed, and their
//! failures are logged, never propagated.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use nexus_core::{KernelResult, OperationContext, VirtualPath};

/// Observer/gate for filesystem mutations. All methods default to no-ops so
/// implementations override only the phases they care about.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Name used in log lines when the hook fails.
    fn name(&self) -> &str;

    async fn before_write(
        &self,
        _ctx: &OperationContext,
        _path: &VirtualPath,
        _bytes: &Bytes,
    ) -> KernelResult<()> {
        Ok(())
    }

    async fn after_write(
        &self,
        _ctx: &OperationContext,
        _path: &VirtualPath,
        _etag: &str,
    ) -> KernelResult<()> {
        Ok(())
    }

    async fn before_delete(
        &self,
        _ctx: &OperationContext,
        _path: &VirtualPath,
    ) -> KernelResult<()> {
        Ok(())
    }

    async fn after_delete(
        &self,
        _ctx: &OperationContext,
        _path: &VirtualPath,
    ) -> KernelResult<()> {
        Ok(())
    }
}

/// Ordered fan-out to registered hooks.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    /// Gate phase: the first error aborts the operation.
    pub async fn before_write(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
        bytes: &Bytes,
    ) -> KernelResult<()> {
        for hook in &self.hooks {
            hook.before_write(ctx, path, bytes).await?;
        }
        Ok(())
    }

    /// Best-effort phase: errors are logged and swallowed.
    pub async fn after_write(&self, ctx: &OperationContext, path: &VirtualPath, etag: &str) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_write(ctx, path, etag).await {
                tracing::warn!(hook = hook.name(), path = %path, error = %e, "after_write hook failed");
            }
        }
    }

    pub async fn before_delete(
        &self,
        ctx: &OperationContext,
        path: &VirtualPath,
    ) -> KernelResult<()> {
        for hook in &self.hooks {
            hook.before_delete(ctx, path).await?;
        }
        Ok(())
    }

    pub async fn after_delete(&self, ctx: &OperationContext, path: &VirtualPath) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_delete(ctx, path).await {
                tracing::warn!(hook = hook.name(), path = %path, error = %e, "after_delete hook failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nexus_core::KernelError;

    use super::*;

    struct CountingHook {
        before: AtomicUsize,
        after: AtomicUsize,
        fail_before: bool,
        fail_after: bool,
    }

    impl CountingHook {
        fn new(fail_before: bool, fail_after: bool) -> Self {
            Self {
                before: AtomicUsize::new(0),
                after: AtomicUsize::new(0),
                fail_before,
                fail_after,
            }
        }
    }

    #[async_trait]
    impl Hook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        async fn before_write(
            &self,
            _ctx: &OperationContext,
            _path: &VirtualPath,
            _bytes: &Bytes,
        ) -> KernelResult<()> {
            self.before.fetch_add(1, Ordering::Relaxed);
            if self.fail_before {
                return Err(KernelError::invalid_argument("blocked by policy"));
            }
            Ok(())
        }

        async fn after_write(
            &self,
            _ctx: &OperationContext,
            _path: &VirtualPath,
            _etag: &str,
        ) -> KernelResult<()> {
            self.after.fetch_add(1, Ordering::Relaxed);
            if self.fail_after {
                return Err(KernelError::internal("indexing offline"));
            }
            Ok(())
        }
    }

    fn fixture() -> (OperationContext, VirtualPath, Bytes) {
        (
            OperationContext::anonymous(),
            VirtualPath::parse("/workspace/a").unwrap(),
            Bytes::from_static(b"x"),
        )
    }

    #[tokio::test]
    async fn before_failure_aborts_and_stops_the_chain() {
        let failing = Arc::new(CountingHook::new(true, false));
        let downstream = Arc::new(CountingHook::new(false, false));
        let mut registry = HookRegistry::new();
        registry.register(failing.clone());
        registry.register(downstream.clone());

        let (ctx, path, bytes) = fixture();
        let err = registry.before_write(&ctx, &path, &bytes).await.unwrap_err();
        assert!(matches!(err, KernelError::InvalidArgument { .. }));
        assert_eq!(failing.before.load(Ordering::Relaxed), 1);
        assert_eq!(
            downstream.before.load(Ordering::Relaxed),
            0,
            "hooks after the failure must not run"
        );
    }

    #[tokio::test]
    async fn after_failures_are_swallowed() {
        let failing = Arc::new(CountingHook::new(false, true));
        let downstream = Arc::new(CountingHook::new(false, false));
        let mut registry = HookRegistry::new();
        registry.register(failing.clone());
        registry.register(downstream.clone());

        let (ctx, path, _) = fixture();
        registry.after_write(&ctx, &path, "etag").await;
        assert_eq!(failing.after.load(Ordering::Relaxed), 1);
        assert_eq!(
            downstream.after.load(Ordering::Relaxed),
            1,
            "best-effort phase keeps going past failures"
        );
    }
}
