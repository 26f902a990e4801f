//! Per-call operation context.
//!
//! Every kernel operation takes an [`OperationContext`] carrying the acting
//! subject, zone scope, deadline, and requested consistency. There is no
//! default context and no bypass: unauthenticated callers use
//! [`OperationContext::anonymous`], which only matches namespaces explicitly
//! marked public.

use std::time::{Duration, Instant};

use crate::error::{KernelError, KernelResult};
use crate::types::{Subject, ZoneId};

/// Caller-requested freshness for reads and permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Any cached result is acceptable.
    Eventual,
    /// Cached results are acceptable if their version token is at least this.
    Bounded(u64),
    /// Bypass caches; evaluate against the current snapshot.
    Strong,
}

/// Identity, scope, and budget for a single kernel call.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// The acting subject (`agent:alice`, `user:bob`, ...).
    pub subject: Subject,
    /// Zone scope. Mandatory for zone-scoped namespace roots; never inferred
    /// from the path.
    pub zone_id: Option<ZoneId>,
    /// Group ids the subject is known to belong to (advisory; the ReBAC
    /// engine resolves authoritative membership itself).
    pub groups: Vec<String>,
    /// Whether the subject is an administrator.
    pub is_admin: bool,
    /// Absolute deadline for the whole operation.
    pub deadline: Option<Instant>,
    /// Requested consistency level.
    pub consistency: Consistency,
}

impl OperationContext {
    /// Context for an authenticated subject scoped to a zone.
    #[must_use]
    pub fn new(subject: Subject, zone_id: ZoneId) -> Self {
        Self {
            subject,
            zone_id: Some(zone_id),
            groups: Vec::new(),
            is_admin: false,
            deadline: None,
            consistency: Consistency::Eventual,
        }
    }

    /// Explicitly anonymous context. Matches only public namespaces.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            subject: Subject::anonymous(),
            zone_id: None,
            groups: Vec::new(),
            is_admin: false,
            deadline: None,
            consistency: Consistency::Eventual,
        }
    }

    #[must_use]
    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// The zone this call is scoped to, or `PermissionDenied` if none.
    pub fn require_zone(&self) -> KernelResult<ZoneId> {
        self.zone_id.ok_or_else(|| KernelError::PermissionDenied {
            subject: self.subject.to_string(),
            permission: "zone-scoped access".to_string(),
            object: "(no zone in context)".to_string(),
        })
    }

    /// Fails with `DeadlineExceeded` once the deadline has passed.
    pub fn check_deadline(&self) -> KernelResult<()> {
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(KernelError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Time remaining before the deadline, if one is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}
