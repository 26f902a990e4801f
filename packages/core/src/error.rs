//! Structured error taxonomy shared by every pillar, engine, and the
//! filesystem core.
//!
//! Errors carry enough context (path, subject, operation) for a front-end to
//! produce a meaningful message. Sensitive internals (raw undo state, content
//! hashes) stay out of the user-facing `Display` output; callers that need
//! them log the structured fields instead.

use serde::{Deserialize, Serialize};

/// Result alias used across the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// Coarse error classification, stable across driver swaps.
///
/// Front-ends map these to exit codes or HTTP statuses; the kernel only ever
/// matches on kinds, never on driver-specific payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ReadOnly,
    PreconditionFailed,
    Stale,
    Conflict,
    Constraint,
    Unavailable,
    Cancelled,
    DeadlineExceeded,
    ResourceExhausted,
    InvalidArgument,
    Internal,
}

/// Error type returned by all kernel operations.
///
/// One variant per [`ErrorKind`]; drivers map their native errors into these
/// at the pillar trait boundary so callers never see engine-specific types.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("permission denied: {subject} lacks {permission} on {object}")]
    PermissionDenied {
        subject: String,
        permission: String,
        object: String,
    },

    #[error("namespace root {root} is read-only")]
    ReadOnly { root: String },

    #[error("precondition failed on {path}")]
    PreconditionFailed { path: String },

    /// Undo of a log entry whose `undone` flag is already set.
    #[error("operation {op_id} is already undone")]
    AlreadyUndone { op_id: String },

    /// Metastore compare-and-set lost: the key changed since it was read.
    #[error("stale revision for metastore key {key}")]
    Stale { key: String },

    /// Concurrent mutation raced with this one; the caller may retry.
    #[error("conflict: concurrent mutation of {key}")]
    Conflict { key: String },

    /// RecordStore constraint violation, named after the invariant broken.
    #[error("constraint violated: {constraint}")]
    Constraint { constraint: String },

    #[error("backend unavailable: {detail}")]
    Unavailable { detail: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A graph-safety or quota limit was hit; fails closed.
    #[error("resource exhausted: {limit}")]
    ResourceExhausted { limit: String },

    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl KernelError {
    /// The coarse classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ReadOnly { .. } => ErrorKind::ReadOnly,
            Self::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            Self::AlreadyUndone { .. } => ErrorKind::PreconditionFailed,
            Self::Stale { .. } => ErrorKind::Stale,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Constraint { .. } => ErrorKind::Constraint,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the operation as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Unavailable)
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::Unavailable {
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::Internal {
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(KernelError::not_found("/x").kind(), ErrorKind::NotFound);
        assert_eq!(KernelError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            KernelError::Stale { key: "k".into() }.kind(),
            ErrorKind::Stale
        );
    }

    #[test]
    fn retryable_kinds() {
        assert!(KernelError::Conflict { key: "k".into() }.is_retryable());
        assert!(KernelError::unavailable("down").is_retryable());
        assert!(!KernelError::DeadlineExceeded.is_retryable());
        assert!(!KernelError::not_found("/x").is_retryable());
    }

    #[test]
    fn display_omits_sensitive_detail() {
        let err = KernelError::PreconditionFailed {
            path: "/workspace/f.txt".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/workspace/f.txt"));
        assert!(!msg.contains("etag"), "no token material in display: {msg}");
    }
}
