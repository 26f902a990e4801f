//! Nexus Core -- entity types, operation context, error taxonomy, and content hashing.
//!
//! This crate provides the foundation layer for the Nexus storage kernel:
//!
//! - **Types** ([`types`]): the persistent entities -- `Zone`, `FileMetadata`,
//!   `ContentChunk`, `OperationLogEntry`, `Tag`, `RebacTuple`,
//!   `VersionHistoryEntry`, `PathRegistration` -- and the `Subject` identity form
//! - **Context** ([`context`]): `OperationContext` threaded through every kernel call
//! - **Error** ([`error`]): `KernelError`, the structured error taxonomy shared by
//!   all pillars and engines
//! - **Path** ([`path`]): `VirtualPath` validation and manipulation
//! - **Hash** ([`hash`]): SHA-256 content hashing for the content-addressed store
//! - **Time** ([`time`]): microsecond UTC timestamps

pub mod context;
pub mod error;
pub mod hash;
pub mod path;
pub mod time;
pub mod types;

// Context
pub use context::{Consistency, OperationContext};

// Error
pub use error::{ErrorKind, KernelError, KernelResult};

// Hash
pub use hash::{content_hash, is_content_hash, EMPTY_CONTENT_HASH};

// Path
pub use path::VirtualPath;

// Time
pub use time::now_micros;

// Types
pub use types::{
    ContentChunk, EntryType, FileMetadata, ObjectRef, OpId, OpType, OperationLogEntry,
    PathRegistration, RegistrationType, RebacTuple, Subject, Tag, TupleId,
    VersionHistoryEntry, Zone, ZoneId,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    /// Verify all re-exports are accessible from the crate root.
    #[test]
    fn reexports_accessible() {
        let _subject = Subject::agent("alice");
        let _ctx = OperationContext::anonymous();
        let _err = KernelError::Cancelled;
        let _hash = content_hash(b"hello");
        let _path = VirtualPath::parse("/workspace/a.txt");
        let _ = EMPTY_CONTENT_HASH;
        let _ = EntryType::Regular;
    }
}
