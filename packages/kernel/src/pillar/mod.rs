//! The four storage pillar contracts.
//!
//! User-space code never addresses a driver directly; it addresses a pillar:
//!
//! - [`Metastore`]: ordered persistent key-value with prefix scan
//! - [`RecordStore`]: relational ACID over the kernel's tables
//! - [`ObjectStore`]: opaque-blob put/get/delete/list by key
//! - [`CacheStore`]: ephemeral KV with TTL and pub/sub channels
//!
//! Each trait is implemented by swappable drivers (see [`crate::driver`])
//! and shared as `Arc<dyn _>`.

pub mod cachestore;
pub mod metastore;
pub mod objectstore;
pub mod recordstore;

pub use cachestore::CacheStore;
pub use metastore::{Metastore, VersionedValue};
pub use objectstore::{ObjectStat, ObjectStore};
pub use recordstore::{
    OpLogFilter, QuarantineRecord, RebacChange, RebacChangeKind, RecordStore, WriteGroup,
};
