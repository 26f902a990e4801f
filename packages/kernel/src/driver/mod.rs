//! Concrete drivers behind the pillar contracts.
//!
//! In-memory drivers serve development and tests; persistent and networked
//! drivers are feature-gated the same way: `redb` (default) for the
//! embedded ordered KV, `postgres` for the networked SQL engine, `cloud`
//! for S3/GCS blobs. The replicated metastore layers linearizable writes
//! over any local driver via an injected [`ReplicatedLog`].

pub mod fs_objectstore;
pub mod memory_cachestore;
pub mod memory_metastore;
pub mod memory_objectstore;
pub mod memory_recordstore;
pub mod replicated_metastore;

#[cfg(feature = "cloud")]
pub mod cloud_objectstore;
#[cfg(feature = "postgres")]
pub mod postgres_recordstore;
#[cfg(feature = "redb")]
pub mod redb_metastore;

pub use fs_objectstore::FsObjectStore;
pub use memory_cachestore::MemoryCacheStore;
pub use memory_metastore::MemoryMetastore;
pub use memory_objectstore::MemoryObjectStore;
pub use memory_recordstore::MemoryRecordStore;
pub use replicated_metastore::{LocalLog, ReplicatedLog, ReplicatedMetastore};

#[cfg(feature = "cloud")]
pub use cloud_objectstore::CloudObjectStore;
#[cfg(feature = "postgres")]
pub use postgres_recordstore::PostgresRecordStore;
#[cfg(feature = "redb")]
pub use redb_metastore::RedbMetastore;
