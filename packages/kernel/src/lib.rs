//! Nexus storage kernel -- pillar contracts, drivers, engines, and the
//! filesystem core.
//!
//! The kernel exposes a unified hierarchical namespace over pluggable
//! object stores with content-addressed deduplication, a reversible
//! operation log, and relationship-based authorization:
//!
//! - **Pillars** ([`pillar`]): the four storage capability contracts
//! - **Drivers** ([`driver`]): in-memory, redb, PostgreSQL, local-FS and
//!   cloud implementations behind the contracts
//! - **Metadata layer** ([`meta`]): typed key encoding and serialization
//!   over the ordered KV
//! - **CAS** ([`cas`]): content-addressed storage with refcounts and
//!   grace-period reclamation
//! - **Operation log** ([`oplog`]): reversible journal of every mutation
//! - **ReBAC** ([`rebac`]): relationship-tuple authorization with cached,
//!   version-tokened checks
//! - **Router** ([`router`]): namespace policy and mount traversal
//! - **Filesystem core** ([`fs`]): the public operation surface
//! - **Federation** ([`federation`]): peer-kernel routing seam
//! - **Recovery** ([`recovery`]): startup log/metadata reconciliation

pub mod cas;
pub mod config;
pub mod driver;
pub mod events;
pub mod federation;
pub mod fs;
pub mod hooks;
pub mod meta;
pub mod oplog;
pub mod pillar;
pub mod rebac;
pub mod recovery;
pub mod router;

pub use config::{KernelConfig, NamespaceRootConfig, RebacConfig};
pub use fs::{KernelBuilder, NexusFilesystem, WriteOptions};
pub use recovery::{reconcile, ReconcileReport};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}

/// Integration tests for the full kernel pipeline: write/read/undo across
/// CAS, metadata, operation log, and ReBAC, wired from in-memory drivers.
#[cfg(test)]
mod integration_tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use nexus_core::{
        KernelError, ObjectRef, OpType, OperationContext, RebacTuple, Subject, VirtualPath,
        EMPTY_CONTENT_HASH,
    };
    use uuid::Uuid;

    use crate::driver::MemoryObjectStore;
    use crate::fs::{KernelBuilder, NexusFilesystem, WriteOptions};
    use crate::pillar::recordstore::OpLogFilter;

    const HELLO_WORLD_HASH: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    struct Fixture {
        fs: NexusFilesystem,
        objects: Arc<MemoryObjectStore>,
        zone: nexus_core::ZoneId,
    }

    async fn setup() -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let objects = Arc::new(MemoryObjectStore::new("local"));
        let fs = KernelBuilder::new()
            .with_backend(objects.clone())
            .build()
            .unwrap();
        let zone = fs.create_zone("acme").await.unwrap().zone_id;
        Fixture { fs, objects, zone }
    }

    fn ctx(fixture: &Fixture, subject: &str) -> OperationContext {
        OperationContext::new(Subject::agent(subject), fixture.zone)
    }

    fn path(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    async fn last_op_id(
        fixture: &Fixture,
        ctx: &OperationContext,
        p: &VirtualPath,
    ) -> nexus_core::OpId {
        fixture
            .fs
            .query_operation_log(
                ctx,
                &OpLogFilter {
                    path: Some(p.clone()),
                    limit: Some(1),
                    ..OpLogFilter::default()
                },
            )
            .await
            .unwrap()
            .first()
            .expect("expected a log entry")
            .op_id
    }

    // --- Scenario A: dedup ---

    #[tokio::test]
    async fn identical_content_across_paths_is_stored_once() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let bytes = Bytes::from_static(b"hello world");

        fixture
            .fs
            .write(&alice, &path("/workspace/a.txt"), bytes.clone(), &WriteOptions::default())
            .await
            .unwrap();
        fixture
            .fs
            .write(&alice, &path("/workspace/b.txt"), bytes, &WriteOptions::default())
            .await
            .unwrap();

        let stat_a = fixture.fs.stat(&alice, &path("/workspace/a.txt")).await.unwrap();
        let stat_b = fixture.fs.stat(&alice, &path("/workspace/b.txt")).await.unwrap();
        assert_eq!(stat_a.content_hash.as_deref(), Some(HELLO_WORLD_HASH));
        assert_eq!(stat_b.content_hash.as_deref(), Some(HELLO_WORLD_HASH));
        assert_eq!(
            fixture.fs.cas().refcount(HELLO_WORLD_HASH).await.unwrap(),
            Some(2)
        );
        assert_eq!(fixture.objects.len(), 1, "exactly one blob in the store");
    }

    // --- Scenario B: undo write chain ---

    #[tokio::test]
    async fn undo_write_chain_restores_then_removes() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/x.txt");

        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"v1"), &WriteOptions::default())
            .await
            .unwrap();
        let op1 = last_op_id(&fixture, &alice, &file).await;
        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"v2"), &WriteOptions::default())
            .await
            .unwrap();
        let op2 = last_op_id(&fixture, &alice, &file).await;
        assert_eq!(
            fixture.fs.read(&alice, &file).await.unwrap(),
            Bytes::from_static(b"v2")
        );

        fixture.fs.undo(&alice, op2).await.unwrap();
        assert_eq!(
            fixture.fs.read(&alice, &file).await.unwrap(),
            Bytes::from_static(b"v1")
        );

        fixture.fs.undo(&alice, op1).await.unwrap();
        assert!(matches!(
            fixture.fs.read(&alice, &file).await,
            Err(KernelError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn undo_twice_fails_already_undone() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/once.txt");
        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"v"), &WriteOptions::default())
            .await
            .unwrap();
        let op = last_op_id(&fixture, &alice, &file).await;

        fixture.fs.undo(&alice, op).await.unwrap();
        let err = fixture.fs.undo(&alice, op).await.unwrap_err();
        assert!(matches!(err, KernelError::AlreadyUndone { .. }));
    }

    #[tokio::test]
    async fn undo_of_undo_redoes_the_write() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/redo.txt");

        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"v1"), &WriteOptions::default())
            .await
            .unwrap();
        let original = last_op_id(&fixture, &alice, &file).await;
        fixture.fs.undo(&alice, original).await.unwrap();
        assert!(fixture.fs.read(&alice, &file).await.is_err());

        let undo_row = last_op_id(&fixture, &alice, &file).await;
        fixture.fs.undo(&alice, undo_row).await.unwrap();
        assert_eq!(
            fixture.fs.read(&alice, &file).await.unwrap(),
            Bytes::from_static(b"v1")
        );

        // The original row is active again.
        let ops = fixture
            .fs
            .query_operation_log(
                &alice,
                &OpLogFilter {
                    path: Some(file.clone()),
                    op_type: Some(OpType::Write),
                    ..OpLogFilter::default()
                },
            )
            .await
            .unwrap();
        assert!(!ops.iter().find(|o| o.op_id == original).unwrap().undone);
    }

    // --- Scenario C: time travel ---

    #[tokio::test]
    async fn read_at_returns_contents_by_timestamp() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let doc = path("/workspace/doc");

        fixture
            .fs
            .write(&alice, &doc, Bytes::from_static(b"A"), &WriteOptions::default())
            .await
            .unwrap();
        let t_a = fixture.fs.stat(&alice, &doc).await.unwrap().modified_at;
        fixture
            .fs
            .write(&alice, &doc, Bytes::from_static(b"B"), &WriteOptions::default())
            .await
            .unwrap();
        let t_b = fixture.fs.stat(&alice, &doc).await.unwrap().modified_at;
        assert!(t_b > t_a);

        let mid = (t_a + t_b) / 2;
        assert_eq!(
            fixture.fs.read_at(&alice, &doc, mid).await.unwrap(),
            Bytes::from_static(b"A")
        );
        assert_eq!(
            fixture.fs.read_at(&alice, &doc, t_b + 1_000).await.unwrap(),
            Bytes::from_static(b"B")
        );
        assert!(matches!(
            fixture.fs.read_at(&alice, &doc, t_a - 1_000).await,
            Err(KernelError::NotFound { .. })
        ));
    }

    // --- Scenario D: transitive grant through the filesystem surface ---

    #[tokio::test]
    async fn group_grant_opens_read_access_for_members() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let bob = ctx(&fixture, "bob");
        let file = path("/workspace/proj/x");

        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"secret"), &WriteOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            fixture.fs.read(&bob, &file).await,
            Err(KernelError::PermissionDenied { .. })
        ));

        let membership = fixture
            .fs
            .rebac()
            .grant(&RebacTuple {
                tuple_id: Uuid::new_v4(),
                zone_id: fixture.zone,
                subject: bob.subject.clone(),
                relation: "member-of".into(),
                object: ObjectRef::new("group", "devs"),
                created_at: nexus_core::now_micros(),
                expires_at: None,
            })
            .await
            .unwrap();
        fixture
            .fs
            .rebac()
            .grant(&RebacTuple {
                tuple_id: Uuid::new_v4(),
                zone_id: fixture.zone,
                subject: Subject::group("devs"),
                relation: "viewer-of".into(),
                object: ObjectRef::new("file", file.as_str()),
                created_at: nexus_core::now_micros(),
                expires_at: None,
            })
            .await
            .unwrap();

        assert_eq!(
            fixture.fs.read(&bob, &file).await.unwrap(),
            Bytes::from_static(b"secret")
        );

        fixture.fs.rebac().revoke(fixture.zone, membership).await.unwrap();
        assert!(matches!(
            fixture.fs.read(&bob, &file).await,
            Err(KernelError::PermissionDenied { .. })
        ));
    }

    // --- Scenario E: optimistic concurrency ---

    #[tokio::test]
    async fn stale_if_match_fails_precondition() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/f.txt");

        let e1 = fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"base"), &WriteOptions::default())
            .await
            .unwrap();

        let e2 = fixture
            .fs
            .write(
                &alice,
                &file,
                Bytes::from_static(b"from A"),
                &WriteOptions {
                    if_match: Some(e1.clone()),
                    ..WriteOptions::default()
                },
            )
            .await
            .unwrap();
        assert_ne!(e1, e2);

        let err = fixture
            .fs
            .write(
                &alice,
                &file,
                Bytes::from_static(b"from B"),
                &WriteOptions {
                    if_match: Some(e1),
                    ..WriteOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::PreconditionFailed { .. }));
        assert_eq!(
            fixture.fs.read(&alice, &file).await.unwrap(),
            Bytes::from_static(b"from A")
        );
    }

    // --- Scenario F: cross-zone isolation ---

    #[tokio::test]
    async fn zones_are_fully_isolated() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let zone_b = fixture.fs.create_zone("rival").await.unwrap().zone_id;
        let intruder = OperationContext::new(Subject::agent("alice"), zone_b);
        let file = path("/workspace/x");

        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"zA"), &WriteOptions::default())
            .await
            .unwrap();

        // The same subject scoped to another zone sees nothing.
        assert!(matches!(
            fixture.fs.read(&intruder, &file).await,
            Err(KernelError::NotFound { .. })
        ));

        // A viewer tuple in zone A grants nothing when checked in zone B.
        fixture
            .fs
            .rebac()
            .grant(&RebacTuple {
                tuple_id: Uuid::new_v4(),
                zone_id: fixture.zone,
                subject: Subject::agent("carol"),
                relation: "viewer-of".into(),
                object: ObjectRef::new("file", file.as_str()),
                created_at: nexus_core::now_micros(),
                expires_at: None,
            })
            .await
            .unwrap();
        let (allowed, _) = fixture
            .fs
            .rebac()
            .check(
                &intruder,
                &Subject::agent("carol"),
                "viewer-of",
                &ObjectRef::new("file", file.as_str()),
                zone_b,
            )
            .await
            .unwrap();
        assert!(!allowed);
    }

    // --- Round-trip and idempotence laws ---

    #[tokio::test]
    async fn write_read_round_trip() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/rt.bin");
        let bytes = Bytes::from(vec![0_u8, 1, 2, 255, 254]);

        fixture
            .fs
            .write(&alice, &file, bytes.clone(), &WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(fixture.fs.read(&alice, &file).await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn rewriting_identical_bytes_adds_no_reference() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/same.txt");
        let bytes = Bytes::from_static(b"hello world");

        fixture
            .fs
            .write(&alice, &file, bytes.clone(), &WriteOptions::default())
            .await
            .unwrap();
        fixture
            .fs
            .write(&alice, &file, bytes.clone(), &WriteOptions::default())
            .await
            .unwrap();

        assert_eq!(fixture.fs.read(&alice, &file).await.unwrap(), bytes);
        assert_eq!(
            fixture.fs.cas().refcount(HELLO_WORLD_HASH).await.unwrap(),
            Some(1),
            "identical rewrite must not grow the refcount"
        );
    }

    // --- Boundary behaviors ---

    #[tokio::test]
    async fn empty_write_gets_the_empty_hash() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/empty");

        fixture
            .fs
            .write(&alice, &file, Bytes::new(), &WriteOptions::default())
            .await
            .unwrap();
        let stat = fixture.fs.stat(&alice, &file).await.unwrap();
        assert_eq!(stat.size_bytes, 0);
        assert_eq!(stat.content_hash.as_deref(), Some(EMPTY_CONTENT_HASH));
        assert_eq!(fixture.fs.read(&alice, &file).await.unwrap(), Bytes::new());
    }

    #[tokio::test]
    async fn deleting_missing_path_logs_nothing() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");

        let before = fixture
            .fs
            .query_operation_log(&alice, &OpLogFilter::default())
            .await
            .unwrap()
            .len();
        let err = fixture
            .fs
            .delete(&alice, &path("/workspace/ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::NotFound { .. }));
        let after = fixture
            .fs
            .query_operation_log(&alice, &OpLogFilter::default())
            .await
            .unwrap()
            .len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn readonly_root_rejects_writes_up_front() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let err = fixture
            .fs
            .write(
                &alice,
                &path("/archives/frozen.txt"),
                Bytes::from_static(b"x"),
                &WriteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::ReadOnly { .. }));
    }

    #[tokio::test]
    async fn expired_deadline_cancels_writes() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice")
            .with_deadline(std::time::Instant::now() - Duration::from_millis(1));
        let err = fixture
            .fs
            .write(
                &alice,
                &path("/workspace/late.txt"),
                Bytes::from_static(b"x"),
                &WriteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn soft_deleted_zone_rejects_mutations() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        fixture.fs.delete_zone(fixture.zone).await.unwrap();
        let err = fixture
            .fs
            .write(
                &alice,
                &path("/workspace/x"),
                Bytes::from_static(b"x"),
                &WriteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::PermissionDenied { .. }));
    }

    // --- Directories, copy, move ---

    #[tokio::test]
    async fn mkdir_delete_and_undo_cycle() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let dir = path("/workspace/proj");

        fixture.fs.mkdir(&alice, &dir, false).await.unwrap();
        assert!(fixture.fs.stat(&alice, &dir).await.unwrap().is_directory());

        fixture
            .fs
            .write(
                &alice,
                &path("/workspace/proj/f"),
                Bytes::from_static(b"x"),
                &WriteOptions::default(),
            )
            .await
            .unwrap();
        let err = fixture.fs.delete(&alice, &dir).await.unwrap_err();
        assert!(matches!(err, KernelError::Constraint { .. }), "non-empty dir");

        fixture.fs.delete(&alice, &path("/workspace/proj/f")).await.unwrap();
        fixture.fs.delete(&alice, &dir).await.unwrap();
        assert!(fixture.fs.stat(&alice, &dir).await.is_err());

        // Undo the directory delete.
        let op = last_op_id(&fixture, &alice, &dir).await;
        fixture.fs.undo(&alice, op).await.unwrap();
        assert!(fixture.fs.stat(&alice, &dir).await.unwrap().is_directory());
    }

    #[tokio::test]
    async fn mkdir_create_parents_builds_the_chain() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        fixture
            .fs
            .mkdir(&alice, &path("/workspace/a/b/c"), true)
            .await
            .unwrap();
        assert!(fixture
            .fs
            .stat(&alice, &path("/workspace/a/b"))
            .await
            .unwrap()
            .is_directory());
    }

    #[tokio::test]
    async fn copy_is_metadata_only_within_a_backend() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let src = path("/workspace/orig.txt");
        let dst = path("/workspace/copy.txt");

        fixture
            .fs
            .write(&alice, &src, Bytes::from_static(b"hello world"), &WriteOptions::default())
            .await
            .unwrap();
        fixture.fs.copy(&alice, &src, &dst).await.unwrap();

        assert_eq!(
            fixture.fs.read(&alice, &dst).await.unwrap(),
            Bytes::from_static(b"hello world")
        );
        assert_eq!(
            fixture.fs.cas().refcount(HELLO_WORLD_HASH).await.unwrap(),
            Some(2)
        );
        assert_eq!(fixture.objects.len(), 1, "no bytes were copied");
    }

    #[tokio::test]
    async fn move_carries_tags_versions_and_content() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let src = path("/workspace/old-name");
        let dst = path("/workspace/new-name");

        fixture
            .fs
            .write(&alice, &src, Bytes::from_static(b"v1"), &WriteOptions::default())
            .await
            .unwrap();
        fixture
            .fs
            .write(&alice, &src, Bytes::from_static(b"v2"), &WriteOptions::default())
            .await
            .unwrap();
        fixture.fs.set_tag(&alice, &src, "color", "red").await.unwrap();

        fixture.fs.r#move(&alice, &src, &dst).await.unwrap();

        assert!(fixture.fs.stat(&alice, &src).await.is_err());
        assert_eq!(
            fixture.fs.read(&alice, &dst).await.unwrap(),
            Bytes::from_static(b"v2")
        );
        let tags = fixture.fs.list_tags(&alice, &dst).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].value, "red");
        assert_eq!(fixture.fs.list_versions(&alice, &dst).await.unwrap().len(), 1);

        // Undo the move.
        let op = last_op_id(&fixture, &alice, &dst).await;
        fixture.fs.undo(&alice, op).await.unwrap();
        assert_eq!(
            fixture.fs.read(&alice, &src).await.unwrap(),
            Bytes::from_static(b"v2")
        );
        assert!(fixture.fs.stat(&alice, &dst).await.is_err());
    }

    #[tokio::test]
    async fn list_filters_entries_by_read_permission() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let bob = ctx(&fixture, "bob");

        fixture
            .fs
            .write(&alice, &path("/workspace/a1"), Bytes::from_static(b"1"), &WriteOptions::default())
            .await
            .unwrap();
        fixture
            .fs
            .write(&bob, &path("/workspace/b1"), Bytes::from_static(b"2"), &WriteOptions::default())
            .await
            .unwrap();

        let seen_by_bob = fixture
            .fs
            .list(&bob, &path("/workspace"), false)
            .await
            .unwrap();
        let names: Vec<&str> = seen_by_bob.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(names, vec!["/workspace/b1"], "alice's file is filtered out");
    }

    // --- Tags, chmod, chown ---

    #[tokio::test]
    async fn tag_set_delete_and_undo() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/tagged");
        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"x"), &WriteOptions::default())
            .await
            .unwrap();

        fixture.fs.set_tag(&alice, &file, "state", "draft").await.unwrap();
        fixture.fs.set_tag(&alice, &file, "state", "final").await.unwrap();
        let op = last_op_id(&fixture, &alice, &file).await;

        // Undo the second set: back to draft.
        fixture.fs.undo(&alice, op).await.unwrap();
        let tags = fixture.fs.list_tags(&alice, &file).await.unwrap();
        assert_eq!(tags[0].value, "draft");

        fixture.fs.delete_tag(&alice, &file, "state").await.unwrap();
        assert!(fixture.fs.list_tags(&alice, &file).await.unwrap().is_empty());
        assert!(matches!(
            fixture.fs.delete_tag(&alice, &file, "state").await,
            Err(KernelError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn chmod_and_undo_restores_mode() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/mode.txt");
        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"x"), &WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(fixture.fs.stat(&alice, &file).await.unwrap().mode, 0o644);

        fixture.fs.chmod(&alice, &file, 0o600).await.unwrap();
        assert_eq!(fixture.fs.stat(&alice, &file).await.unwrap().mode, 0o600);

        let op = last_op_id(&fixture, &alice, &file).await;
        fixture.fs.undo(&alice, op).await.unwrap();
        assert_eq!(fixture.fs.stat(&alice, &file).await.unwrap().mode, 0o644);
    }

    // --- Versions, rollback, diff ---

    #[tokio::test]
    async fn rollback_restores_a_recorded_version() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/story.txt");

        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"draft one\n"), &WriteOptions::default())
            .await
            .unwrap();
        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"draft two\n"), &WriteOptions::default())
            .await
            .unwrap();

        let versions = fixture.fs.list_versions(&alice, &file).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_number, 1);

        fixture.fs.rollback(&alice, &file, 1).await.unwrap();
        assert_eq!(
            fixture.fs.read(&alice, &file).await.unwrap(),
            Bytes::from_static(b"draft one\n")
        );
        // The rollback itself recorded the superseded draft two.
        assert_eq!(fixture.fs.list_versions(&alice, &file).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn diff_between_version_and_current() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/diffed.txt");

        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"alpha\nbeta\n"), &WriteOptions::default())
            .await
            .unwrap();
        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"alpha\ngamma\n"), &WriteOptions::default())
            .await
            .unwrap();

        let diff = fixture.fs.diff(&alice, &file, 1, 0).await.unwrap();
        let text = String::from_utf8(diff.to_vec()).unwrap();
        assert!(text.contains("  alpha"));
        assert!(text.contains("- beta"));
        assert!(text.contains("+ gamma"));
    }

    // --- Batch write ---

    #[tokio::test]
    async fn batch_write_commits_all_entries_in_one_group() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let entries = vec![
            (path("/workspace/batch/a"), Bytes::from_static(b"1")),
            (path("/workspace/batch/b"), Bytes::from_static(b"2")),
            (path("/workspace/batch/c"), Bytes::from_static(b"3")),
        ];

        let etags = fixture
            .fs
            .write_batch(&alice, entries, &WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(etags.len(), 3);

        for (name, content) in [("a", "1"), ("b", "2"), ("c", "3")] {
            let p = path(&format!("/workspace/batch/{name}"));
            assert_eq!(
                fixture.fs.read(&alice, &p).await.unwrap(),
                Bytes::from(content.as_bytes().to_vec())
            );
        }
        let ops = fixture
            .fs
            .query_operation_log(
                &alice,
                &OpLogFilter {
                    path: Some(path("/workspace/batch")),
                    path_prefix: true,
                    ..OpLogFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ops.len(), 3);
    }

    // --- Mounts ---

    #[tokio::test]
    async fn mount_redirects_into_target_zone_with_both_permissions() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let zone_b = fixture.fs.create_zone("partner").await.unwrap().zone_id;
        let alice_in_b = OperationContext::new(Subject::agent("alice"), zone_b);

        // Content in zone B at the path the mount will expose.
        fixture
            .fs
            .write(
                &alice_in_b,
                &path("/workspace/linked/shared.txt"),
                Bytes::from_static(b"cross-zone"),
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        // Without access to zone B the mount cannot even be created.
        let err = fixture
            .fs
            .mount(&alice, &path("/workspace/linked"), zone_b)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::PermissionDenied { .. }));

        fixture
            .fs
            .rebac()
            .grant(&RebacTuple {
                tuple_id: Uuid::new_v4(),
                zone_id: zone_b,
                subject: alice.subject.clone(),
                relation: "member-of".into(),
                object: ObjectRef::zone(zone_b),
                created_at: nexus_core::now_micros(),
                expires_at: None,
            })
            .await
            .unwrap();
        fixture
            .fs
            .mount(&alice, &path("/workspace/linked"), zone_b)
            .await
            .unwrap();

        let bytes = fixture
            .fs
            .read(&alice, &path("/workspace/linked/shared.txt"))
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"cross-zone"));

        // A subject without zone-B access is stopped at the mount.
        let bob = ctx(&fixture, "bob");
        let err = fixture
            .fs
            .read(&bob, &path("/workspace/linked/shared.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::PermissionDenied { .. }));
    }

    // --- Events ---

    #[tokio::test]
    async fn writes_publish_events_on_the_zone_channel() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        // Subscribe before the write so the event is not missed.
        let mut rx = fixture.fs.subscribe_events(fixture.zone);

        fixture
            .fs
            .write(
                &alice,
                &path("/workspace/evt.txt"),
                Bytes::from_static(b"x"),
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        let raw = rx.recv().await.unwrap();
        let event: crate::events::FsEvent = serde_json::from_slice(&raw).unwrap();
        assert_eq!(event.op_type, OpType::Write);
        assert_eq!(event.path, path("/workspace/evt.txt"));
    }

    // --- Consistency of refcounts (invariant 2) ---

    #[tokio::test]
    async fn refcounts_equal_referencing_rows_after_mixed_workload() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");

        let f1 = path("/workspace/inv/a");
        let f2 = path("/workspace/inv/b");
        fixture
            .fs
            .write(&alice, &f1, Bytes::from_static(b"one"), &WriteOptions::default())
            .await
            .unwrap();
        fixture
            .fs
            .write(&alice, &f1, Bytes::from_static(b"two"), &WriteOptions::default())
            .await
            .unwrap();
        fixture
            .fs
            .write(&alice, &f2, Bytes::from_static(b"one"), &WriteOptions::default())
            .await
            .unwrap();
        fixture.fs.copy(&alice, &f2, &path("/workspace/inv/c")).await.unwrap();
        fixture.fs.delete(&alice, &f1).await.unwrap();

        // Count references per hash: live metadata entries plus version rows.
        let mut expected: HashMap<String, u64> = HashMap::new();
        for entry in fixture
            .fs
            .metadata_handle()
            .list_dir(fixture.zone, &path("/"), true, usize::MAX)
            .await
            .unwrap()
        {
            if let Some(hash) = entry.content_hash {
                *expected.entry(hash).or_default() += 1;
            }
        }
        for p in [&f1, &f2, &path("/workspace/inv/c")] {
            for version in fixture
                .fs
                .records_handle()
                .list_versions(fixture.zone, p)
                .await
                .unwrap()
            {
                *expected.entry(version.content_hash).or_default() += 1;
            }
        }

        for chunk in fixture
            .fs
            .metadata_handle()
            .scan_chunks(None, 1000)
            .await
            .unwrap()
        {
            assert_eq!(
                chunk.refcount,
                expected.get(&chunk.content_hash).copied().unwrap_or(0),
                "hash {} refcount disagrees with referencing rows",
                chunk.content_hash
            );
        }
    }

    // --- Recovery ---

    #[tokio::test]
    async fn recovery_reapplies_when_claimed_content_is_live() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/torn.txt");

        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"committed"), &WriteOptions::default())
            .await
            .unwrap();

        // Simulate a torn commit: the log row exists but the metadata
        // vanished. The CAS blob is still live, so recovery completes the
        // logged write instead of reverting it.
        fixture
            .fs
            .metadata_handle()
            .delete_file(fixture.zone, &file, None)
            .await
            .unwrap();

        let report = crate::recovery::reconcile(&fixture.fs, fixture.zone, 60_000_000)
            .await
            .unwrap();
        assert_eq!(report.reapplied, 1);
        assert_eq!(report.rolled_back, 0);
        assert_eq!(report.quarantined, 1);
        let quarantined = fixture.fs.list_quarantine(fixture.zone).await.unwrap();
        assert_eq!(quarantined.len(), report.quarantined);

        assert_eq!(
            fixture.fs.read(&alice, &file).await.unwrap(),
            Bytes::from_static(b"committed")
        );
    }

    #[tokio::test]
    async fn recovery_rolls_back_when_claimed_content_is_gone() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        let file = path("/workspace/torn2.txt");

        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"original"), &WriteOptions::default())
            .await
            .unwrap();
        fixture
            .fs
            .write(&alice, &file, Bytes::from_static(b"replacement"), &WriteOptions::default())
            .await
            .unwrap();
        let replacement_hash = fixture
            .fs
            .stat(&alice, &file)
            .await
            .unwrap()
            .content_hash
            .unwrap();

        // Torn commit plus a lost chunk entry: the claimed content is no
        // longer live, so recovery restores the pre-write state instead.
        fixture
            .fs
            .metadata_handle()
            .delete_file(fixture.zone, &file, None)
            .await
            .unwrap();
        let (_, raw) = fixture
            .fs
            .metadata_handle()
            .get_chunk(&replacement_hash)
            .await
            .unwrap()
            .unwrap();
        assert!(fixture
            .fs
            .metadata_handle()
            .swap_chunk(&replacement_hash, Some(&raw), None)
            .await
            .unwrap());

        let report = crate::recovery::reconcile(&fixture.fs, fixture.zone, 60_000_000)
            .await
            .unwrap();
        assert_eq!(report.rolled_back, 1);
        assert_eq!(report.reapplied, 0);
        assert_eq!(report.quarantined, 1);
        assert_eq!(
            fixture.fs.list_quarantine(fixture.zone).await.unwrap().len(),
            report.quarantined
        );

        assert_eq!(
            fixture.fs.read(&alice, &file).await.unwrap(),
            Bytes::from_static(b"original")
        );
    }

    #[tokio::test]
    async fn recovery_passes_cleanly_on_consistent_state() {
        let fixture = setup().await;
        let alice = ctx(&fixture, "alice");
        fixture
            .fs
            .write(
                &alice,
                &path("/workspace/fine.txt"),
                Bytes::from_static(b"ok"),
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        let report = crate::recovery::reconcile(&fixture.fs, fixture.zone, 60_000_000)
            .await
            .unwrap();
        assert_eq!(report.reapplied, 0);
        assert_eq!(report.rolled_back, 0);
        assert_eq!(report.quarantined, 0);
        assert!(fixture.fs.list_quarantine(fixture.zone).await.unwrap().is_empty());
    }
}
