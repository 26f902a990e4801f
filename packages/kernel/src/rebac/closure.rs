//! Materialized transitive closure of `member-of` relations.
//!
//! Group membership is on the critical path of most permission checks, so
//! the closure table maps each member to every transitively reachable
//! group. It is rebuilt in bulk whenever `member-of` tuples change; checks
//! fall back to on-the-fly traversal while a zone's closure has never been
//! built.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use nexus_core::{now_micros, KernelResult, ObjectRef, Subject, ZoneId};

use crate::pillar::recordstore::RecordStore;

/// Ceiling on traversal per member, defending against membership cycles.
const MAX_GROUP_HOPS: usize = 64;

/// Rebuilds the closure for `zone_id` from the current `member-of` tuples.
///
/// Returns the number of `(member, group)` rows written.
pub async fn rebuild(records: &Arc<dyn RecordStore>, zone_id: ZoneId) -> KernelResult<usize> {
    let tuples = records.member_of_tuples(zone_id).await?;
    let now = now_micros();

    // Direct edges: member -> groups.
    let mut edges: HashMap<Subject, Vec<ObjectRef>> = HashMap::new();
    for tuple in tuples {
        if tuple.is_expired(now) {
            continue;
        }
        edges.entry(tuple.subject).or_default().push(tuple.object);
    }

    let mut rows: Vec<(Subject, ObjectRef)> = Vec::new();
    for member in edges.keys() {
        for group in reachable_groups(&edges, member) {
            rows.push((member.clone(), group));
        }
    }

    let count = rows.len();
    records.replace_group_closure(zone_id, rows).await?;
    tracing::debug!(zone = %zone_id, rows = count, "rebuilt group closure");
    Ok(count)
}

/// BFS over membership edges from one member.
fn reachable_groups(
    edges: &HashMap<Subject, Vec<ObjectRef>>,
    member: &Subject,
) -> Vec<ObjectRef> {
    let mut seen: HashSet<ObjectRef> = HashSet::new();
    let mut queue: VecDeque<Subject> = VecDeque::from([member.clone()]);
    let mut hops = 0;

    while let Some(current) = queue.pop_front() {
        hops += 1;
        if hops > MAX_GROUP_HOPS {
            break;
        }
        for group in edges.get(&current).into_iter().flatten() {
            if seen.insert(group.clone()) {
                queue.push_back(group.as_subject());
            }
        }
    }
    seen.into_iter().collect()
}

/// Groups a member transitively belongs to, from the closure when built,
/// otherwise by walking tuples directly (bounded by `MAX_GROUP_HOPS`).
pub async fn groups_for(
    records: &Arc<dyn RecordStore>,
    zone_id: ZoneId,
    member: &Subject,
) -> KernelResult<Vec<ObjectRef>> {
    if let Some(groups) = records.closure_groups_for(zone_id, member).await? {
        return Ok(groups);
    }

    // Closure never built for this zone: traverse on the fly.
    let now = now_micros();
    let mut seen: HashSet<ObjectRef> = HashSet::new();
    let mut queue: VecDeque<Subject> = VecDeque::from([member.clone()]);
    let mut hops = 0;
    while let Some(current) = queue.pop_front() {
        hops += 1;
        if hops > MAX_GROUP_HOPS {
            break;
        }
        for tuple in records.tuples_for_subject(zone_id, &current).await? {
            if tuple.relation != "member-of" || tuple.is_expired(now) {
                continue;
            }
            if seen.insert(tuple.object.clone()) {
                queue.push_back(tuple.object.as_subject());
            }
        }
    }
    Ok(seen.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use nexus_core::RebacTuple;
    use uuid::Uuid;

    use super::*;
    use crate::driver::memory_recordstore::MemoryRecordStore;

    async fn setup() -> (Arc<dyn RecordStore>, ZoneId) {
        let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let zone_id = Uuid::new_v4();
        records
            .create_zone(&nexus_core::Zone {
                zone_id,
                name: format!("z-{zone_id}"),
                created_at: now_micros(),
                deleted: false,
            })
            .await
            .unwrap();
        (records, zone_id)
    }

    fn member_of(zone_id: ZoneId, subject: Subject, group: &str) -> RebacTuple {
        RebacTuple {
            tuple_id: Uuid::new_v4(),
            zone_id,
            subject,
            relation: "member-of".into(),
            object: ObjectRef::new("group", group),
            created_at: now_micros(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn rebuild_materializes_transitive_membership() {
        let (records, zone_id) = setup().await;
        let alice = Subject::agent("alice");
        records
            .insert_tuple(&member_of(zone_id, alice.clone(), "devs"))
            .await
            .unwrap();
        records
            .insert_tuple(&member_of(zone_id, Subject::group("devs"), "eng"))
            .await
            .unwrap();
        records
            .insert_tuple(&member_of(zone_id, Subject::group("eng"), "staff"))
            .await
            .unwrap();

        rebuild(&records, zone_id).await.unwrap();

        let mut groups: Vec<String> = groups_for(&records, zone_id, &alice)
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.id)
            .collect();
        groups.sort();
        assert_eq!(groups, vec!["devs", "eng", "staff"]);
    }

    #[tokio::test]
    async fn membership_cycles_terminate() {
        let (records, zone_id) = setup().await;
        records
            .insert_tuple(&member_of(zone_id, Subject::group("a"), "b"))
            .await
            .unwrap();
        records
            .insert_tuple(&member_of(zone_id, Subject::group("b"), "a"))
            .await
            .unwrap();

        let rows = rebuild(&records, zone_id).await.unwrap();
        assert_eq!(rows, 4, "each of a, b reaches both groups");
    }

    #[tokio::test]
    async fn fallback_traversal_without_built_closure() {
        let (records, zone_id) = setup().await;
        let alice = Subject::agent("alice");
        records
            .insert_tuple(&member_of(zone_id, alice.clone(), "devs"))
            .await
            .unwrap();
        records
            .insert_tuple(&member_of(zone_id, Subject::group("devs"), "eng"))
            .await
            .unwrap();

        // No rebuild() call: groups_for must traverse tuples directly.
        let mut groups: Vec<String> = groups_for(&records, zone_id, &alice)
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.id)
            .collect();
        groups.sort();
        assert_eq!(groups, vec!["devs", "eng"]);
    }

    #[tokio::test]
    async fn expired_membership_excluded_from_rebuild() {
        let (records, zone_id) = setup().await;
        let alice = Subject::agent("alice");
        let mut tuple = member_of(zone_id, alice.clone(), "devs");
        tuple.expires_at = Some(now_micros() - 1);
        records.insert_tuple(&tuple).await.unwrap();

        rebuild(&records, zone_id).await.unwrap();
        assert!(groups_for(&records, zone_id, &alice)
            .await
            .unwrap()
            .is_empty());
    }
}
