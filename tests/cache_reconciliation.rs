//! Longer reconciliation sequences against the entity cache: interleaved
//! local intents, remote events, resolutions, and resyncs.

use boardsync::cache::{EntityCache, RemoteOutcome};
use boardsync::error::Error;
use boardsync::model::{ChangeEvent, Entity, EntityId, OperationId, Team};

fn task(id: &str, status: &str) -> Entity {
    Entity::new(Team::Platform, status, format!("task {id}")).with_id(id)
}

#[test]
fn remote_stream_is_last_writer_wins() {
    let mut cache = EntityCache::new();

    cache.apply_remote(ChangeEvent::insert(task("t1", "todo")));
    cache.apply_remote(ChangeEvent::update(task("t1", "in_progress")));
    cache.apply_remote(ChangeEvent::insert(task("t2", "todo")));
    cache.apply_remote(ChangeEvent::update(task("t1", "review")));
    cache.apply_remote(ChangeEvent::delete(EntityId::from("t2")));

    assert_eq!(cache.len(), 1);
    let t1 = cache.get(&EntityId::from("t1")).unwrap();
    assert_eq!(t1.status, "review");
}

#[test]
fn buffered_remote_survives_commit() {
    let mut cache = EntityCache::new();
    cache.apply_remote(ChangeEvent::insert(task("t1", "todo")));

    let op = OperationId::generate();
    cache
        .apply_local(op, EntityId::from("t1"), Some(task("t1", "review")))
        .unwrap();

    // Two remote updates while pending; only the latest may survive.
    assert_eq!(
        cache.apply_remote(ChangeEvent::update(task("t1", "in_progress"))),
        RemoteOutcome::Buffered
    );
    assert_eq!(
        cache.apply_remote(ChangeEvent::update(task("t1", "done"))),
        RemoteOutcome::Buffered
    );
    // Visible state still shows the optimistic proposal.
    assert_eq!(cache.get(&EntityId::from("t1")).unwrap().status, "review");

    cache.commit(op, Some(task("t1", "review"))).unwrap();

    // The buffered event lands after the canonical result.
    assert_eq!(cache.get(&EntityId::from("t1")).unwrap().status, "done");
    assert!(!cache.has_pending(&EntityId::from("t1")));
}

#[test]
fn buffered_remote_survives_rollback() {
    let mut cache = EntityCache::new();
    cache.apply_remote(ChangeEvent::insert(task("t1", "todo")));

    let op = OperationId::generate();
    cache
        .apply_local(op, EntityId::from("t1"), Some(task("t1", "review")))
        .unwrap();
    cache.apply_remote(ChangeEvent::delete(EntityId::from("t1")));

    cache.rollback(op).unwrap();

    // Rollback restores the prior snapshot, then the buffered delete wins.
    assert!(cache.get(&EntityId::from("t1")).is_none());
    assert_eq!(cache.pending_count(), 0);
}

#[test]
fn one_pending_operation_per_entity() {
    let mut cache = EntityCache::new();
    cache.apply_remote(ChangeEvent::insert(task("t1", "todo")));
    cache.apply_remote(ChangeEvent::insert(task("t2", "todo")));

    let op1 = OperationId::generate();
    cache
        .apply_local(op1, EntityId::from("t1"), Some(task("t1", "review")))
        .unwrap();

    let err = cache
        .apply_local(
            OperationId::generate(),
            EntityId::from("t1"),
            Some(task("t1", "done")),
        )
        .unwrap_err();
    assert!(matches!(err, Error::EntityBusy(_)));

    // A different entity is unaffected by t1's pending operation.
    cache
        .apply_local(
            OperationId::generate(),
            EntityId::from("t2"),
            Some(task("t2", "in_progress")),
        )
        .unwrap();
    assert_eq!(cache.pending_count(), 2);

    // Resolving t1 reopens it for new intents.
    cache.commit(op1, Some(task("t1", "review"))).unwrap();
    cache
        .apply_local(
            OperationId::generate(),
            EntityId::from("t1"),
            Some(task("t1", "done")),
        )
        .unwrap();
}

#[test]
fn resync_keeps_optimistic_view_and_buffers_authoritative_row() {
    let mut cache = EntityCache::new();
    cache.apply_remote(ChangeEvent::insert(task("t1", "todo")));
    cache.apply_remote(ChangeEvent::insert(task("stale", "todo")));

    let op = OperationId::generate();
    cache
        .apply_local(op, EntityId::from("t1"), Some(task("t1", "review")))
        .unwrap();

    // Authoritative set: t1 moved server-side, stale is gone, t3 is new.
    cache.resync(vec![task("t1", "in_progress"), task("t3", "todo")]);

    // Non-pending rows are replaced outright.
    assert!(cache.get(&EntityId::from("stale")).is_none());
    assert_eq!(cache.get(&EntityId::from("t3")).unwrap().status, "todo");
    // The pending entity keeps its optimistic view until resolution.
    assert_eq!(cache.get(&EntityId::from("t1")).unwrap().status, "review");

    cache.rollback(op).unwrap();
    // The buffered authoritative row replays once the operation resolves.
    assert_eq!(
        cache.get(&EntityId::from("t1")).unwrap().status,
        "in_progress"
    );
}

#[test]
fn resync_buffers_server_side_absence_for_pending_entity() {
    let mut cache = EntityCache::new();
    cache.apply_remote(ChangeEvent::insert(task("t1", "todo")));

    let op = OperationId::generate();
    cache
        .apply_local(op, EntityId::from("t1"), Some(task("t1", "review")))
        .unwrap();

    // The server no longer knows t1 at all.
    cache.resync(vec![]);
    assert_eq!(cache.get(&EntityId::from("t1")).unwrap().status, "review");

    cache.rollback(op).unwrap();
    assert!(cache.get(&EntityId::from("t1")).is_none());
}

#[test]
fn commit_is_not_regressed_by_a_racing_resync() {
    let mut cache = EntityCache::new();
    cache.apply_remote(ChangeEvent::insert(task("t1", "todo")));

    let op = OperationId::generate();
    cache
        .apply_local(op, EntityId::from("t1"), Some(task("t1", "review")))
        .unwrap();

    // A full resync lands while the move is still in flight; the server
    // snapshot was taken before the move committed.
    cache.resync(vec![task("t1", "todo")]);
    assert_eq!(cache.get(&EntityId::from("t1")).unwrap().status, "review");

    cache.commit(op, Some(task("t1", "review"))).unwrap();
    // The freshly committed state stays visible; only a feed event that
    // arrived during the pending window may apply on top of it.
    assert_eq!(cache.get(&EntityId::from("t1")).unwrap().status, "review");
}

#[test]
fn version_advances_on_every_visible_change() {
    let mut cache = EntityCache::new();
    let v0 = cache.version();

    cache.apply_remote(ChangeEvent::insert(task("t1", "todo")));
    let v1 = cache.version();
    assert!(v1 > v0);

    let op = OperationId::generate();
    cache
        .apply_local(op, EntityId::from("t1"), Some(task("t1", "review")))
        .unwrap();
    let v2 = cache.version();
    assert!(v2 > v1);

    // A buffered event does not change the visible state.
    cache.apply_remote(ChangeEvent::update(task("t1", "done")));
    assert_eq!(cache.version(), v2);

    cache.commit(op, Some(task("t1", "review"))).unwrap();
    assert!(cache.version() > v2);
}
