//! Feed lifecycle: reconnect with backoff, possible-gap handling, and the
//! full resync that reveals changes missed while disconnected.

mod support;

use std::time::Duration;

use boardsync::engine::EngineNotice;
use boardsync::feed::FeedState;
use boardsync::model::{Actor, EntityId, Team};
use boardsync::sim::SimServer;
use tokio::time::timeout;

use support::{fast_config, find, spawn_engine, task, wait_for, SETTLE};

#[tokio::test]
async fn engine_reaches_live_after_refused_connects() {
    let config = fast_config();
    let server = SimServer::new(config.board.clone());
    server.seed(vec![task("t1", Team::Platform, "todo")]);
    server.refuse_next_connects(2);

    let handle = spawn_engine(Actor::admin("alice", Team::Platform), &server, config);

    // Two refusals, then the third attempt connects and resyncs.
    wait_for(&handle, |entities| entities.len() == 1).await;
    assert_eq!(handle.feed_state().await.unwrap(), FeedState::Live);
    assert_eq!(server.live_feed_count(), 1);
}

#[tokio::test]
async fn delete_during_gap_is_revealed_by_resync() {
    let config = fast_config();
    let server = SimServer::new(config.board.clone());
    server.seed(vec![
        task("t1", Team::Platform, "todo"),
        task("t2", Team::Platform, "in_progress"),
    ]);

    let handle = spawn_engine(Actor::admin("alice", Team::Platform), &server, config);
    wait_for(&handle, |entities| entities.len() == 2).await;

    // The connection drops, and a delete happens while nobody is listening.
    server.drop_feed();
    server.remote_delete(EntityId::from("t2"));

    // Reconnect declares a possible gap; the resync removes the stale row.
    let snapshot = wait_for(&handle, |entities| find(entities, "t2").is_none()).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(handle.feed_state().await.unwrap(), FeedState::Live);
}

#[tokio::test]
async fn update_during_gap_is_revealed_by_resync() {
    let config = fast_config();
    let server = SimServer::new(config.board.clone());
    server.seed(vec![task("t1", Team::Platform, "todo")]);

    let handle = spawn_engine(Actor::admin("alice", Team::Platform), &server, config);
    wait_for(&handle, |entities| entities.len() == 1).await;

    server.drop_feed();
    server.remote_update(task("t1", Team::Platform, "done"));
    server.remote_insert(task("t2", Team::Platform, "todo"));

    wait_for(&handle, |entities| {
        entities.len() == 2
            && find(entities, "t1").is_some_and(|entity| entity.status == "done")
    })
    .await;
}

#[tokio::test]
async fn reconnect_announces_state_changes_and_possible_gap() {
    let config = fast_config();
    let server = SimServer::new(config.board.clone());
    server.seed(vec![task("t1", Team::Platform, "todo")]);

    let handle = spawn_engine(Actor::admin("alice", Team::Platform), &server, config);
    wait_for(&handle, |entities| entities.len() == 1).await;

    let mut notices = handle.subscribe();
    server.drop_feed();

    // Watch for the disconnect and the return to live.
    let mut saw_down = false;
    let mut saw_live_again = false;
    timeout(SETTLE, async {
        loop {
            match notices.recv().await {
                Ok(EngineNotice::FeedStateChanged(state)) => match state {
                    FeedState::Disconnected | FeedState::Reconnecting => saw_down = true,
                    FeedState::Live if saw_down => {
                        saw_live_again = true;
                        return;
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(_) => panic!("notice stream ended early"),
            }
        }
    })
    .await
    .expect("feed did not recover before timeout");

    assert!(saw_down);
    assert!(saw_live_again);

    // A resync follows the gap, so a post-gap edit is eventually visible.
    server.remote_update(task("t1", Team::Platform, "review"));
    wait_for(&handle, |entities| {
        find(entities, "t1").is_some_and(|entity| entity.status == "review")
    })
    .await;

    // The sim feed keeps exactly one live subscription after recovery.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.live_feed_count(), 1);
}
