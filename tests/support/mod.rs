#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use boardsync::config::Config;
use boardsync::engine::{EngineHandle, EngineNotice, SyncEngine};
use boardsync::model::{Actor, Entity, OperationId, Team};
use boardsync::sim::SimServer;

pub const SETTLE: Duration = Duration::from_secs(5);
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default config with timings shrunk so reconnects and retries settle
/// quickly under test.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.feed.initial_backoff_ms = 5;
    config.feed.max_backoff_ms = 40;
    config.mutation.submit_timeout_ms = 1_000;
    config.mutation.retry_delay_ms = 5;
    config.aggregate.debounce_ms = 10;
    config
}

pub fn spawn_engine(actor: Actor, server: &SimServer, config: Config) -> EngineHandle {
    let service = Arc::new(server.clone());
    SyncEngine::spawn(actor, config, server.transport(), service.clone(), service)
}

pub fn task(id: &str, team: Team, status: &str) -> Entity {
    Entity::new(team, status, format!("task {id}")).with_id(id)
}

/// Poll the engine snapshot until `pred` holds, returning the matching
/// snapshot. Panics if the condition is not reached within [`SETTLE`].
pub async fn wait_for<F>(handle: &EngineHandle, mut pred: F) -> Vec<Entity>
where
    F: FnMut(&[Entity]) -> bool,
{
    timeout(SETTLE, async {
        loop {
            let snapshot = handle.snapshot().await.expect("engine stopped");
            if pred(&snapshot) {
                return snapshot;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("snapshot condition not reached before timeout")
}

/// Block until the given operation commits or rolls back, returning the
/// resolving notice. Other notices are skipped.
pub async fn wait_for_resolution(
    notices: &mut broadcast::Receiver<EngineNotice>,
    operation_id: OperationId,
) -> EngineNotice {
    timeout(SETTLE, async {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    let resolved = match &notice {
                        EngineNotice::IntentCommitted { operation_id: id } => *id == operation_id,
                        EngineNotice::IntentRolledBack {
                            operation_id: id, ..
                        } => *id == operation_id,
                        _ => false,
                    };
                    if resolved {
                        return notice;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("engine stopped"),
            }
        }
    })
    .await
    .expect("operation did not resolve before timeout")
}

/// Drain any notices already queued, returning those that match `pred`.
pub async fn drain_matching<F>(
    notices: &mut broadcast::Receiver<EngineNotice>,
    quiet_for: Duration,
    mut pred: F,
) -> Vec<EngineNotice>
where
    F: FnMut(&EngineNotice) -> bool,
{
    let mut matched = Vec::new();
    loop {
        match timeout(quiet_for, notices.recv()).await {
            Ok(Ok(notice)) => {
                if pred(&notice) {
                    matched.push(notice);
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return matched,
        }
    }
}

pub fn find<'a>(snapshot: &'a [Entity], id: &str) -> Option<&'a Entity> {
    snapshot.iter().find(|entity| entity.id.as_str() == id)
}
