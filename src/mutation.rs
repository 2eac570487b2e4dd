//! Optimistic mutation protocol.
//!
//! Every local intent becomes a three-state operation: PENDING after the
//! optimistic cache apply, then COMMITTED (server acknowledged, canonical
//! snapshot installed) or ROLLED_BACK (submission failed or was rejected).
//! Transient transport failures are retried a bounded number of times;
//! application-level rejections and timeouts roll back immediately so an
//! entity is never stuck in optimistic limbo.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{sleep, timeout, Duration};
use tracing::debug;

use crate::config::MutationConfig;
use crate::error::{Error, Result};
use crate::model::{Entity, EntityId, OperationId, ProposedChange};

const OPERATION_LOG_CAP: usize = 256;

/// Lifecycle of one optimistic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Committed,
    RolledBack,
}

/// Record of one optimistic operation, kept for inspection and the demo CLI.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub operation_id: OperationId,
    pub entity_id: EntityId,
    pub state: OperationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Bounded in-memory log of operations, newest last.
#[derive(Debug, Default)]
pub struct OperationLog {
    records: VecDeque<OperationRecord>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, operation_id: OperationId, entity_id: EntityId) {
        if self.records.len() == OPERATION_LOG_CAP {
            self.records.pop_front();
        }
        self.records.push_back(OperationRecord {
            operation_id,
            entity_id,
            state: OperationState::Pending,
            error: None,
            started_at: Utc::now(),
            resolved_at: None,
        });
    }

    pub fn resolve(&mut self, operation_id: OperationId, state: OperationState, error: Option<String>) {
        if let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|record| record.operation_id == operation_id)
        {
            record.state = state;
            record.error = error;
            record.resolved_at = Some(Utc::now());
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &OperationRecord> {
        self.records.iter()
    }

    pub fn pending(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.state == OperationState::Pending)
            .count()
    }
}

/// External task-mutation service.
///
/// `submit` must be idempotent-safe to retry on ambiguous failure; it
/// returns the canonical entity the server committed (`None` acknowledges a
/// delete).
#[async_trait]
pub trait MutationService: Send + Sync {
    async fn submit(
        &self,
        entity_id: &EntityId,
        change: ProposedChange,
    ) -> Result<Option<Entity>>;
}

/// Submit a mutation under the configured retry and timeout policy.
///
/// - Each attempt carries a bounded wait; exceeding it resolves
///   deterministically to a rollback, never an indefinite pending state.
/// - Transport failures retry up to `max_transient_retries` with short
///   delays; rejections are returned immediately.
pub async fn submit_with_policy<M>(
    service: &M,
    entity_id: &EntityId,
    change: ProposedChange,
    config: &MutationConfig,
) -> Result<Option<Entity>>
where
    M: MutationService + ?Sized,
{
    let mut attempt: u32 = 0;
    loop {
        let bounded = timeout(
            Duration::from_millis(config.submit_timeout_ms),
            service.submit(entity_id, change.clone()),
        );
        match bounded.await {
            Err(_) => return Err(Error::SubmitTimeout(config.submit_timeout_ms)),
            Ok(Ok(canonical)) => return Ok(canonical),
            Ok(Err(err)) if err.is_transient() && attempt < config.max_transient_retries => {
                attempt += 1;
                debug!(
                    entity_id = %entity_id,
                    attempt,
                    error = %err,
                    "transient submit failure, retrying"
                );
                sleep(Duration::from_millis(config.retry_delay_ms)).await;
            }
            Ok(Err(err)) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::model::Team;

    struct FlakyService {
        calls: AtomicU32,
        fail_first: u32,
        failure: fn() -> Error,
    }

    #[async_trait]
    impl MutationService for FlakyService {
        async fn submit(
            &self,
            entity_id: &EntityId,
            _change: ProposedChange,
        ) -> Result<Option<Entity>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err((self.failure)());
            }
            Ok(Some(
                Entity::new(Team::Platform, "review", "done").with_id(entity_id.as_str()),
            ))
        }
    }

    struct HangingService;

    #[async_trait]
    impl MutationService for HangingService {
        async fn submit(
            &self,
            _entity_id: &EntityId,
            _change: ProposedChange,
        ) -> Result<Option<Entity>> {
            std::future::pending().await
        }
    }

    fn config() -> MutationConfig {
        MutationConfig {
            submit_timeout_ms: 100,
            max_transient_retries: 2,
            retry_delay_ms: 1,
        }
    }

    fn move_change() -> ProposedChange {
        ProposedChange::MoveStatus {
            target: "review".to_string(),
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let service = FlakyService {
            calls: AtomicU32::new(0),
            fail_first: 2,
            failure: || Error::Transport("reset".to_string()),
        };
        let canonical =
            submit_with_policy(&service, &EntityId::from("t1"), move_change(), &config())
                .await
                .expect("eventual success");
        assert!(canonical.is_some());
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_retries() {
        let service = FlakyService {
            calls: AtomicU32::new(0),
            fail_first: 10,
            failure: || Error::Transport("reset".to_string()),
        };
        let err = submit_with_policy(&service, &EntityId::from("t1"), move_change(), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        // initial attempt plus two retries
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejection_does_not_retry() {
        let service = FlakyService {
            calls: AtomicU32::new(0),
            fail_first: 10,
            failure: || Error::Rejected("entity gone".to_string()),
        };
        let err = submit_with_policy(&service, &EntityId::from("t1"), move_change(), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_submission_times_out() {
        let err = submit_with_policy(
            &HangingService,
            &EntityId::from("t1"),
            move_change(),
            &config(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SubmitTimeout(100)));
    }

    #[test]
    fn operation_log_tracks_lifecycle() {
        let mut log = OperationLog::new();
        let op = OperationId::generate();
        log.open(op, EntityId::from("t1"));
        assert_eq!(log.pending(), 1);

        log.resolve(op, OperationState::Committed, None);
        assert_eq!(log.pending(), 0);
        let record = log.records().last().expect("record");
        assert_eq!(record.state, OperationState::Committed);
        assert!(record.resolved_at.is_some());
    }

    #[test]
    fn operation_log_is_bounded() {
        let mut log = OperationLog::new();
        for index in 0..(OPERATION_LOG_CAP + 10) {
            log.open(OperationId::generate(), EntityId::from(format!("t{index}").as_str()));
        }
        assert_eq!(log.records().count(), OPERATION_LOG_CAP);
    }
}
