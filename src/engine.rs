//! The assembled synchronization engine.
//!
//! One background task owns the cache, the operation log, the aggregate,
//! and the feed receiver; everything reaches it through a command channel,
//! so cache mutations never interleave. Mutation submissions run as
//! spawned tasks and resolve back into the loop as commit or rollback.
//!
//! Consumers hold an [`EngineHandle`]: snapshot/aggregate reads, the two
//! local-intent entry points, and a broadcast subscription for change
//! notifications.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::aggregate::{self, AggregateSnapshot, Debounce};
use crate::cache::{EntityCache, RemoteOutcome};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::feed::{ChangeFeedClient, ChangeFeedTransport, FeedNotice, FeedState, Subscription};
use crate::model::{
    priority_rank, Actor, ChangeEvent, Entity, EntityId, NewEntityFields, OperationId,
    ProposedChange, Team, PRIORITIES,
};
use crate::mutation::{
    self, MutationService, OperationLog, OperationRecord, OperationState,
};
use crate::permission;

const COMMAND_CAPACITY: usize = 64;
const NOTICE_CAPACITY: usize = 256;

/// Full resync fetch, used after a feed gap and at cold start.
#[async_trait]
pub trait ResyncService: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<Entity>>;
    async fn fetch_one(&self, entity_id: &EntityId) -> Result<Option<Entity>>;
}

/// Push notifications emitted to engine subscribers.
#[derive(Debug, Clone)]
pub enum EngineNotice {
    SnapshotChanged { version: u64 },
    AggregateChanged,
    FeedStateChanged(FeedState),
    Resynced { entity_count: usize },
    IntentCommitted { operation_id: OperationId },
    IntentRolledBack { operation_id: OperationId, reason: String },
    IntentRejected { entity_id: EntityId, reason: String },
}

enum EngineCommand {
    Snapshot {
        reply: oneshot::Sender<Vec<Entity>>,
    },
    Aggregate {
        reply: oneshot::Sender<AggregateSnapshot>,
    },
    FeedState {
        reply: oneshot::Sender<FeedState>,
    },
    Operations {
        reply: oneshot::Sender<Vec<OperationRecord>>,
    },
    ProposeMove {
        entity_id: EntityId,
        target: String,
        reply: oneshot::Sender<Result<OperationId>>,
    },
    ProposeCreate {
        team: Team,
        status: String,
        fields: NewEntityFields,
        reply: oneshot::Sender<Result<OperationId>>,
    },
    ProposeDelete {
        entity_id: EntityId,
        reply: oneshot::Sender<Result<OperationId>>,
    },
}

/// Cloneable handle to a running engine. The engine stops when every
/// handle has been dropped.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    notices: broadcast::Sender<EngineNotice>,
}

impl EngineHandle {
    /// Current visible entities for the engine's actor.
    pub async fn snapshot(&self) -> Result<Vec<Entity>> {
        self.request(|reply| EngineCommand::Snapshot { reply }).await
    }

    /// Current aggregate snapshot.
    pub async fn aggregate(&self) -> Result<AggregateSnapshot> {
        self.request(|reply| EngineCommand::Aggregate { reply }).await
    }

    /// Current feed connection state.
    pub async fn feed_state(&self) -> Result<FeedState> {
        self.request(|reply| EngineCommand::FeedState { reply }).await
    }

    /// Operation log records, oldest first.
    pub async fn operations(&self) -> Result<Vec<OperationRecord>> {
        self.request(|reply| EngineCommand::Operations { reply }).await
    }

    /// Propose moving an entity to a new status. Resolves optimistically;
    /// the commit or rollback arrives as an [`EngineNotice`].
    pub async fn propose_move(
        &self,
        entity_id: EntityId,
        target: impl Into<String>,
    ) -> Result<OperationId> {
        let target = target.into();
        self.request(|reply| EngineCommand::ProposeMove {
            entity_id,
            target,
            reply,
        })
        .await?
    }

    /// Propose creating a new entity in the given status.
    pub async fn propose_create(
        &self,
        team: Team,
        status: impl Into<String>,
        fields: NewEntityFields,
    ) -> Result<OperationId> {
        let status = status.into();
        self.request(|reply| EngineCommand::ProposeCreate {
            team,
            status,
            fields,
            reply,
        })
        .await?
    }

    /// Propose deleting an entity.
    pub async fn propose_delete(&self, entity_id: EntityId) -> Result<OperationId> {
        self.request(|reply| EngineCommand::ProposeDelete { entity_id, reply })
            .await?
    }

    /// Subscribe to engine notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| Error::EngineStopped)?;
        rx.await.map_err(|_| Error::EngineStopped)
    }
}

pub struct SyncEngine;

impl SyncEngine {
    /// Start the engine for `actor` against the given external services.
    pub fn spawn<T>(
        actor: Actor,
        config: Config,
        transport: T,
        mutation_service: Arc<dyn MutationService>,
        resync_service: Arc<dyn ResyncService>,
    ) -> EngineHandle
    where
        T: ChangeFeedTransport + 'static,
    {
        let (subscription, feed_rx) = ChangeFeedClient::subscribe(transport, config.feed.clone());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        let engine = Engine {
            actor,
            debounce: Debounce::new(config.aggregate.debounce_ms),
            config,
            cache: EntityCache::new(),
            aggregate: AggregateSnapshot::empty(),
            oplog: OperationLog::new(),
            feed_state: FeedState::Connecting,
            synced_once: false,
            mutation: mutation_service,
            resync: resync_service,
            notices: notice_tx.clone(),
        };
        tokio::spawn(engine.run(feed_rx, command_rx, subscription));

        EngineHandle {
            commands: command_tx,
            notices: notice_tx,
        }
    }
}

struct SubmissionResult {
    operation_id: OperationId,
    entity_id: EntityId,
    outcome: Result<Option<Entity>>,
}

struct Engine {
    actor: Actor,
    config: Config,
    cache: EntityCache,
    aggregate: AggregateSnapshot,
    debounce: Debounce,
    oplog: OperationLog,
    feed_state: FeedState,
    synced_once: bool,
    mutation: Arc<dyn MutationService>,
    resync: Arc<dyn ResyncService>,
    notices: broadcast::Sender<EngineNotice>,
}

impl Engine {
    async fn run(
        mut self,
        mut feed_rx: mpsc::Receiver<FeedNotice>,
        mut commands: mpsc::Receiver<EngineCommand>,
        _subscription: Subscription,
    ) {
        let mut submissions: JoinSet<SubmissionResult> = JoinSet::new();
        let mut feed_open = true;

        loop {
            let deadline = self.debounce.deadline();
            tokio::select! {
                notice = feed_rx.recv(), if feed_open => {
                    match notice {
                        Some(notice) => self.on_feed_notice(notice).await,
                        None => feed_open = false,
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command, &mut submissions),
                        // all handles dropped; stop
                        None => break,
                    }
                }
                Some(joined) = submissions.join_next(), if !submissions.is_empty() => {
                    match joined {
                        Ok(result) => self.on_submission_resolved(result).await,
                        Err(err) => warn!(error = %err, "submission task failed"),
                    }
                }
                _ = maybe_sleep_until(deadline), if deadline.is_some() => {
                    self.debounce.disarm();
                    self.recompute_aggregate();
                }
            }
        }
    }

    async fn on_feed_notice(&mut self, notice: FeedNotice) {
        match notice {
            FeedNotice::Event(event) => {
                if self.cache.apply_remote(event) == RemoteOutcome::Applied {
                    self.notify_snapshot();
                    self.recompute_aggregate();
                }
            }
            FeedNotice::StateChanged(state) => {
                debug!(state = %state, "feed state changed");
                self.feed_state = state;
                let _ = self.notices.send(EngineNotice::FeedStateChanged(state));
                if state == FeedState::Live && !self.synced_once {
                    // cold start: populate from the authoritative set
                    self.full_resync().await;
                }
            }
            FeedNotice::PossibleGap => {
                self.full_resync().await;
            }
        }
    }

    fn on_command(&mut self, command: EngineCommand, submissions: &mut JoinSet<SubmissionResult>) {
        match command {
            EngineCommand::Snapshot { reply } => {
                let visible = permission::visible_entities(&self.actor, &self.cache.snapshot());
                let _ = reply.send(visible);
            }
            EngineCommand::Aggregate { reply } => {
                let _ = reply.send(self.aggregate.clone());
            }
            EngineCommand::FeedState { reply } => {
                let _ = reply.send(self.feed_state);
            }
            EngineCommand::Operations { reply } => {
                let _ = reply.send(self.oplog.records().cloned().collect());
            }
            EngineCommand::ProposeMove {
                entity_id,
                target,
                reply,
            } => {
                let result = self.begin_move(&entity_id, &target);
                self.finish_begin(entity_id, target_change(target), result, reply, submissions);
            }
            EngineCommand::ProposeCreate {
                team,
                status,
                fields,
                reply,
            } => match self.begin_create(team, &status, fields.clone()) {
                Ok((operation_id, entity_id)) => {
                    let change = ProposedChange::Create {
                        team,
                        status,
                        fields,
                    };
                    self.spawn_submission(operation_id, entity_id, change, submissions);
                    let _ = reply.send(Ok(operation_id));
                }
                Err(err) => {
                    let _ = self.notices.send(EngineNotice::IntentRejected {
                        entity_id: EntityId::from("(new)"),
                        reason: err.to_string(),
                    });
                    let _ = reply.send(Err(err));
                }
            },
            EngineCommand::ProposeDelete { entity_id, reply } => {
                let result = self.begin_delete(&entity_id);
                self.finish_begin(entity_id, ProposedChange::Delete, result, reply, submissions);
            }
        }
    }

    /// Common tail for move/delete intents: reject-or-spawn plus reply.
    fn finish_begin(
        &mut self,
        entity_id: EntityId,
        change: ProposedChange,
        result: Result<OperationId>,
        reply: oneshot::Sender<Result<OperationId>>,
        submissions: &mut JoinSet<SubmissionResult>,
    ) {
        match result {
            Ok(operation_id) => {
                self.spawn_submission(operation_id, entity_id, change, submissions);
                let _ = reply.send(Ok(operation_id));
            }
            Err(err) => {
                let _ = self.notices.send(EngineNotice::IntentRejected {
                    entity_id,
                    reason: err.to_string(),
                });
                let _ = reply.send(Err(err));
            }
        }
    }

    fn begin_move(&mut self, entity_id: &EntityId, target: &str) -> Result<OperationId> {
        let entity = self
            .cache
            .get(entity_id)
            .ok_or_else(|| Error::UnknownEntity(entity_id.to_string()))?;

        if !self.config.board.is_valid_status(entity.team, target) {
            return Err(Error::UnknownStatus {
                team: entity.team.to_string(),
                status: target.to_string(),
            });
        }
        if !permission::can_transition(&self.actor, entity, target, &self.config.board) {
            return Err(Error::PermissionDenied(format!(
                "actor {} may not move {} to '{}'",
                self.actor.id, entity_id, target
            )));
        }

        let mut proposed = entity.clone();
        proposed.status = target.to_string();
        proposed.updated_at = Utc::now();

        self.apply_optimistic(entity_id.clone(), Some(proposed))
    }

    fn begin_create(
        &mut self,
        team: Team,
        status: &str,
        fields: NewEntityFields,
    ) -> Result<(OperationId, EntityId)> {
        let title = fields.title.trim();
        if title.is_empty() {
            return Err(Error::InvalidArgument("title cannot be empty".to_string()));
        }
        if let Some(priority) = fields.priority.as_deref() {
            if priority_rank(priority) >= PRIORITIES.len() {
                return Err(Error::InvalidArgument(format!(
                    "unknown priority '{priority}'"
                )));
            }
        }
        if !permission::can_create_in_status(&self.actor, team, status, &self.config.board) {
            return Err(Error::PermissionDenied(format!(
                "actor {} may not create in '{}' on the {} board",
                self.actor.id, status, team
            )));
        }

        let mut entity = Entity::new(team, status, title);
        entity.body = fields.body;
        entity.assignee_id = fields.assignee_id;
        entity.due_at = fields.due_at;
        if let Some(priority) = fields.priority {
            entity.priority = priority;
        }
        let entity_id = entity.id.clone();

        let operation_id = self.apply_optimistic(entity_id.clone(), Some(entity))?;
        Ok((operation_id, entity_id))
    }

    fn begin_delete(&mut self, entity_id: &EntityId) -> Result<OperationId> {
        let entity = self
            .cache
            .get(entity_id)
            .ok_or_else(|| Error::UnknownEntity(entity_id.to_string()))?;
        if !permission::can_delete(&self.actor, entity) {
            return Err(Error::PermissionDenied(format!(
                "actor {} may not delete {}",
                self.actor.id, entity_id
            )));
        }

        self.apply_optimistic(entity_id.clone(), None)
    }

    fn apply_optimistic(
        &mut self,
        entity_id: EntityId,
        proposed: Option<Entity>,
    ) -> Result<OperationId> {
        let operation_id = OperationId::generate();
        self.cache
            .apply_local(operation_id, entity_id.clone(), proposed)?;
        self.oplog.open(operation_id, entity_id);
        self.notify_snapshot();
        // metrics settle once the drag burst ends
        self.debounce.arm(Instant::now());
        Ok(operation_id)
    }

    fn spawn_submission(
        &mut self,
        operation_id: OperationId,
        entity_id: EntityId,
        change: ProposedChange,
        submissions: &mut JoinSet<SubmissionResult>,
    ) {
        let service = Arc::clone(&self.mutation);
        let config = self.config.mutation.clone();
        submissions.spawn(async move {
            let outcome =
                mutation::submit_with_policy(service.as_ref(), &entity_id, change, &config).await;
            SubmissionResult {
                operation_id,
                entity_id,
                outcome,
            }
        });
    }

    async fn on_submission_resolved(&mut self, result: SubmissionResult) {
        match result.outcome {
            Ok(canonical) => {
                if let Err(err) = self.cache.commit(result.operation_id, canonical) {
                    warn!(error = %err, "commit failed");
                    return;
                }
                self.oplog
                    .resolve(result.operation_id, OperationState::Committed, None);
                let _ = self.notices.send(EngineNotice::IntentCommitted {
                    operation_id: result.operation_id,
                });
                self.notify_snapshot();
                self.recompute_aggregate();
            }
            Err(err) => {
                let conflict = matches!(err, Error::Rejected(_));
                if let Err(rollback_err) = self.cache.rollback(result.operation_id) {
                    warn!(error = %rollback_err, "rollback failed");
                    return;
                }
                self.oplog.resolve(
                    result.operation_id,
                    OperationState::RolledBack,
                    Some(err.to_string()),
                );
                let _ = self.notices.send(EngineNotice::IntentRolledBack {
                    operation_id: result.operation_id,
                    reason: err.to_string(),
                });
                self.notify_snapshot();
                self.recompute_aggregate();

                if conflict {
                    // server refused; show the current truth for this entity
                    self.resync_entity(&result.entity_id).await;
                }
            }
        }
    }

    async fn full_resync(&mut self) {
        match self.resync.fetch_all().await {
            Ok(entities) => {
                let entity_count = entities.len();
                self.cache.resync(entities);
                self.synced_once = true;
                debug!(entity_count, "resynchronized from authoritative set");
                let _ = self.notices.send(EngineNotice::Resynced { entity_count });
                self.notify_snapshot();
                self.recompute_aggregate();
            }
            Err(err) => {
                // stale but locally consistent; the next gap retries
                warn!(error = %err, "full resync failed");
            }
        }
    }

    async fn resync_entity(&mut self, entity_id: &EntityId) {
        match self.resync.fetch_one(entity_id).await {
            Ok(Some(row)) => {
                self.cache.apply_remote(ChangeEvent::update(row));
            }
            Ok(None) => {
                self.cache.apply_remote(ChangeEvent::delete(entity_id.clone()));
            }
            Err(err) => {
                warn!(entity_id = %entity_id, error = %err, "entity resync failed");
                return;
            }
        }
        self.notify_snapshot();
        self.recompute_aggregate();
    }

    fn recompute_aggregate(&mut self) {
        let visible = permission::visible_entities(&self.actor, &self.cache.snapshot());
        self.aggregate = aggregate::compute(&visible, &self.config.board, Utc::now());
        let _ = self.notices.send(EngineNotice::AggregateChanged);
    }

    fn notify_snapshot(&self) {
        let _ = self.notices.send(EngineNotice::SnapshotChanged {
            version: self.cache.version(),
        });
    }
}

fn target_change(target: String) -> ProposedChange {
    ProposedChange::MoveStatus { target }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
