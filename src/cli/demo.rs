//! `boardsync demo` - scripted engine session against the in-memory backend.
//!
//! Exercises the full loop: cold-start resync, an optimistic move, a remote
//! change from another client, a feed gap with an upstream delete, and a
//! rejected submission that rolls back.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};

use crate::aggregate::AggregateSnapshot;
use crate::config::Config;
use crate::engine::{EngineHandle, EngineNotice, SyncEngine};
use crate::error::{Error, Result};
use crate::model::{Actor, Entity, EntityId, OperationId, Role, Team};
use crate::mutation::OperationRecord;
use crate::output::{emit_success, HumanOutput, OutputOptions};
use crate::sim::{SimFailure, SimServer};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Serialize)]
struct StepReport {
    name: &'static str,
    outcome: String,
}

#[derive(Serialize)]
struct DemoReport {
    actor: String,
    role: Role,
    team: Team,
    steps: Vec<StepReport>,
    entities: Vec<Entity>,
    aggregate: AggregateSnapshot,
    operations: Vec<OperationRecord>,
}

pub fn run(
    config_path: Option<&PathBuf>,
    options: OutputOptions,
    actor_id: &str,
    role_raw: &str,
    team_raw: &str,
    allowed: Vec<String>,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    // keep the scripted gap recovery snappy
    config.feed.initial_backoff_ms = config.feed.initial_backoff_ms.min(50);

    let role = Role::parse(role_raw)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown role '{role_raw}'")))?;
    let team = Team::parse(team_raw)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown team '{team_raw}'")))?;

    let allowed = if role != Role::Admin && allowed.is_empty() {
        config.board.status_universe(team).to_vec()
    } else {
        allowed
    };
    let actor = match role {
        Role::Admin => Actor::admin(actor_id, team),
        _ => Actor::with_role(actor_id, role, team, allowed),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(script(actor, config))?;

    let mut human = HumanOutput::new("Demo session complete");
    human.push_summary("actor", format!("{} ({:?})", report.actor, report.role));
    human.push_summary("entities", report.entities.len().to_string());
    human.push_summary("overdue", report.aggregate.overdue.to_string());
    for step in &report.steps {
        human.push_detail(format!("{}: {}", step.name, step.outcome));
    }
    emit_success(options, "demo", &report, Some(&human))
}

async fn script(actor: Actor, config: Config) -> Result<DemoReport> {
    let server = SimServer::new(config.board.clone());
    server.seed(seed_entities());

    let handle = SyncEngine::spawn(
        actor.clone(),
        config,
        server.transport(),
        Arc::new(server.clone()),
        Arc::new(server.clone()),
    );
    let mut notices = handle.subscribe();
    let mut steps = Vec::new();

    // cold start: wait for the authoritative set to land
    let snapshot = wait_for_snapshot(&handle, |entities| !entities.is_empty()).await?;
    steps.push(StepReport {
        name: "cold_start_resync",
        outcome: format!("{} entities visible", snapshot.len()),
    });

    // optimistic move, confirmed by the server
    steps.push(StepReport {
        name: "optimistic_move",
        outcome: propose_and_settle(&handle, &mut notices, "task-alpha", "review").await,
    });

    // another client inserts an entity; it arrives over the feed
    server.remote_insert(
        Entity::new(actor.team, "todo", "filed from another browser").with_id("task-remote"),
    );
    wait_for_snapshot(&handle, |entities| {
        entities.iter().any(|entity| entity.id == EntityId::from("task-remote"))
    })
    .await?;
    steps.push(StepReport {
        name: "remote_insert",
        outcome: "task-remote visible without refresh".to_string(),
    });

    // feed gap: the delete is never delivered, only the resync reveals it
    server.drop_feed();
    server.remote_delete(EntityId::from("task-beta"));
    wait_for_snapshot(&handle, |entities| {
        !entities.iter().any(|entity| entity.id == EntityId::from("task-beta"))
    })
    .await?;
    steps.push(StepReport {
        name: "gap_resync",
        outcome: "task-beta gone after reconnect resync".to_string(),
    });

    // server refuses the next submission; the optimistic view rolls back
    server.fail_next_submit(SimFailure::Rejected);
    steps.push(StepReport {
        name: "rejected_submit",
        outcome: propose_and_settle(&handle, &mut notices, "task-gamma", "done").await,
    });

    let entities = handle.snapshot().await?;
    let aggregate = handle.aggregate().await?;
    let operations = handle.operations().await?;

    Ok(DemoReport {
        actor: actor.id,
        role: actor.role,
        team: actor.team,
        steps,
        entities,
        aggregate,
        operations,
    })
}

fn seed_entities() -> Vec<Entity> {
    let overdue = Utc::now() - ChronoDuration::days(2);
    vec![
        Entity::new(Team::Platform, "todo", "wire the feed client").with_id("task-alpha"),
        Entity::new(Team::Platform, "in_progress", "cache eviction pass").with_id("task-beta"),
        Entity::new(Team::Product, "todo", "onboarding flow copy").with_id("task-gamma"),
        Entity::new(Team::Product, "done", "pricing page refresh").with_id("task-delta"),
        Entity::new(Team::Platform, "review", "backfill job alerts")
            .with_id("task-epsilon")
            .with_due_at(overdue),
    ]
}

async fn propose_and_settle(
    handle: &EngineHandle,
    notices: &mut broadcast::Receiver<EngineNotice>,
    entity_id: &str,
    target: &str,
) -> String {
    match handle.propose_move(EntityId::from(entity_id), target).await {
        Ok(operation_id) => match wait_for_resolution(notices, operation_id).await {
            Ok(EngineNotice::IntentCommitted { .. }) => {
                format!("{entity_id} committed to '{target}'")
            }
            Ok(EngineNotice::IntentRolledBack { reason, .. }) => {
                format!("{entity_id} rolled back: {reason}")
            }
            Ok(_) => unreachable!("resolution filter"),
            Err(err) => format!("{entity_id} unresolved: {err}"),
        },
        Err(err) => format!("{entity_id} rejected: {err}"),
    }
}

async fn wait_for_resolution(
    notices: &mut broadcast::Receiver<EngineNotice>,
    operation_id: OperationId,
) -> Result<EngineNotice> {
    let matches_op = |notice: &EngineNotice| match notice {
        EngineNotice::IntentCommitted { operation_id: id } => *id == operation_id,
        EngineNotice::IntentRolledBack { operation_id: id, .. } => *id == operation_id,
        _ => false,
    };

    timeout(STEP_TIMEOUT, async {
        loop {
            match notices.recv().await {
                Ok(notice) if matches_op(&notice) => return Ok(notice),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(Error::EngineStopped),
            }
        }
    })
    .await
    .map_err(|_| Error::OperationFailed("timed out waiting for intent resolution".to_string()))?
}

async fn wait_for_snapshot<P>(handle: &EngineHandle, mut pred: P) -> Result<Vec<Entity>>
where
    P: FnMut(&[Entity]) -> bool,
{
    timeout(STEP_TIMEOUT, async {
        loop {
            let snapshot = handle.snapshot().await?;
            if pred(&snapshot) {
                return Ok(snapshot);
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| Error::OperationFailed("timed out waiting for snapshot change".to_string()))?
}
