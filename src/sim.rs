//! Deterministic in-memory backend for tests and the demo CLI.
//!
//! `SimServer` plays the authoritative store, the change feed, and the
//! mutation service at once. Tests drive concurrent actors by mutating the
//! server directly (`remote_*`), force feed gaps with `drop_feed`, and
//! inject submission failures with `fail_next_submit`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::config::BoardConfig;
use crate::engine::ResyncService;
use crate::error::{Error, Result};
use crate::feed::{ChangeFeedTransport, FeedConnection};
use crate::model::{ChangeEvent, Entity, EntityId, ProposedChange};
use crate::mutation::MutationService;

/// Failure injected into the next mutation submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFailure {
    /// Network-class failure; the engine retries these.
    Transport,
    /// Application-level rejection; rolls back immediately.
    Rejected,
    /// Never responds; exercises the bounded submission wait.
    Hang,
}

#[derive(Default)]
struct SimState {
    entities: HashMap<EntityId, Entity>,
    feeds: Vec<mpsc::UnboundedSender<ChangeEvent>>,
    refuse_connects: u32,
    queued_failures: VecDeque<SimFailure>,
    submit_delay: Duration,
}

/// In-memory stand-in for the remote task service.
#[derive(Clone)]
pub struct SimServer {
    board: BoardConfig,
    inner: Arc<Mutex<SimState>>,
}

impl SimServer {
    pub fn new(board: BoardConfig) -> Self {
        Self {
            board,
            inner: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// A transport handle for one feed subscriber.
    pub fn transport(&self) -> SimTransport {
        SimTransport {
            server: self.clone(),
        }
    }

    /// Install entities without emitting feed events (cold-start data).
    pub fn seed(&self, entities: Vec<Entity>) {
        let mut state = self.lock();
        for entity in entities {
            state.entities.insert(entity.id.clone(), entity);
        }
    }

    /// Authoritative insert by some other actor; broadcast to live feeds.
    pub fn remote_insert(&self, entity: Entity) {
        let mut state = self.lock();
        state.entities.insert(entity.id.clone(), entity.clone());
        broadcast(&mut state, ChangeEvent::insert(entity));
    }

    /// Authoritative update by some other actor; broadcast to live feeds.
    pub fn remote_update(&self, entity: Entity) {
        let mut state = self.lock();
        state.entities.insert(entity.id.clone(), entity.clone());
        broadcast(&mut state, ChangeEvent::update(entity));
    }

    /// Authoritative delete by some other actor; broadcast to live feeds.
    pub fn remote_delete(&self, entity_id: EntityId) {
        let mut state = self.lock();
        state.entities.remove(&entity_id);
        broadcast(&mut state, ChangeEvent::delete(entity_id));
    }

    /// Sever all live feed connections. Events that occur before the next
    /// reconnect are permanently missed, exactly like the real feed.
    pub fn drop_feed(&self) {
        self.lock().feeds.clear();
    }

    /// Refuse the next `count` feed connection attempts.
    pub fn refuse_next_connects(&self, count: u32) {
        self.lock().refuse_connects = count;
    }

    /// Queue a failure for an upcoming submission (FIFO).
    pub fn fail_next_submit(&self, failure: SimFailure) {
        self.lock().queued_failures.push_back(failure);
    }

    /// Delay every submission by `delay` before responding.
    pub fn set_submit_delay(&self, delay: Duration) {
        self.lock().submit_delay = delay;
    }

    pub fn entity(&self, entity_id: &EntityId) -> Option<Entity> {
        self.lock().entities.get(entity_id).cloned()
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.lock().entities.values().cloned().collect()
    }

    pub fn live_feed_count(&self) -> usize {
        self.lock().feeds.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn broadcast(state: &mut SimState, event: ChangeEvent) {
    state.feeds.retain(|tx| tx.send(event.clone()).is_ok());
}

pub struct SimTransport {
    server: SimServer,
}

#[async_trait]
impl ChangeFeedTransport for SimTransport {
    async fn connect(&mut self) -> Result<Box<dyn FeedConnection>> {
        let mut state = self.server.lock();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(Error::Transport("sim: connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.feeds.push(tx);
        Ok(Box::new(SimConnection { rx }))
    }
}

struct SimConnection {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[async_trait]
impl FeedConnection for SimConnection {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl MutationService for SimServer {
    async fn submit(
        &self,
        entity_id: &EntityId,
        change: ProposedChange,
    ) -> Result<Option<Entity>> {
        let (delay, failure) = {
            let mut state = self.lock();
            (state.submit_delay, state.queued_failures.pop_front())
        };
        if delay > Duration::ZERO {
            sleep(delay).await;
        }
        match failure {
            Some(SimFailure::Transport) => {
                return Err(Error::Transport("sim: injected transport failure".to_string()));
            }
            Some(SimFailure::Rejected) => {
                return Err(Error::Rejected("sim: injected rejection".to_string()));
            }
            Some(SimFailure::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        let mut state = self.lock();
        match change {
            ProposedChange::MoveStatus { target } => {
                let Some(entity) = state.entities.get_mut(entity_id) else {
                    return Err(Error::Rejected(format!("entity {entity_id} no longer exists")));
                };
                if !self.board.is_valid_status(entity.team, &target) {
                    return Err(Error::Rejected(format!(
                        "status '{target}' not allowed on the {} board",
                        entity.team
                    )));
                }
                entity.status = target;
                entity.updated_at = Utc::now();
                let canonical = entity.clone();
                broadcast(&mut state, ChangeEvent::update(canonical.clone()));
                Ok(Some(canonical))
            }
            ProposedChange::Create {
                team,
                status,
                fields,
            } => {
                // retried creates must not double-insert
                if let Some(existing) = state.entities.get(entity_id) {
                    return Ok(Some(existing.clone()));
                }
                if !self.board.is_valid_status(team, &status) {
                    return Err(Error::Rejected(format!(
                        "status '{status}' not allowed on the {team} board"
                    )));
                }
                let mut entity = Entity::new(team, status, fields.title.trim());
                entity.id = entity_id.clone();
                entity.body = fields.body;
                entity.assignee_id = fields.assignee_id;
                entity.due_at = fields.due_at;
                if let Some(priority) = fields.priority {
                    // server-side normalization the client cannot predict
                    entity.priority = priority.to_uppercase();
                }
                state.entities.insert(entity.id.clone(), entity.clone());
                broadcast(&mut state, ChangeEvent::insert(entity.clone()));
                Ok(Some(entity))
            }
            ProposedChange::Delete => {
                if state.entities.remove(entity_id).is_some() {
                    broadcast(&mut state, ChangeEvent::delete(entity_id.clone()));
                }
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ResyncService for SimServer {
    async fn fetch_all(&self) -> Result<Vec<Entity>> {
        Ok(self.entities())
    }

    async fn fetch_one(&self, entity_id: &EntityId) -> Result<Option<Entity>> {
        Ok(self.entity(entity_id))
    }
}
