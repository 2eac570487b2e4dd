//! In-memory entity cache.
//!
//! The cache is the single mutable source of UI truth. Remote change events
//! and local optimistic mutations both land here; a pending local operation
//! gates remote application for its entity until it resolves, so a stale
//! server view never clobbers an in-flight local change.
//!
//! Invariants:
//! - At most one pending operation per entity.
//! - A remote event arriving during the pending window is buffered
//!   (last-writer-wins by feed order) and replayed at commit/rollback.
//!   A row buffered by a resync replays only on rollback; it predates a
//!   successful commit's canonical result.
//! - All operations are synchronous; callers never observe a partially
//!   applied batch.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{ChangeEvent, ChangeKind, Entity, EntityId, OperationId};

/// What `apply_remote` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Applied to the visible state immediately.
    Applied,
    /// Held back behind a pending local operation.
    Buffered,
}

/// A remote event held back behind a pending operation.
#[derive(Debug, Clone)]
pub struct BufferedRemote {
    pub event: ChangeEvent,
    /// Synthesized from a resync snapshot rather than received from the
    /// feed. A resync row predates the pending submission's outcome, so it
    /// must not replay over a successful commit's canonical result.
    pub from_resync: bool,
}

/// Bookkeeping for one in-flight optimistic operation.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub operation_id: OperationId,
    pub entity_id: EntityId,
    /// Visible snapshot before the local change (absent for creates).
    pub prior: Option<Entity>,
    /// Locally proposed snapshot (absent for deletes).
    pub proposed: Option<Entity>,
    /// Last remote event received while pending, if any.
    pub buffered_remote: Option<BufferedRemote>,
}

#[derive(Debug, Default)]
pub struct EntityCache {
    entities: HashMap<EntityId, Entity>,
    pending: HashMap<EntityId, PendingOp>,
    by_operation: HashMap<OperationId, EntityId>,
    version: u64,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a remote change event; buffered when the entity has an
    /// unresolved local operation.
    pub fn apply_remote(&mut self, event: ChangeEvent) -> RemoteOutcome {
        if let Some(op) = self.pending.get_mut(&event.entity_id) {
            // Only the latest event matters: the feed is ordered per entity.
            op.buffered_remote = Some(BufferedRemote {
                event,
                from_resync: false,
            });
            return RemoteOutcome::Buffered;
        }

        self.apply_event(event);
        self.version += 1;
        RemoteOutcome::Applied
    }

    /// Apply a local optimistic change, recording the prior snapshot for
    /// rollback. `proposed` of `None` is an optimistic delete.
    pub fn apply_local(
        &mut self,
        operation_id: OperationId,
        entity_id: EntityId,
        proposed: Option<Entity>,
    ) -> Result<()> {
        if self.pending.contains_key(&entity_id) {
            return Err(Error::EntityBusy(entity_id.to_string()));
        }

        let prior = self.entities.get(&entity_id).cloned();
        match &proposed {
            Some(entity) => {
                self.entities.insert(entity_id.clone(), entity.clone());
            }
            None => {
                self.entities.remove(&entity_id);
            }
        }

        self.by_operation.insert(operation_id, entity_id.clone());
        self.pending.insert(
            entity_id.clone(),
            PendingOp {
                operation_id,
                entity_id,
                prior,
                proposed,
                buffered_remote: None,
            },
        );
        self.version += 1;
        Ok(())
    }

    /// Resolve a pending operation with the server's canonical result, then
    /// replay any feed event buffered during the pending window. A row
    /// buffered by a resync is discarded here: it predates the commit, and
    /// the canonical result is the newer truth.
    pub fn commit(&mut self, operation_id: OperationId, canonical: Option<Entity>) -> Result<()> {
        let op = self.take_pending(operation_id)?;

        match canonical {
            Some(entity) => {
                self.entities.insert(op.entity_id.clone(), entity);
            }
            None => {
                self.entities.remove(&op.entity_id);
            }
        }

        if let Some(buffered) = op.buffered_remote {
            if !buffered.from_resync {
                self.apply_event(buffered.event);
            }
        }
        self.version += 1;
        Ok(())
    }

    /// Restore the prior snapshot, then replay any buffered remote event.
    /// Here the resync row replays too: with the local change undone, the
    /// authoritative snapshot is the best available state.
    pub fn rollback(&mut self, operation_id: OperationId) -> Result<()> {
        let op = self.take_pending(operation_id)?;

        match op.prior {
            Some(entity) => {
                self.entities.insert(op.entity_id.clone(), entity);
            }
            None => {
                self.entities.remove(&op.entity_id);
            }
        }

        if let Some(buffered) = op.buffered_remote {
            self.apply_event(buffered.event);
        }
        self.version += 1;
        Ok(())
    }

    /// Replace the non-pending portion of the cache with the authoritative
    /// entity set. Entities with a pending operation keep their optimistic
    /// view; the authoritative row (or its absence) is recorded as a
    /// buffered remote event so it is honored on rollback.
    pub fn resync(&mut self, authoritative: Vec<Entity>) {
        let mut next: HashMap<EntityId, Entity> = authoritative
            .into_iter()
            .map(|entity| (entity.id.clone(), entity))
            .collect();

        for (entity_id, op) in &mut self.pending {
            let server_row = next.remove(entity_id);
            let event = match server_row {
                Some(row) => ChangeEvent::update(row),
                None => ChangeEvent::delete(entity_id.clone()),
            };
            op.buffered_remote = Some(BufferedRemote {
                event,
                from_resync: true,
            });
            if let Some(view) = self.entities.get(entity_id) {
                next.insert(entity_id.clone(), view.clone());
            }
        }

        self.entities = next;
        self.version += 1;
    }

    /// Immutable point-in-time view of the cache contents.
    pub fn snapshot(&self) -> Vec<Entity> {
        self.entities.values().cloned().collect()
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<&Entity> {
        self.entities.get(entity_id)
    }

    pub fn has_pending(&self, entity_id: &EntityId) -> bool {
        self.pending.contains_key(entity_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Monotonic counter bumped on every visible change.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn apply_event(&mut self, event: ChangeEvent) {
        match event.kind {
            ChangeKind::Delete => {
                self.entities.remove(&event.entity_id);
            }
            ChangeKind::Insert | ChangeKind::Update => match event.snapshot {
                Some(entity) => {
                    self.entities.insert(event.entity_id, entity);
                }
                None => {
                    warn!(
                        entity_id = %event.entity_id,
                        "dropping malformed change event without snapshot"
                    );
                }
            },
        }
    }

    fn take_pending(&mut self, operation_id: OperationId) -> Result<PendingOp> {
        let entity_id = self
            .by_operation
            .remove(&operation_id)
            .ok_or_else(|| Error::OperationFailed(format!("unknown operation {operation_id}")))?;
        self.pending
            .remove(&entity_id)
            .ok_or_else(|| Error::OperationFailed(format!("missing pending op for {entity_id}")))
    }
}
