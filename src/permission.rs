//! Permission filtering over cache reads and local intents.
//!
//! Pure, stateless-per-call checks. Role and allowed statuses come from the
//! session layer; the engine only reads them. An actor with an empty allowed
//! set sees nothing and can move nothing, which is valid rather than an
//! error.

use crate::config::BoardConfig;
use crate::model::{Actor, Entity, Role, Team};

/// The subset of entities the actor may see.
pub fn visible_entities(actor: &Actor, entities: &[Entity]) -> Vec<Entity> {
    entities
        .iter()
        .filter(|entity| is_visible(actor, entity))
        .cloned()
        .collect()
}

fn is_visible(actor: &Actor, entity: &Entity) -> bool {
    match actor.role {
        Role::Admin => true,
        Role::Manager | Role::Employee => {
            entity.team == actor.team && allows(actor, &entity.status)
        }
    }
}

/// Whether the actor may move `entity` to `target`.
pub fn can_transition(actor: &Actor, entity: &Entity, target: &str, board: &BoardConfig) -> bool {
    if !board.is_valid_status(entity.team, target) {
        return false;
    }
    match actor.role {
        Role::Admin => true,
        Role::Manager | Role::Employee => entity.team == actor.team && allows(actor, target),
    }
}

/// Whether the actor may create a new entity in `status` on `team`'s board.
pub fn can_create_in_status(actor: &Actor, team: Team, status: &str, board: &BoardConfig) -> bool {
    if !board.is_valid_status(team, status) {
        return false;
    }
    match actor.role {
        Role::Admin => true,
        Role::Manager | Role::Employee => team == actor.team && allows(actor, status),
    }
}

/// Whether the actor may delete `entity`. Non-admins may only delete
/// entities they can see.
pub fn can_delete(actor: &Actor, entity: &Entity) -> bool {
    is_visible(actor, entity)
}

fn allows(actor: &Actor, status: &str) -> bool {
    let trimmed = status.trim();
    actor
        .allowed_statuses
        .iter()
        .any(|entry| entry.eq_ignore_ascii_case(trimmed))
}
