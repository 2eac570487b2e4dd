//! Data model for the board synchronization core.
//!
//! Entities are task snapshots owned by the cache; change events are the
//! wire form of remote mutations; actors carry the permission inputs
//! supplied by the session layer.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

pub const DEFAULT_PRIORITY: &str = "P2";
pub const PRIORITIES: [&str; 5] = ["P0", "P1", "P2", "P3", "P4"];

/// Stable opaque identifier of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn generate() -> Self {
        Self(format!("task-{}", Ulid::new().to_string().to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of one optimistic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Closed set of teams. Every entity belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    Platform,
    Product,
}

impl Team {
    pub const ALL: [Team; 2] = [Team::Platform, Team::Product];

    pub fn as_str(&self) -> &'static str {
        match self {
            Team::Platform => "platform",
            Team::Product => "product",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "platform" => Some(Team::Platform),
            "product" => Some(Team::Product),
            _ => None,
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task snapshot as held by the cache and shipped over the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub team: Team,
    pub status: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub priority: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(team: Team, status: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::generate(),
            team,
            status: status.into(),
            title: title.into(),
            body: None,
            priority: DEFAULT_PRIORITY.to_string(),
            assignee_id: None,
            due_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = EntityId(id.into());
        self
    }

    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

pub fn priority_rank(priority: &str) -> usize {
    let trimmed = priority.trim();
    PRIORITIES
        .iter()
        .position(|entry| entry.eq_ignore_ascii_case(trimmed))
        .unwrap_or(PRIORITIES.len())
}

/// Kind of remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One remote mutation as delivered by the change feed.
///
/// Events for the same entity arrive in commit order; events for different
/// entities carry no relative ordering guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: String,
    pub kind: ChangeKind,
    pub entity_id: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Entity>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    fn new(kind: ChangeKind, entity_id: EntityId, snapshot: Option<Entity>) -> Self {
        Self {
            event_id: Ulid::new().to_string(),
            kind,
            entity_id,
            snapshot,
            timestamp: Utc::now(),
        }
    }

    pub fn insert(snapshot: Entity) -> Self {
        Self::new(ChangeKind::Insert, snapshot.id.clone(), Some(snapshot))
    }

    pub fn update(snapshot: Entity) -> Self {
        Self::new(ChangeKind::Update, snapshot.id.clone(), Some(snapshot))
    }

    pub fn delete(entity_id: EntityId) -> Self {
        Self::new(ChangeKind::Delete, entity_id, None)
    }
}

/// Actor role as issued by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Employee,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "employee" => Some(Role::Employee),
            _ => None,
        }
    }
}

/// The authenticated user on whose behalf the engine runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
    pub team: Team,
    pub allowed_statuses: HashSet<String>,
}

impl Actor {
    pub fn admin(id: impl Into<String>, team: Team) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
            team,
            allowed_statuses: HashSet::new(),
        }
    }

    pub fn with_role(
        id: impl Into<String>,
        role: Role,
        team: Team,
        allowed_statuses: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            team,
            allowed_statuses: allowed_statuses.into_iter().collect(),
        }
    }
}

/// Fields for a locally created entity, before the server normalizes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEntityFields {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
}

/// The wire form of a local intent handed to the mutation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProposedChange {
    MoveStatus { target: String },
    Create { team: Team, status: String, fields: NewEntityFields },
    Delete,
}
