//! Derived board statistics.
//!
//! An aggregate snapshot is a pure fold over the currently visible entity
//! set. It is recomputed, never edited: immediately after remote event
//! application and commit/rollback, and once (trailing edge) after a burst
//! of local drag activity ends.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::config::BoardConfig;
use crate::model::{Entity, Team};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCount {
    pub team: Team,
    pub status: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamCompletion {
    pub team: Team,
    pub total: usize,
    pub done: usize,
    pub completion_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub status_counts: Vec<StatusCount>,
    pub team_completion: Vec<TeamCompletion>,
    pub overdue: usize,
}

impl AggregateSnapshot {
    pub fn empty() -> Self {
        Self {
            generated_at: Utc::now(),
            total: 0,
            status_counts: Vec::new(),
            team_completion: Vec::new(),
            overdue: 0,
        }
    }

    pub fn count_for(&self, team: Team, status: &str) -> usize {
        self.status_counts
            .iter()
            .find(|entry| entry.team == team && entry.status == status)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    pub fn completion_for(&self, team: Team) -> Option<&TeamCompletion> {
        self.team_completion.iter().find(|entry| entry.team == team)
    }
}

/// Recompute the aggregate from the given entities.
///
/// Overdue means the due date has passed and the status is not terminal for
/// the entity's team.
pub fn compute(entities: &[Entity], board: &BoardConfig, now: DateTime<Utc>) -> AggregateSnapshot {
    let mut counts: BTreeMap<(Team, String), usize> = BTreeMap::new();
    for team in Team::ALL {
        for status in board.status_universe(team) {
            counts.insert((team, status.clone()), 0);
        }
    }

    let mut overdue = 0usize;
    let mut totals: BTreeMap<Team, (usize, usize)> = BTreeMap::new();

    for entity in entities {
        *counts.entry((entity.team, entity.status.clone())).or_insert(0) += 1;

        let (total, done) = totals.entry(entity.team).or_insert((0, 0));
        *total += 1;
        if board.is_terminal(&entity.status) {
            *done += 1;
        } else if entity.due_at.is_some_and(|due| due < now) {
            overdue += 1;
        }
    }

    let status_counts = counts
        .into_iter()
        .map(|((team, status), count)| StatusCount {
            team,
            status,
            count,
        })
        .collect();

    let team_completion = totals
        .into_iter()
        .map(|(team, (total, done))| TeamCompletion {
            team,
            total,
            done,
            completion_ratio: if total == 0 {
                0.0
            } else {
                done as f64 / total as f64
            },
        })
        .collect();

    AggregateSnapshot {
        generated_at: now,
        total: entities.len(),
        status_counts,
        team_completion,
        overdue,
    }
}

/// Trailing-edge debounce for recomputation during local bursts.
///
/// Each local mutation re-arms the deadline; the engine sleeps until the
/// deadline and recomputes once after the burst ends.
#[derive(Debug)]
pub struct Debounce {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            deadline: None,
        }
    }

    /// Arm (or re-arm) the timer relative to `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    /// Deadline to sleep until, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the deadline once it fires.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }
}
