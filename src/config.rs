//! Configuration loading and management
//!
//! Handles parsing of `boardsync.toml` configuration files.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::Team;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Change feed reconnect configuration
    #[serde(default)]
    pub feed: FeedConfig,

    /// Mutation submission configuration
    #[serde(default)]
    pub mutation: MutationConfig,

    /// Aggregate recomputation configuration
    #[serde(default)]
    pub aggregate: AggregateConfig,

    /// Board shape (status universes per team)
    #[serde(default)]
    pub board: BoardConfig,
}

/// Reconnect backoff for the change feed subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// First reconnect delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the reconnect delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor applied after each failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Bounded wait and retry policy for mutation submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Bounded wait for one submission attempt, in milliseconds
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,

    /// Extra attempts for transient transport failures
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,

    /// Delay between transient retries, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_submit_timeout_ms() -> u64 {
    5_000
}

fn default_max_transient_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    200
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            submit_timeout_ms: default_submit_timeout_ms(),
            max_transient_retries: default_max_transient_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Debounce window for aggregate recomputation during local bursts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    /// Trailing-edge debounce window in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    250
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Status universes per team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Allowed statuses on the platform board
    #[serde(default = "default_statuses")]
    pub platform_statuses: Vec<String>,

    /// Allowed statuses on the product board
    #[serde(default = "default_statuses")]
    pub product_statuses: Vec<String>,

    /// Statuses that count as completed
    #[serde(default = "default_terminal_statuses")]
    pub terminal_statuses: Vec<String>,

    /// Status assigned to newly created entities when none is given
    #[serde(default = "default_status")]
    pub default_status: String,
}

fn default_statuses() -> Vec<String> {
    vec![
        "todo".to_string(),
        "in_progress".to_string(),
        "review".to_string(),
        "done".to_string(),
    ]
}

fn default_terminal_statuses() -> Vec<String> {
    vec!["done".to_string()]
}

fn default_status() -> String {
    "todo".to_string()
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            platform_statuses: default_statuses(),
            product_statuses: default_statuses(),
            terminal_statuses: default_terminal_statuses(),
            default_status: default_status(),
        }
    }
}

impl BoardConfig {
    /// The full status universe for one team's board.
    pub fn status_universe(&self, team: Team) -> &[String] {
        match team {
            Team::Platform => &self.platform_statuses,
            Team::Product => &self.product_statuses,
        }
    }

    pub fn is_valid_status(&self, team: Team, status: &str) -> bool {
        let trimmed = status.trim();
        self.status_universe(team)
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(trimmed))
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        let trimmed = status.trim();
        self.terminal_statuses
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(trimmed))
    }

    fn validate(&self) -> crate::error::Result<()> {
        for team in Team::ALL {
            let statuses = self.status_universe(team);
            if statuses.is_empty() {
                return Err(crate::error::Error::InvalidConfig(format!(
                    "board.{}_statuses cannot be empty",
                    team
                )));
            }
            let mut seen = HashSet::new();
            for status in statuses {
                let trimmed = status.trim();
                if trimmed.is_empty() {
                    return Err(crate::error::Error::InvalidConfig(format!(
                        "board.{}_statuses cannot include empty entries",
                        team
                    )));
                }
                if !seen.insert(trimmed.to_string()) {
                    return Err(crate::error::Error::InvalidConfig(format!(
                        "board.{}_statuses has duplicate entry '{trimmed}'",
                        team
                    )));
                }
            }
            if !self.is_valid_status(team, &self.default_status) {
                return Err(crate::error::Error::InvalidConfig(format!(
                    "board.default_status '{}' not in board.{}_statuses",
                    self.default_status, team
                )));
            }
        }

        if self.terminal_statuses.is_empty() {
            return Err(crate::error::Error::InvalidConfig(
                "board.terminal_statuses cannot be empty".to_string(),
            ));
        }
        for status in &self.terminal_statuses {
            let trimmed = status.trim();
            if trimmed.is_empty() {
                return Err(crate::error::Error::InvalidConfig(
                    "board.terminal_statuses cannot include empty entries".to_string(),
                ));
            }
            if !Team::ALL
                .iter()
                .any(|team| self.is_valid_status(*team, trimmed))
            {
                return Err(crate::error::Error::InvalidConfig(format!(
                    "board.terminal_statuses '{trimmed}' not in any team's statuses"
                )));
            }
        }

        Ok(())
    }
}

impl FeedConfig {
    fn validate(&self) -> crate::error::Result<()> {
        if self.initial_backoff_ms == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "feed.initial_backoff_ms must be > 0".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(crate::error::Error::InvalidConfig(
                "feed.max_backoff_ms must be >= feed.initial_backoff_ms".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(crate::error::Error::InvalidConfig(
                "feed.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl MutationConfig {
    fn validate(&self) -> crate::error::Result<()> {
        if self.submit_timeout_ms == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "mutation.submit_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a `boardsync.toml` file
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a path, or return defaults when absent
    pub fn load_or_default(path: Option<&PathBuf>) -> crate::error::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &PathBuf) -> crate::error::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        self.feed.validate()?;
        self.mutation.validate()?;
        self.board.validate()?;
        Ok(())
    }
}
