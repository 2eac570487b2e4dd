//! boardsync - Board Synchronization Library
//!
//! This library keeps a local, mutable snapshot of a shared task board
//! consistent with a remote source of truth while multiple actors mutate
//! the board concurrently.
//!
//! # Core Concepts
//!
//! - **Change feed**: a durable subscription with reconnect backoff and
//!   gap signaling (the feed has no replay capability)
//! - **Entity cache**: the single mutable source of UI truth; remote
//!   events and optimistic local mutations both land here
//! - **Optimistic mutations**: apply now, confirm later, roll back on
//!   failure; at most one pending operation per entity
//! - **Permission view**: per-actor visibility and legal-transition checks
//! - **Aggregates**: derived board statistics, debounced during bursts
//!
//! # Module Organization
//!
//! - `cli`: command-line interface using clap
//! - `config`: configuration loading from `boardsync.toml`
//! - `error`: error types and result aliases
//! - `model`: entities, change events, actors, proposed changes
//! - `feed`: change feed client and its connection state machine
//! - `cache`: entity cache with pending-operation gating
//! - `mutation`: submission policy and the operation log
//! - `permission`: per-actor read/write filtering
//! - `aggregate`: derived statistics and the recompute debounce
//! - `engine`: the assembled engine and its handle
//! - `sim`: in-memory backend for tests and the demo CLI
//! - `output`: CLI output formatting

pub mod aggregate;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod model;
pub mod mutation;
pub mod output;
pub mod permission;
pub mod sim;

pub use error::{Error, Result};
