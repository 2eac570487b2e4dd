//! Command-line interface for boardsync
//!
//! This module defines the CLI structure using clap derive macros.
//! Each subcommand is defined in its own submodule.

use clap::{Parser, Subcommand};

use crate::error::Result;
use crate::output::OutputOptions;

mod check;
mod demo;

/// boardsync - board synchronization engine
///
/// A client-side engine that keeps a local snapshot of a shared task board
/// consistent with a remote source of truth: change feed subscription,
/// optimistic mutations with rollback, permission filtering, and derived
/// board statistics.
#[derive(Parser, Debug)]
#[command(name = "boardsync")]
#[command(author, version, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file (defaults to built-in settings)
    #[arg(long, global = true, env = "BOARDSYNC_CONFIG")]
    pub config: Option<std::path::PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and print the effective settings
    CheckConfig,

    /// Run a scripted engine session against the in-memory backend
    Demo {
        /// Actor identity for the session
        #[arg(long, default_value = "demo-admin", env = "BOARDSYNC_ACTOR")]
        actor: String,

        /// Actor role: admin, manager, employee
        #[arg(long, default_value = "admin")]
        role: String,

        /// Actor team: platform, product
        #[arg(long, default_value = "platform")]
        team: String,

        /// Allowed statuses for non-admin actors (repeatable)
        #[arg(long = "allow")]
        allowed: Vec<String>,
    },
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let options = OutputOptions {
            json: self.json,
            quiet: self.quiet,
        };

        match self.command {
            Commands::CheckConfig => check::run(self.config.as_ref(), options),
            Commands::Demo {
                actor,
                role,
                team,
                allowed,
            } => demo::run(self.config.as_ref(), options, &actor, &role, &team, allowed),
        }
    }
}
