//! `boardsync check-config` - validate configuration.

use std::path::PathBuf;

use crate::config::Config;
use crate::error::Result;
use crate::output::{emit_success, HumanOutput, OutputOptions};

pub fn run(config_path: Option<&PathBuf>, options: OutputOptions) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    config.validate()?;

    let mut human = HumanOutput::new("Configuration is valid");
    match config_path {
        Some(path) => human.push_summary("source", path.display().to_string()),
        None => human.push_summary("source", "built-in defaults"),
    }
    human.push_summary(
        "feed backoff",
        format!(
            "{}ms..{}ms x{}",
            config.feed.initial_backoff_ms, config.feed.max_backoff_ms, config.feed.backoff_multiplier
        ),
    );
    human.push_summary(
        "submit timeout",
        format!("{}ms", config.mutation.submit_timeout_ms),
    );
    human.push_summary(
        "aggregate debounce",
        format!("{}ms", config.aggregate.debounce_ms),
    );
    human.push_summary(
        "platform statuses",
        config.board.platform_statuses.join(", "),
    );
    human.push_summary("product statuses", config.board.product_statuses.join(", "));

    emit_success(options, "check-config", &config, Some(&human))
}
