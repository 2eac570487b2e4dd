//! Error types for boardsync
//!
//! Exit codes for the CLI:
//! - 0: Success
//! - 2: User error (bad args, invalid config, unknown entity)
//! - 3: Blocked by policy (permission denied, entity busy)
//! - 4: Operation failed (transport, timeout, server rejection)

use thiserror::Error;

/// Exit codes for the boardsync CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const POLICY_BLOCKED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for boardsync operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Status '{status}' is not valid for team {team}")]
    UnknownStatus { team: String, status: String },

    // Policy blocks (exit code 3)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Entity {0} has an unresolved local change")]
    EntityBusy(String),

    // Operation failures (exit code 4)
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Mutation submission timed out after {0}ms")]
    SubmitTimeout(u64),

    #[error("Server rejected mutation: {0}")]
    Rejected(String),

    #[error("Sync engine is not running")]
    EngineStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::UnknownEntity(_)
            | Error::UnknownStatus { .. } => exit_codes::USER_ERROR,

            // Policy blocks
            Error::PermissionDenied(_) | Error::EntityBusy(_) => exit_codes::POLICY_BLOCKED,

            // Operation failures
            Error::Transport(_)
            | Error::SubmitTimeout(_)
            | Error::Rejected(_)
            | Error::EngineStopped
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// True for failures worth retrying with backoff (network-class only).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// Result type alias for boardsync operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_group_by_class() {
        assert_eq!(
            Error::InvalidArgument("x".into()).exit_code(),
            exit_codes::USER_ERROR
        );
        assert_eq!(
            Error::PermissionDenied("x".into()).exit_code(),
            exit_codes::POLICY_BLOCKED
        );
        assert_eq!(
            Error::EntityBusy("t-1".into()).exit_code(),
            exit_codes::POLICY_BLOCKED
        );
        assert_eq!(
            Error::Transport("refused".into()).exit_code(),
            exit_codes::OPERATION_FAILED
        );
        assert_eq!(
            Error::SubmitTimeout(5000).exit_code(),
            exit_codes::OPERATION_FAILED
        );
    }

    #[test]
    fn only_transport_is_transient() {
        assert!(Error::Transport("reset".into()).is_transient());
        assert!(!Error::Rejected("conflict".into()).is_transient());
        assert!(!Error::SubmitTimeout(100).is_transient());
    }
}
