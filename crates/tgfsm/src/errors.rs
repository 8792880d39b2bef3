use std::time::Duration;

use teloxide::types::UserId;
use thiserror::Error;

/// Centralized error types for the dispatcher.
///
/// Construction and lifecycle failures are returned synchronously to the
/// caller; per-update failures never surface here (they are logged at the
/// call site and the loop moves on). The only error the running loop itself
/// produces is [`FsmError::Transport`].
#[derive(Error, Debug)]
pub enum FsmError {
    /// Bot token was empty at construction
    #[error("bot token must not be empty")]
    InvalidToken,

    /// Session expiration must be a positive duration
    #[error("session expiration must be positive, got {0:?}")]
    InvalidExpiration(Duration),

    /// Session sweep interval must be a positive duration
    #[error("cleanup interval must be positive, got {0:?}")]
    InvalidCleanupInterval(Duration),

    /// Referenced state is not present in the current registry generation
    #[error("unknown state: {0:?}")]
    UnknownState(String),

    /// The user has no live session entry
    #[error("no active state for user {0}")]
    NoActiveState(UserId),

    /// Two states with the same name were passed to one registry build
    #[error("duplicate state name: {0:?}")]
    DuplicateState(String),

    /// Two triggers normalized to the same key within one state
    #[error("duplicate {kind} trigger {key:?} in state {state:?}")]
    DuplicateTrigger {
        state: String,
        kind: &'static str,
        key: String,
    },

    /// `start` while the loop already holds the run flag, or a
    /// frozen-after-start mutation attempted while running
    #[error("dispatcher is already running")]
    AlreadyRunning,

    /// `stop` without a preceding successful `start`
    #[error("dispatcher is not running")]
    NotRunning,

    /// The update transport itself failed; fatal to the dispatch loop
    #[error("transport error: {0}")]
    Transport(String),
}

/// Type alias for Result with FsmError
pub type FsmResult<T> = Result<T, FsmError>;

/// Error type for handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;
