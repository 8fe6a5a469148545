//! Error types for turn orchestration.

use cellgrid_env::EnvError;
use thiserror::Error;

/// Result type for orchestration operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors returned by the turn controller.
///
/// Every variant is scoped to the single operation that produced it; none of
/// them stop the running session.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed request: missing name, non-positive config value, foreign move
    #[error("Validation error: {0}")]
    Validation(String),

    /// Submission targeted a turn that is not the open one
    #[error("Stale turn: current turn is {current_turn}")]
    StaleTurn { current_turn: u64 },

    /// Submission from a name outside the frozen roster
    #[error("Unknown player: {0}")]
    UnknownPlayer(String),

    /// Simulation engine unreachable or answered garbage
    #[error("Upstream error: {0}")]
    Upstream(#[from] EnvError),

    /// Operation needs a running game
    #[error("No game is running")]
    NotRunning,

    /// `begin` called while a game is starting or running
    #[error("A game is already running")]
    AlreadyRunning,
}

impl OrchestratorError {
    /// Creates a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Returns true if the caller should re-poll state and retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StaleTurn { .. })
    }
}
