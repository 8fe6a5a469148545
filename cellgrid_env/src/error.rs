//! Error types for the CellGrid environment abstraction.

use thiserror::Error;

/// Errors that can occur at the simulation engine boundary.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Engine could not be reached (connection refused, DNS, closed channel)
    #[error("Engine unreachable: {0}")]
    Unreachable(String),

    /// Engine answered with a non-success status
    #[error("Engine returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// Engine response could not be decoded into the expected shape
    #[error("Malformed engine response: {0}")]
    Malformed(String),

    /// Request payload could not be encoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates an unreachable error.
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    /// Creates a malformed-response error.
    pub fn malformed(msg: impl std::fmt::Display) -> Self {
        Self::Malformed(msg.to_string())
    }
}
