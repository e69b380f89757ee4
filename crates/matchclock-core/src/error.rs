//! Error types for matchclock

use thiserror::Error;

/// Core matchclock errors
///
/// None of these are fatal to a client: every failure degrades to showing
/// the last-known-good local state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchclockError {
    // Store errors
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    // Lease errors
    #[error("Permission denied: client is not the active controller")]
    PermissionDenied,

    // Reconciliation errors
    #[error("Stale update discarded: incoming stamp {incoming} <= held stamp {held}")]
    StaleUpdateDiscarded { incoming: i64, held: i64 },

    // Command errors
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for MatchclockError {
    fn from(err: std::io::Error) -> Self {
        MatchclockError::Io(err.to_string())
    }
}

/// Result type for matchclock operations
pub type MatchclockResult<T> = Result<T, MatchclockError>;
