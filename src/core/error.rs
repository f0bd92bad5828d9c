//! Error types for fedguard.

use crate::core::types::{RoundNumber, WorkerId};
use thiserror::Error;

/// Result type alias for fedguard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running training rounds.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Per-update rejections
    #[error("Stale update from {worker_id}: computed for round {update_round}, collecting round {expected_round}")]
    StaleUpdate {
        worker_id: WorkerId,
        update_round: RoundNumber,
        expected_round: RoundNumber,
    },

    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Shape mismatch from {worker_id}: {detail}")]
    ShapeMismatch { worker_id: WorkerId, detail: String },

    #[error("Collector is not accepting updates: {0}")]
    CollectorClosed(String),

    // Per-round failures
    #[error("No updates to aggregate")]
    EmptyUpdateSet,

    #[error("Quorum not met in round {round}: {received}/{required} valid updates")]
    QuorumNotMet {
        round: RoundNumber,
        received: usize,
        required: usize,
    },

    #[error("All {0} updates were flagged as anomalous")]
    AllWorkersFlagged(usize),

    // Orchestration errors
    #[error("Invalid round transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Session terminated in round {round}: {cause}")]
    SessionTerminated { round: RoundNumber, cause: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Collaborator errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Rejections of a single submission. The round carries on without it.
    pub fn is_update_rejection(&self) -> bool {
        matches!(
            self,
            Error::StaleUpdate { .. }
                | Error::UnknownWorker(_)
                | Error::ShapeMismatch { .. }
                | Error::CollectorClosed(_)
        )
    }

    /// Failures of a whole round attempt, subject to the retry policy.
    pub fn is_round_failure(&self) -> bool {
        matches!(
            self,
            Error::EmptyUpdateSet | Error::QuorumNotMet { .. } | Error::Transport(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}
