//! Update Collection Module
//!
//! Gathers worker updates for one round at a time:
//! - Round, roster and shape validation per submission
//! - Idempotent handling of duplicate submissions
//! - Quorum wait with a single timeout boundary

pub mod collector;

pub use collector::{CollectedRound, Rejection, RejectionReason, SubmitOutcome, UpdateCollector};
