//! Round Module
//!
//! Round lifecycle for federated training:
//! - Phase state machine with explicit legal transitions
//! - Controller running broadcast, collection, aggregation and evaluation
//! - Append-only round records

pub mod controller;
pub mod record;
pub mod state;

pub use controller::{ControllerStats, RoundController};
pub use record::{RecordId, RoundLog, RoundOutcome, RoundRecord};
pub use state::{RoundPhase, RoundStateMachine, TerminationReason};
