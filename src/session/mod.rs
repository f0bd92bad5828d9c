//! Session Module
//!
//! Top-level training driver:
//! - Configuration (roster, quorum, budget, strategy, update mode)
//! - Worker transport and validation seams
//! - Convergence tracking
//! - `TrainingSession` running rounds to termination

pub mod config;
pub mod convergence;
pub mod training;
pub mod transport;

pub use config::{SessionConfig, UpdateMode};
pub use convergence::{ConvergencePoint, ConvergenceTracker};
pub use training::{TrainingSession, TrainingSummary};
pub use transport::{LoopbackTransport, ValidationOracle, WorkerTransport};
