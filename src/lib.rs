//! # FedGuard - Byzantine-robust federated training rounds
//!
//! A master-side orchestrator for synchronous federated training:
//! - **Collector**: gathers per-round worker updates under a deadline
//! - **Aggregation**: Mean, CoordinateMedian and a trust-weighted AdaptiveFilter
//! - **Round**: phase state machine, retries and an append-only round log
//! - **Session**: configuration, transport seams and convergence
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fedguard::model::{ParameterSet, WorkerUpdate};
//! use fedguard::session::{LoopbackTransport, SessionConfig, TrainingSession};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SessionConfig::with_workers(2).with_max_rounds(3);
//!     let transport = config.workers.iter().fold(LoopbackTransport::new(), |t, id| {
//!         t.with_worker(id, Duration::from_millis(5), |id, round, state| {
//!             Some(WorkerUpdate::new(id, round, state.parameters.clone()))
//!         })
//!     });
//!
//!     let mut session = TrainingSession::new(
//!         config,
//!         ParameterSet::from_vector(vec![0.0; 4]),
//!         Arc::new(transport),
//!     )
//!     .unwrap();
//!     let summary = session.fit().await.unwrap();
//!     println!("Stopped after round {}: {}", summary.final_round, summary.reason);
//! }
//! ```

pub mod aggregation;
pub mod collector;
pub mod core;
pub mod model;
pub mod monitoring;
pub mod round;
pub mod session;

pub use aggregation::{AggregationStrategy, Aggregator, AggregatorKind};
pub use core::error::{Error, Result};
pub use session::{SessionConfig, TrainingSession};
