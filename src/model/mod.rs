//! Model Data Module
//!
//! Opaque parameter containers exchanged between master and workers:
//! - Named parameter tensors and shape signatures
//! - Global model snapshots with content digests
//! - Per-round worker updates

pub mod state;
pub mod tensor;

pub use state::{GlobalModelState, WorkerUpdate};
pub use tensor::{ParameterSet, ParameterTensor, ShapeSignature};
