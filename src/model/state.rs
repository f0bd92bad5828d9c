//! Global model state and worker updates.

use crate::core::{now, Hash256, Result, RoundNumber, Timestamp, WorkerId};
use crate::model::tensor::{ParameterSet, ShapeSignature};
use serde::{Deserialize, Serialize};

/// The global model held by the master between rounds.
///
/// Snapshots are shared as `Arc<GlobalModelState>` and never mutated; a
/// completed round produces a new value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalModelState {
    /// Model parameters
    pub parameters: ParameterSet,
    /// Round that produced these parameters (0 for the initial model)
    pub round: RoundNumber,
    /// Last update time
    pub updated_at: Timestamp,
}

impl GlobalModelState {
    /// Initial state before any round.
    pub fn initial(parameters: ParameterSet) -> Self {
        Self {
            parameters,
            round: 0,
            updated_at: now(),
        }
    }

    /// Successor state produced by `round`.
    pub fn advance(&self, parameters: ParameterSet, round: RoundNumber) -> Self {
        Self {
            parameters,
            round,
            updated_at: now(),
        }
    }

    /// Shape every update must match.
    pub fn signature(&self) -> ShapeSignature {
        self.parameters.signature()
    }

    /// Content digest of round and parameters. Timestamps are excluded.
    pub fn digest(&self) -> Hash256 {
        let mut bytes = self.round.to_le_bytes().to_vec();
        // ParameterSet always serializes; an empty buffer only weakens the digest.
        bytes.extend(bincode::serialize(&self.parameters).unwrap_or_default());
        Hash256::digest(&bytes)
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Encode as bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from bincode.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A model update returned by one worker for one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerUpdate {
    /// Submitting worker
    pub worker_id: WorkerId,
    /// Round the update was computed for
    pub round: RoundNumber,
    /// Updated parameters (or gradients, depending on the update mode)
    pub parameters: ParameterSet,
    /// Number of local samples behind the update
    pub sample_count: Option<u64>,
    /// Submission timestamp
    pub submitted_at: Timestamp,
}

impl WorkerUpdate {
    /// Create an update without a sample count.
    pub fn new(worker_id: &str, round: RoundNumber, parameters: ParameterSet) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            round,
            parameters,
            sample_count: None,
            submitted_at: now(),
        }
    }

    /// Attach the local sample count.
    pub fn with_sample_count(mut self, samples: u64) -> Self {
        self.sample_count = Some(samples);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = GlobalModelState::initial(ParameterSet::from_vector(vec![0.0, 0.0]));
        assert_eq!(state.round, 0);
        assert_eq!(state.signature().num_elements(), 2);
    }

    #[test]
    fn test_digest_ignores_timestamp() {
        let a = GlobalModelState::initial(ParameterSet::from_vector(vec![1.0, 2.0]));
        let mut b = a.clone();
        b.updated_at = a.updated_at + chrono::Duration::seconds(5);
        assert_eq!(a.digest(), b.digest());

        let c = a.advance(a.parameters.clone(), 1);
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_export_roundtrip() {
        let state = GlobalModelState::initial(ParameterSet::from_vector(vec![0.25, -1.5]));

        let json = state.to_json().unwrap();
        assert_eq!(GlobalModelState::from_json(&json).unwrap(), state);

        let bytes = state.to_bytes().unwrap();
        assert_eq!(GlobalModelState::from_bytes(&bytes).unwrap(), state);
    }

    #[test]
    fn test_corrupt_bytes_rejected() {
        let result = GlobalModelState::from_bytes(&[1, 2, 3]);
        assert!(matches!(result, Err(crate::core::Error::SerializationError(_))));
    }

    #[test]
    fn test_worker_update_builder() {
        let update = WorkerUpdate::new("w1", 4, ParameterSet::from_vector(vec![1.0]))
            .with_sample_count(128);
        assert_eq!(update.round, 4);
        assert_eq!(update.sample_count, Some(128));
    }
}
