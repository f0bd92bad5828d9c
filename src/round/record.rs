//! Append-only audit trail of round attempts.

use crate::aggregation::AggregatorKind;
use crate::collector::Rejection;
use crate::core::{now, Hash256, Result, RoundNumber, Timestamp, WorkerId};
use serde::{Deserialize, Serialize};

/// Unique record identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    /// Generate a unique ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the ID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a round attempt ended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RoundOutcome {
    /// Global state replaced; digest of the new state
    Completed { state_digest: Hash256 },
    /// Attempt abandoned; global state untouched
    Failed { cause: String },
}

/// One round attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Record ID
    pub id: RecordId,
    /// Round number
    pub round: RoundNumber,
    /// Attempt within the round, starting at 1
    pub attempt: u32,
    /// Strategy in use
    pub strategy: AggregatorKind,
    /// Workers with an accepted update
    pub received: Vec<WorkerId>,
    /// Expected workers without an accepted update
    pub missing: Vec<WorkerId>,
    /// Rejected submissions
    pub rejections: Vec<Rejection>,
    /// Workers flagged during aggregation
    pub flagged: Vec<WorkerId>,
    /// Workers excluded from aggregation
    pub excluded: Vec<WorkerId>,
    /// Whether the adaptive filter fell back to plain mean
    pub fell_back_to_mean: bool,
    /// Validation metric of the new state
    pub validation_metric: Option<f64>,
    /// Result of the attempt
    pub outcome: RoundOutcome,
    /// Attempt start
    pub started_at: Timestamp,
    /// Attempt end
    pub completed_at: Timestamp,
}

impl RoundRecord {
    /// Start a record for an attempt; outcome defaults to failed until completed.
    pub fn begin(round: RoundNumber, attempt: u32, strategy: AggregatorKind) -> Self {
        let started_at = now();
        Self {
            id: RecordId::generate(),
            round,
            attempt,
            strategy,
            received: Vec::new(),
            missing: Vec::new(),
            rejections: Vec::new(),
            flagged: Vec::new(),
            excluded: Vec::new(),
            fell_back_to_mean: false,
            validation_metric: None,
            outcome: RoundOutcome::Failed {
                cause: "incomplete".to_string(),
            },
            started_at,
            completed_at: started_at,
        }
    }

    /// Finish as completed.
    pub fn completed(mut self, state_digest: Hash256) -> Self {
        self.outcome = RoundOutcome::Completed { state_digest };
        self.completed_at = now();
        self
    }

    /// Finish as failed.
    pub fn failed(mut self, cause: &str) -> Self {
        self.outcome = RoundOutcome::Failed {
            cause: cause.to_string(),
        };
        self.completed_at = now();
        self
    }

    /// Whether the attempt completed.
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, RoundOutcome::Completed { .. })
    }
}

/// Append-only log of round records.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoundLog {
    records: Vec<RoundRecord>,
}

impl RoundLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn append(&mut self, record: RoundRecord) {
        self.records.push(record);
    }

    /// All records in order.
    pub fn records(&self) -> &[RoundRecord] {
        &self.records
    }

    /// Records of one round (all attempts).
    pub fn for_round(&self, round: RoundNumber) -> Vec<&RoundRecord> {
        self.records.iter().filter(|r| r.round == round).collect()
    }

    /// Most recent record.
    pub fn last(&self) -> Option<&RoundRecord> {
        self.records.last()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of completed attempts.
    pub fn completed_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_completed()).count()
    }

    /// Export as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.records)?)
    }
}
