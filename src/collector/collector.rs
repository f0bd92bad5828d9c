//! Per-round update collection.
//!
//! Workers submit concurrently; the controller blocks only in `close`.

use crate::core::{now, Error, Result, RoundNumber, Timestamp, WorkerId};
use crate::model::{ShapeSignature, WorkerUpdate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Why a submission was rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// Tagged with another round
    Stale,
    /// Not on the round's roster
    UnknownWorker,
    /// Tensor shapes differ from the global model
    ShapeMismatch,
    /// Arrived while no round was open
    CollectorClosed,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::Stale => write!(f, "stale"),
            RejectionReason::UnknownWorker => write!(f, "unknown_worker"),
            RejectionReason::ShapeMismatch => write!(f, "shape_mismatch"),
            RejectionReason::CollectorClosed => write!(f, "collector_closed"),
        }
    }
}

/// Audit entry for a rejected submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Submitting worker
    pub worker_id: WorkerId,
    /// Round the update claimed
    pub update_round: RoundNumber,
    /// Reason category
    pub reason: RejectionReason,
    /// Full error message
    pub detail: String,
    /// When the rejection happened
    pub rejected_at: Timestamp,
}

impl Rejection {
    fn new(update: &WorkerUpdate, err: &Error) -> Self {
        let reason = match err {
            Error::StaleUpdate { .. } => RejectionReason::Stale,
            Error::UnknownWorker(_) => RejectionReason::UnknownWorker,
            Error::ShapeMismatch { .. } => RejectionReason::ShapeMismatch,
            _ => RejectionReason::CollectorClosed,
        };
        Self {
            worker_id: update.worker_id.clone(),
            update_round: update.round,
            reason,
            detail: err.to_string(),
            rejected_at: now(),
        }
    }
}

/// Result of a successful submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stored for aggregation
    Accepted,
    /// Same worker already submitted this round; ignored
    Duplicate,
}

/// Everything gathered for one round once the collector is closed.
#[derive(Clone, Debug)]
pub struct CollectedRound {
    /// Round number
    pub round: RoundNumber,
    /// Valid updates, sorted by worker id
    pub updates: Vec<WorkerUpdate>,
    /// Expected workers without a valid update
    pub missing: Vec<WorkerId>,
    /// Rejected submissions
    pub rejections: Vec<Rejection>,
    /// Whether the deadline elapsed before all workers answered
    pub timed_out: bool,
}

impl CollectedRound {
    /// Ids of workers whose update was accepted.
    pub fn received_ids(&self) -> Vec<WorkerId> {
        self.updates.iter().map(|u| u.worker_id.clone()).collect()
    }
}

#[derive(Default)]
struct CollectorState {
    round: Option<RoundNumber>,
    expected: BTreeSet<WorkerId>,
    signature: Option<ShapeSignature>,
    accepted: BTreeMap<WorkerId, WorkerUpdate>,
    /// First delivery of each expected worker this round, accepted or not
    delivered: BTreeSet<WorkerId>,
    rejections: Vec<Rejection>,
}

impl CollectorState {
    fn validate(&self, update: &WorkerUpdate) -> Result<()> {
        let expected_round = self.round.ok_or_else(|| {
            Error::CollectorClosed(format!(
                "update from {} for round {}",
                update.worker_id, update.round
            ))
        })?;

        if update.round != expected_round {
            return Err(Error::StaleUpdate {
                worker_id: update.worker_id.clone(),
                update_round: update.round,
                expected_round,
            });
        }

        if !self.expected.contains(&update.worker_id) {
            return Err(Error::UnknownWorker(update.worker_id.clone()));
        }

        Ok(())
    }

    fn check_shape(&self, update: &WorkerUpdate) -> Result<()> {
        match &self.signature {
            Some(signature) => update
                .parameters
                .conforms_to(signature)
                .map_err(|detail| Error::ShapeMismatch {
                    worker_id: update.worker_id.clone(),
                    detail,
                }),
            None => Ok(()),
        }
    }
}

/// Gathers worker updates for a single round at a time.
pub struct UpdateCollector {
    state: Mutex<CollectorState>,
    /// Number of accepted updates in the open round
    progress: watch::Sender<usize>,
}

impl UpdateCollector {
    /// Create a closed collector.
    pub fn new() -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            state: Mutex::new(CollectorState::default()),
            progress,
        }
    }

    /// Start accepting updates for `round` from `expected_workers`.
    ///
    /// Anything left over from a previous round is discarded.
    pub async fn open(
        &self,
        round: RoundNumber,
        expected_workers: impl IntoIterator<Item = WorkerId>,
        signature: ShapeSignature,
    ) {
        let mut state = self.state.lock().await;
        *state = CollectorState {
            round: Some(round),
            expected: expected_workers.into_iter().collect(),
            signature: Some(signature),
            accepted: BTreeMap::new(),
            delivered: BTreeSet::new(),
            rejections: Vec::new(),
        };
        info!(round, expected = state.expected.len(), "Collector opened");
        self.progress.send_replace(0);
    }

    /// Submit one worker update.
    ///
    /// A rejection is logged and kept for the round record; it never
    /// affects other submissions. Only the first delivery of a worker in a
    /// round counts, even when that delivery was rejected for its shape.
    pub async fn submit(&self, update: WorkerUpdate) -> Result<SubmitOutcome> {
        let mut state = self.state.lock().await;

        if let Err(err) = state.validate(&update) {
            return Err(Self::reject(&mut state, &update, err));
        }

        if !state.delivered.insert(update.worker_id.clone()) {
            debug!(
                worker = %update.worker_id,
                round = update.round,
                "Repeated delivery ignored"
            );
            return Ok(SubmitOutcome::Duplicate);
        }

        if let Err(err) = state.check_shape(&update) {
            return Err(Self::reject(&mut state, &update, err));
        }

        debug!(worker = %update.worker_id, round = update.round, "Update accepted");
        state.accepted.insert(update.worker_id.clone(), update);
        let accepted = state.accepted.len();
        drop(state);

        self.progress.send_replace(accepted);
        Ok(SubmitOutcome::Accepted)
    }

    fn reject(state: &mut CollectorState, update: &WorkerUpdate, err: Error) -> Error {
        let rejection = Rejection::new(update, &err);
        warn!(
            worker = %rejection.worker_id,
            round = rejection.update_round,
            reason = %rejection.reason,
            "Update rejected: {}",
            rejection.detail
        );
        state.rejections.push(rejection);
        err
    }

    /// Wait until every expected worker has a valid update or `timeout`
    /// elapses, then close the round and hand over what was gathered.
    pub async fn close(&self, timeout: Duration) -> Result<CollectedRound> {
        let expected = {
            let state = self.state.lock().await;
            if state.round.is_none() {
                return Err(Error::CollectorClosed("close without open round".to_string()));
            }
            state.expected.len()
        };

        let mut progress = self.progress.subscribe();
        let timed_out = tokio::time::timeout(
            timeout,
            progress.wait_for(|accepted| *accepted >= expected),
        )
        .await
        .is_err();

        let mut state = self.state.lock().await;
        let round = state
            .round
            .take()
            .ok_or_else(|| Error::CollectorClosed("closed concurrently".to_string()))?;

        let accepted = std::mem::take(&mut state.accepted);
        let missing: Vec<WorkerId> = state
            .expected
            .iter()
            .filter(|w| !accepted.contains_key(*w))
            .cloned()
            .collect();
        let rejections = std::mem::take(&mut state.rejections);
        let updates: Vec<WorkerUpdate> = accepted.into_values().collect();

        info!(
            round,
            received = updates.len(),
            missing = missing.len(),
            rejected = rejections.len(),
            timed_out,
            "Collector closed"
        );

        Ok(CollectedRound {
            round,
            updates,
            missing,
            rejections,
            timed_out,
        })
    }

    /// Round currently open, if any.
    pub async fn current_round(&self) -> Option<RoundNumber> {
        self.state.lock().await.round
    }

    /// Number of updates accepted so far in the open round.
    pub fn accepted_count(&self) -> usize {
        *self.progress.borrow()
    }
}

impl Default for UpdateCollector {
    fn default() -> Self {
        Self::new()
    }
}
