//! Round controller.
//!
//! Drives one round at a time through broadcast, collection, aggregation,
//! application and evaluation. Failed attempts leave the global state
//! untouched and are retried up to the configured limit.

use crate::aggregation::{Aggregator, AggregationStrategy};
use crate::collector::UpdateCollector;
use crate::core::{Error, Result, RoundNumber, WorkerId};
use crate::model::GlobalModelState;
use crate::round::record::{RoundLog, RoundRecord};
use crate::round::state::{RoundPhase, RoundStateMachine, TerminationReason};
use crate::session::{
    ConvergenceTracker, SessionConfig, UpdateMode, ValidationOracle, WorkerTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Controller statistics.
#[derive(Clone, Debug, Default)]
pub struct ControllerStats {
    pub rounds_completed: u64,
    pub rounds_failed: u64,
    pub updates_accepted: u64,
    pub updates_rejected: u64,
    pub workers_flagged: u64,
}

/// What a successful attempt produced before the stopping checks.
struct AppliedRound {
    metric: Option<f64>,
    parameter_change: f64,
}

/// Orchestrates rounds against a worker transport.
pub struct RoundController {
    roster: Vec<WorkerId>,
    quorum: usize,
    round_timeout: Duration,
    max_round_retries: u32,
    max_rounds: RoundNumber,
    update_mode: UpdateMode,
    aggregator: Aggregator,
    collector: Arc<UpdateCollector>,
    transport: Arc<dyn WorkerTransport>,
    oracle: Option<Arc<dyn ValidationOracle>>,
    machine: RoundStateMachine,
    log: RoundLog,
    stats: ControllerStats,
}

impl RoundController {
    /// Create a controller from a validated configuration.
    pub fn new(config: &SessionConfig, transport: Arc<dyn WorkerTransport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            roster: config.workers.clone(),
            quorum: config.effective_quorum(),
            round_timeout: config.round_timeout(),
            max_round_retries: config.max_round_retries,
            max_rounds: config.max_rounds,
            update_mode: config.update_mode.clone(),
            aggregator: Aggregator::from_kind(config.aggregator, &config.adaptive_filter)?,
            collector: Arc::new(UpdateCollector::new()),
            transport,
            oracle: None,
            machine: RoundStateMachine::new(),
            log: RoundLog::new(),
            stats: ControllerStats::default(),
        })
    }

    /// Attach a validation oracle.
    pub fn set_oracle(&mut self, oracle: Arc<dyn ValidationOracle>) {
        self.oracle = Some(oracle);
    }

    /// Current phase.
    pub fn phase(&self) -> &RoundPhase {
        self.machine.phase()
    }

    /// Quorum in effect.
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Round history.
    pub fn log(&self) -> &RoundLog {
        &self.log
    }

    /// Statistics.
    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Active aggregation strategy.
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Mutable access to the strategy, e.g. to reinstate workers.
    pub fn aggregator_mut(&mut self) -> &mut Aggregator {
        &mut self.aggregator
    }

    /// Shared collector that transports deliver into.
    pub fn collector(&self) -> Arc<UpdateCollector> {
        Arc::clone(&self.collector)
    }

    /// Run rounds until the session terminates.
    ///
    /// Returns the termination reason, or `SessionTerminated` when a round
    /// exhausted its retries.
    pub async fn run(
        &mut self,
        state: &mut Arc<GlobalModelState>,
        convergence: &mut ConvergenceTracker,
    ) -> Result<TerminationReason> {
        loop {
            let round = state.round + 1;
            if let Some(reason) = self.run_round(round, state, convergence).await? {
                return Ok(reason);
            }
        }
    }

    /// Run one round, retrying failed attempts.
    ///
    /// Returns `Some(reason)` when the round ended the session.
    pub async fn run_round(
        &mut self,
        round: RoundNumber,
        state: &mut Arc<GlobalModelState>,
        convergence: &mut ConvergenceTracker,
    ) -> Result<Option<TerminationReason>> {
        if let RoundPhase::Terminated(reason) = self.machine.phase() {
            return Err(Error::SessionTerminated {
                round,
                cause: reason.to_string(),
            });
        }
        if round > self.max_rounds {
            let reason = TerminationReason::BudgetExhausted;
            self.machine.transition(RoundPhase::Terminated(reason.clone()))?;
            info!(round, max_rounds = self.max_rounds, "Round budget already used up");
            return Ok(Some(reason));
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut record = RoundRecord::begin(round, attempt, self.aggregator.kind());
            info!(round, attempt, strategy = %self.aggregator.kind(), "Round started");

            match self.attempt(round, state, &mut record).await {
                Ok(applied) => {
                    self.stats.rounds_completed += 1;
                    record.validation_metric = applied.metric;
                    self.log.append(record.completed(state.digest()));

                    let reason = if convergence.observe(round, applied.metric, applied.parameter_change) {
                        Some(TerminationReason::Converged)
                    } else if round >= self.max_rounds {
                        Some(TerminationReason::BudgetExhausted)
                    } else {
                        None
                    };

                    match &reason {
                        Some(reason) => {
                            self.machine.transition(RoundPhase::Terminated(reason.clone()))?;
                            info!(round, reason = %reason, "Training terminated");
                        }
                        None => self.machine.transition(RoundPhase::Idle)?,
                    }
                    info!(
                        round,
                        metric = ?applied.metric,
                        change = applied.parameter_change,
                        "Round completed"
                    );
                    return Ok(reason);
                }
                Err(err) if err.is_round_failure() => {
                    self.stats.rounds_failed += 1;
                    self.log.append(record.failed(&err.to_string()));
                    warn!(round, attempt, error = %err, "Round attempt failed");

                    if attempt > self.max_round_retries {
                        let cause = err.to_string();
                        self.machine.transition(RoundPhase::Terminated(TerminationReason::Fatal {
                            round,
                            cause: cause.clone(),
                        }))?;
                        error!(round, attempts = attempt, cause = %cause, "Round retries exhausted");
                        return Err(Error::SessionTerminated { round, cause });
                    }
                }
                Err(err) => {
                    self.log.append(record.failed(&err.to_string()));
                    return Err(err);
                }
            }
        }
    }

    /// One attempt. On failure the machine is back in `Idle` and `state`
    /// is unchanged.
    async fn attempt(
        &mut self,
        round: RoundNumber,
        state: &mut Arc<GlobalModelState>,
        record: &mut RoundRecord,
    ) -> Result<AppliedRound> {
        self.machine.transition(RoundPhase::Broadcasting)?;
        let snapshot = Arc::clone(state);
        self.collector
            .open(round, self.roster.iter().cloned(), snapshot.signature())
            .await;

        if let Err(err) = self
            .transport
            .broadcast(round, snapshot, Arc::clone(&self.collector))
            .await
        {
            self.collector.close(Duration::ZERO).await?;
            self.machine.transition(RoundPhase::Idle)?;
            return Err(match err {
                Error::Transport(_) => err,
                other => Error::Transport(other.to_string()),
            });
        }

        self.machine.transition(RoundPhase::Collecting)?;
        let collected = self.collector.close(self.round_timeout).await?;
        record.received = collected.received_ids();
        record.missing = collected.missing.clone();
        record.rejections = collected.rejections.clone();
        self.stats.updates_accepted += collected.updates.len() as u64;
        self.stats.updates_rejected += collected.rejections.len() as u64;
        debug!(
            round,
            received = collected.updates.len(),
            missing = collected.missing.len(),
            rejected = collected.rejections.len(),
            timed_out = collected.timed_out,
            "Collection closed"
        );

        if collected.updates.len() < self.quorum {
            self.machine.transition(RoundPhase::Idle)?;
            return Err(Error::QuorumNotMet {
                round,
                received: collected.updates.len(),
                required: self.quorum,
            });
        }

        self.machine.transition(RoundPhase::Aggregating)?;
        let outcome = match self.aggregator.aggregate(&collected.updates) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.machine.transition(RoundPhase::Idle)?;
                return Err(err);
            }
        };
        record.flagged = outcome.flagged.clone();
        record.excluded = outcome.excluded.clone();
        record.fell_back_to_mean = outcome.fell_back_to_mean;
        self.stats.workers_flagged += outcome.flagged.len() as u64;
        if !outcome.flagged.is_empty() {
            info!(round, flagged = ?outcome.flagged, excluded = ?outcome.excluded, "Updates flagged");
        }

        self.machine.transition(RoundPhase::Applying)?;
        let parameters = match self.update_mode {
            UpdateMode::ModelAveraging => outcome.parameters,
            UpdateMode::GradientAveraging { learning_rate } => state
                .parameters
                .sub_scaled(&outcome.parameters, learning_rate),
        };
        let next = Arc::new(state.advance(parameters, round));
        let parameter_change = next.parameters.l2_distance(&state.parameters);
        *state = next;

        self.machine.transition(RoundPhase::Evaluating)?;
        let metric = self.evaluate(state).await;

        Ok(AppliedRound {
            metric,
            parameter_change,
        })
    }

    async fn evaluate(&self, state: &GlobalModelState) -> Option<f64> {
        let oracle = self.oracle.as_ref()?;
        match oracle.evaluate(state).await {
            Ok(metric) if metric.is_finite() => Some(metric),
            Ok(metric) => {
                warn!(round = state.round, metric, "Validation returned a non-finite metric");
                None
            }
            Err(err) => {
                warn!(round = state.round, error = %err, "Validation failed; metric skipped");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AdaptiveFilterConfig, AggregatorKind};
    use crate::model::{ParameterSet, WorkerUpdate};
    use crate::round::RoundOutcome;
    use crate::session::LoopbackTransport;
    use async_trait::async_trait;

    fn constant(value: f32) -> impl Fn(&str, RoundNumber, &GlobalModelState) -> Option<WorkerUpdate> {
        move |id, round, _| Some(WorkerUpdate::new(id, round, ParameterSet::from_vector(vec![value, value])))
    }

    fn transport(config: &SessionConfig, value: f32) -> LoopbackTransport {
        config.workers.iter().fold(LoopbackTransport::new(), |t, id| {
            t.with_worker(id, Duration::from_millis(1), constant(value))
        })
    }

    fn initial() -> Arc<GlobalModelState> {
        Arc::new(GlobalModelState::initial(ParameterSet::from_vector(vec![0.0, 0.0])))
    }

    struct FixedOracle(f64);

    #[async_trait]
    impl ValidationOracle for FixedOracle {
        async fn evaluate(&self, _state: &GlobalModelState) -> Result<f64> {
            Ok(self.0)
        }
    }

    struct BrokenOracle;

    #[async_trait]
    impl ValidationOracle for BrokenOracle {
        async fn evaluate(&self, _state: &GlobalModelState) -> Result<f64> {
            Err(Error::Validation("dataset unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_single_round() {
        let config = SessionConfig::with_workers(3).with_max_rounds(5);
        let mut controller = RoundController::new(&config, Arc::new(transport(&config, 1.0))).unwrap();
        let mut state = initial();
        let mut convergence = ConvergenceTracker::new(None);

        let reason = controller.run_round(1, &mut state, &mut convergence).await.unwrap();
        assert_eq!(reason, None);
        assert_eq!(state.round, 1);
        assert_eq!(state.parameters.flatten(), vec![1.0, 1.0]);
        assert_eq!(controller.phase(), &RoundPhase::Idle);
        assert_eq!(controller.log().completed_count(), 1);
        assert_eq!(controller.stats().updates_accepted, 3);
    }

    #[tokio::test]
    async fn test_run_until_budget() {
        let config = SessionConfig::with_workers(2).with_max_rounds(3);
        let mut controller = RoundController::new(&config, Arc::new(transport(&config, 1.0))).unwrap();
        let mut state = initial();
        let mut convergence = ConvergenceTracker::new(None);

        let reason = controller.run(&mut state, &mut convergence).await.unwrap();
        assert_eq!(reason, TerminationReason::BudgetExhausted);
        assert_eq!(state.round, 3);
        assert!(controller.phase().is_terminal());

        let err = controller.run_round(4, &mut state, &mut convergence).await.unwrap_err();
        assert!(matches!(err, Error::SessionTerminated { .. }));
    }

    #[tokio::test]
    async fn test_gradient_mode() {
        let config = SessionConfig::with_workers(2)
            .with_update_mode(UpdateMode::GradientAveraging { learning_rate: 0.5 });
        let mut controller = RoundController::new(&config, Arc::new(transport(&config, 1.0))).unwrap();
        let mut state = initial();
        let mut convergence = ConvergenceTracker::new(None);

        controller.run_round(1, &mut state, &mut convergence).await.unwrap();
        assert_eq!(state.parameters.flatten(), vec![-0.5, -0.5]);
    }

    #[tokio::test]
    async fn test_quorum_failure_retries_then_terminates() {
        let config = SessionConfig::with_workers(3)
            .with_round_timeout(Duration::from_millis(20))
            .with_max_round_retries(1);
        let silent = config.workers.iter().fold(LoopbackTransport::new(), |t, id| {
            t.with_worker(id, Duration::ZERO, |_, _, _| None)
        });
        let mut controller = RoundController::new(&config, Arc::new(silent)).unwrap();
        let mut state = initial();
        let before = state.digest();
        let mut convergence = ConvergenceTracker::new(None);

        let err = controller.run_round(1, &mut state, &mut convergence).await.unwrap_err();
        assert_eq!(
            err,
            Error::SessionTerminated {
                round: 1,
                cause: "Quorum not met in round 1: 0/3 valid updates".into()
            }
        );
        assert_eq!(state.digest(), before);
        assert_eq!(controller.log().len(), 2);
        assert_eq!(controller.stats().rounds_failed, 2);
        assert!(matches!(
            controller.phase(),
            RoundPhase::Terminated(TerminationReason::Fatal { round: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_failure_is_retried() {
        let config = SessionConfig::with_workers(2);
        let loopback = Arc::new(transport(&config, 2.0));
        loopback.fail_next_broadcasts(1);
        let mut controller = RoundController::new(&config, loopback.clone()).unwrap();
        let mut state = initial();
        let mut convergence = ConvergenceTracker::new(None);

        controller.run_round(1, &mut state, &mut convergence).await.unwrap();
        let records = controller.log().for_round(1);
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].outcome, RoundOutcome::Failed { .. }));
        assert!(records[1].is_completed());
        assert_eq!(records[1].attempt, 2);
        assert_eq!(state.parameters.flatten(), vec![2.0, 2.0]);
    }

    #[tokio::test]
    async fn test_convergence_on_metric() {
        let config = SessionConfig::with_workers(2).with_max_rounds(10);
        let mut controller = RoundController::new(&config, Arc::new(transport(&config, 1.0))).unwrap();
        controller.set_oracle(Arc::new(FixedOracle(0.9)));
        let mut state = initial();
        let mut convergence = ConvergenceTracker::new(Some(1e-3));

        let reason = controller.run(&mut state, &mut convergence).await.unwrap();
        assert_eq!(reason, TerminationReason::Converged);
        assert_eq!(state.round, 2);
        assert_eq!(controller.log().last().unwrap().validation_metric, Some(0.9));
    }

    #[tokio::test]
    async fn test_oracle_failure_is_not_fatal() {
        let config = SessionConfig::with_workers(2).with_max_rounds(1);
        let mut controller = RoundController::new(&config, Arc::new(transport(&config, 1.0))).unwrap();
        controller.set_oracle(Arc::new(BrokenOracle));
        let mut state = initial();
        let mut convergence = ConvergenceTracker::new(None);

        let reason = controller.run_round(1, &mut state, &mut convergence).await.unwrap();
        assert_eq!(reason, Some(TerminationReason::BudgetExhausted));
        assert_eq!(controller.log().last().unwrap().validation_metric, None);
    }

    #[tokio::test]
    async fn test_adaptive_flags_recorded() {
        let config = SessionConfig::with_workers(10)
            .with_aggregator(AggregatorKind::AdaptiveFilter)
            .with_adaptive_filter(AdaptiveFilterConfig::default());
        let loopback = config
            .workers
            .iter()
            .enumerate()
            .fold(LoopbackTransport::new(), |t, (i, id)| {
                let value = if i < 4 { 1000.0 } else { 1.0 };
                t.with_worker(id, Duration::from_millis(1), constant(value))
            });
        let mut controller = RoundController::new(&config, Arc::new(loopback)).unwrap();
        let mut state = initial();
        let mut convergence = ConvergenceTracker::new(None);

        controller.run_round(1, &mut state, &mut convergence).await.unwrap();
        let record = controller.log().last().unwrap();
        assert_eq!(record.flagged.len(), 4);
        assert!(!record.fell_back_to_mean);
        assert_eq!(state.parameters.flatten(), vec![1.0, 1.0]);
    }
}
