//! Training session: owns the global model and runs it to termination.

use crate::aggregation::AdaptiveFilter;
use crate::collector::UpdateCollector;
use crate::core::{now, Error, Result, RoundNumber, Timestamp, WorkerId};
use crate::model::{GlobalModelState, ParameterSet};
use crate::monitoring::init_tracing;
use crate::round::{ControllerStats, RoundController, RoundLog, RoundPhase, TerminationReason};
use crate::session::config::SessionConfig;
use crate::session::convergence::ConvergenceTracker;
use crate::session::transport::{ValidationOracle, WorkerTransport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of a finished `fit`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Session identifier
    pub session_id: String,
    /// Why training stopped
    pub reason: TerminationReason,
    /// Round of the final global state
    pub final_round: RoundNumber,
    /// Round attempts including failed ones
    pub attempts: usize,
    /// Best validation metric seen
    pub best_metric: Option<f64>,
    /// Final global state
    pub final_state: GlobalModelState,
    /// Start of training
    pub started_at: Timestamp,
    /// End of training
    pub finished_at: Timestamp,
}

/// A federated training run.
pub struct TrainingSession {
    id: String,
    config: SessionConfig,
    state: Arc<GlobalModelState>,
    controller: RoundController,
    convergence: ConvergenceTracker,
    transport: Arc<dyn WorkerTransport>,
    termination: Option<TerminationReason>,
}

impl TrainingSession {
    /// Create a session over `initial` parameters.
    ///
    /// Trust and exclusion state of the adaptive filter starts empty and
    /// lives as long as the session. The configured logging is installed
    /// unless the process already has a subscriber.
    pub fn new(
        config: SessionConfig,
        initial: ParameterSet,
        transport: Arc<dyn WorkerTransport>,
    ) -> Result<Self> {
        if initial.num_elements() == 0 {
            return Err(Error::InvalidConfig("initial model has no parameters".to_string()));
        }
        if init_tracing(&config.logging) {
            debug!(level = %config.logging.level, "Tracing subscriber installed");
        }
        let controller = RoundController::new(&config, Arc::clone(&transport))?;
        let convergence = ConvergenceTracker::new(config.convergence_tolerance);

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            state: Arc::new(GlobalModelState::initial(initial)),
            controller,
            convergence,
            transport,
            termination: None,
        })
    }

    /// Attach a validation oracle.
    pub fn with_validation(mut self, oracle: Arc<dyn ValidationOracle>) -> Self {
        self.controller.set_oracle(oracle);
        self
    }

    /// Run rounds until the budget, convergence or a fatal failure.
    ///
    /// Workers are told to terminate whichever way training ends.
    pub async fn fit(&mut self) -> Result<TrainingSummary> {
        let started_at = now();
        info!(
            session = %self.id,
            workers = self.config.workers.len(),
            quorum = self.controller.quorum(),
            max_rounds = self.config.max_rounds,
            strategy = %self.config.aggregator,
            "Training started"
        );

        let result = self
            .controller
            .run(&mut self.state, &mut self.convergence)
            .await;

        if let Err(err) = self.transport.terminate_workers().await {
            warn!(session = %self.id, error = %err, "Failed to terminate workers");
        }

        match result {
            Ok(reason) => {
                self.termination = Some(reason.clone());
                info!(
                    session = %self.id,
                    reason = %reason,
                    round = self.state.round,
                    digest = %self.state.digest().short(),
                    "Training finished"
                );
                Ok(TrainingSummary {
                    session_id: self.id.clone(),
                    reason,
                    final_round: self.state.round,
                    attempts: self.controller.log().len(),
                    best_metric: self.convergence.best_metric(),
                    final_state: (*self.state).clone(),
                    started_at,
                    finished_at: now(),
                })
            }
            Err(err) => {
                if let RoundPhase::Terminated(reason) = self.controller.phase() {
                    self.termination = Some(reason.clone());
                }
                error!(session = %self.id, error = %err, "Training aborted");
                Err(err)
            }
        }
    }

    /// Run a single round without terminating workers afterwards.
    pub async fn step(&mut self) -> Result<Option<TerminationReason>> {
        let round = self.state.round + 1;
        let reason = self
            .controller
            .run_round(round, &mut self.state, &mut self.convergence)
            .await;
        match &reason {
            Ok(Some(reason)) => self.termination = Some(reason.clone()),
            Err(_) => {
                if let RoundPhase::Terminated(reason) = self.controller.phase() {
                    self.termination = Some(reason.clone());
                }
            }
            Ok(None) => {}
        }
        reason
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configuration in use.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current global state; cheap to clone and immutable.
    pub fn snapshot(&self) -> Arc<GlobalModelState> {
        Arc::clone(&self.state)
    }

    /// Final global state, once training has terminated.
    pub fn final_state(&self) -> Option<Arc<GlobalModelState>> {
        self.termination.as_ref().map(|_| Arc::clone(&self.state))
    }

    /// Why training stopped, if it has.
    pub fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    /// Current controller phase.
    pub fn phase(&self) -> &RoundPhase {
        self.controller.phase()
    }

    /// Round history.
    pub fn round_log(&self) -> &RoundLog {
        self.controller.log()
    }

    /// Controller statistics.
    pub fn stats(&self) -> &ControllerStats {
        self.controller.stats()
    }

    /// Convergence history.
    pub fn convergence(&self) -> &ConvergenceTracker {
        &self.convergence
    }

    /// Collector shared with the transport.
    pub fn collector(&self) -> Arc<UpdateCollector> {
        self.controller.collector()
    }

    /// Adaptive filter state, when that strategy is active.
    pub fn adaptive_filter(&self) -> Option<&AdaptiveFilter> {
        self.controller.aggregator().adaptive()
    }

    /// Trust scores of the adaptive filter; excluded workers have none.
    pub fn trust_scores(&self) -> Option<BTreeMap<WorkerId, f64>> {
        self.adaptive_filter().map(|f| f.trust_scores())
    }

    /// Let an excluded worker contribute again.
    pub fn reinstate_worker(&mut self, worker: &str) -> bool {
        let reinstated = self
            .controller
            .aggregator_mut()
            .adaptive_mut()
            .map(|f| f.reinstate(worker))
            .unwrap_or(false);
        if reinstated {
            info!(session = %self.id, worker, "Worker reinstated");
        }
        reinstated
    }

    /// Forget all trust and exclusion state.
    pub fn reset_trust(&mut self) {
        self.controller.aggregator_mut().reset();
    }
}
