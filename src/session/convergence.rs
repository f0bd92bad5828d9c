//! Stopping criterion based on round-over-round change.

use crate::core::RoundNumber;
use serde::{Deserialize, Serialize};

/// One evaluated round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergencePoint {
    /// Round number
    pub round: RoundNumber,
    /// Validation metric, if an oracle produced one
    pub metric: Option<f64>,
    /// L2 distance between the previous and the new global parameters
    pub parameter_change: f64,
}

/// Decides when training has converged.
///
/// With a validation metric, convergence is a metric change of at most the
/// tolerance between consecutive evaluated rounds. Without one, the L2
/// parameter change of the round is compared instead. Without a tolerance
/// training only stops on the round budget.
#[derive(Clone, Debug, Default)]
pub struct ConvergenceTracker {
    tolerance: Option<f64>,
    history: Vec<ConvergencePoint>,
}

impl ConvergenceTracker {
    /// Create a tracker.
    pub fn new(tolerance: Option<f64>) -> Self {
        Self {
            tolerance,
            history: Vec::new(),
        }
    }

    /// Record a round and report whether training has converged.
    pub fn observe(
        &mut self,
        round: RoundNumber,
        metric: Option<f64>,
        parameter_change: f64,
    ) -> bool {
        let previous_metric = self.last_metric();
        self.history.push(ConvergencePoint {
            round,
            metric,
            parameter_change,
        });

        let Some(tolerance) = self.tolerance else {
            return false;
        };
        match (metric, previous_metric) {
            (Some(current), Some(previous)) => (current - previous).abs() <= tolerance,
            // First metric: nothing to compare against yet
            (Some(_), None) => false,
            (None, _) => parameter_change <= tolerance,
        }
    }

    /// Configured tolerance.
    pub fn tolerance(&self) -> Option<f64> {
        self.tolerance
    }

    /// Evaluated rounds in order.
    pub fn history(&self) -> &[ConvergencePoint] {
        &self.history
    }

    /// Most recent metric.
    pub fn last_metric(&self) -> Option<f64> {
        self.history.iter().rev().find_map(|p| p.metric)
    }

    /// Highest metric seen.
    pub fn best_metric(&self) -> Option<f64> {
        self.history
            .iter()
            .filter_map(|p| p.metric)
            .max_by(|a, b| a.total_cmp(b))
    }
}
