//! Sample-count weighted averaging (FedAvg).

use crate::aggregation::{
    canonical_order, check_uniform_shape, weighted_average, worker_ids, AggregationOutcome,
    AggregationStrategy, AggregatorKind,
};
use crate::core::Result;
use crate::model::{ParameterSet, WorkerUpdate};

/// Stateless weighted mean.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanAggregator;

/// Weights from sample counts, used only when every update reports one.
pub(crate) fn sample_weights(updates: &[&WorkerUpdate]) -> Vec<f64> {
    let counts: Option<Vec<f64>> = updates
        .iter()
        .map(|u| u.sample_count.map(|c| c as f64))
        .collect();
    counts.unwrap_or_else(|| vec![1.0; updates.len()])
}

/// Mean of already-ordered updates.
pub(crate) fn mean(updates: &[&WorkerUpdate]) -> Result<ParameterSet> {
    check_uniform_shape(updates)?;
    weighted_average(updates, &sample_weights(updates))
}

impl AggregationStrategy for MeanAggregator {
    fn kind(&self) -> AggregatorKind {
        AggregatorKind::Mean
    }

    fn aggregate(&mut self, updates: &[WorkerUpdate]) -> Result<AggregationOutcome> {
        let ordered = canonical_order(updates);
        let parameters = mean(&ordered)?;
        Ok(AggregationOutcome::plain(parameters, worker_ids(&ordered)))
    }
}
