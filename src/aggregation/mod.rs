//! Robust Aggregation Module
//!
//! Combines the worker updates of one round into a single update:
//! - Mean: sample-count weighted averaging
//! - CoordinateMedian: per-element median, bounded influence of a minority
//! - AdaptiveFilter: outlier detection with per-worker trust across rounds
//!
//! Updates are always processed in worker-id order so the result does not
//! depend on arrival order.

pub mod adaptive;
pub mod mean;
pub mod median;

pub use adaptive::{AdaptiveFilter, AdaptiveFilterConfig, ThresholdCenter, TrustEvidence};
pub use mean::MeanAggregator;
pub use median::CoordinateMedianAggregator;

use crate::core::{Error, Result, WorkerId};
use crate::model::{ParameterSet, WorkerUpdate};
use serde::{Deserialize, Serialize};

/// Strategy selector used in configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorKind {
    /// Plain weighted averaging
    Mean,
    /// Coordinate-wise median
    CoordinateMedian,
    /// Trust-weighted averaging with anomaly filtering
    AdaptiveFilter,
}

impl AggregatorKind {
    /// Map the legacy integer scenario flag (0, 1, 2).
    pub fn from_scenario(scenario: u8) -> Result<Self> {
        match scenario {
            0 => Ok(Self::Mean),
            1 => Ok(Self::CoordinateMedian),
            2 => Ok(Self::AdaptiveFilter),
            other => Err(Error::InvalidConfig(format!(
                "unknown aggregation scenario {}",
                other
            ))),
        }
    }
}

impl Default for AggregatorKind {
    fn default() -> Self {
        Self::Mean
    }
}

impl std::fmt::Display for AggregatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregatorKind::Mean => write!(f, "mean"),
            AggregatorKind::CoordinateMedian => write!(f, "coordinate_median"),
            AggregatorKind::AdaptiveFilter => write!(f, "adaptive_filter"),
        }
    }
}

/// Result of aggregating one round.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregationOutcome {
    /// Combined parameters
    pub parameters: ParameterSet,
    /// Workers whose updates entered the result
    pub contributors: Vec<WorkerId>,
    /// Workers flagged as anomalous this round
    pub flagged: Vec<WorkerId>,
    /// Workers excluded (previously or during this round)
    pub excluded: Vec<WorkerId>,
    /// Whether filtering gave up and plain Mean was used
    pub fell_back_to_mean: bool,
}

impl AggregationOutcome {
    /// Outcome where every update contributed.
    pub fn plain(parameters: ParameterSet, contributors: Vec<WorkerId>) -> Self {
        Self {
            parameters,
            contributors,
            flagged: Vec::new(),
            excluded: Vec::new(),
            fell_back_to_mean: false,
        }
    }
}

/// Common interface of all aggregation strategies.
pub trait AggregationStrategy {
    /// Which variant this is.
    fn kind(&self) -> AggregatorKind;

    /// Combine the valid updates of one round.
    ///
    /// Fails with `EmptyUpdateSet` when there is nothing to combine.
    fn aggregate(&mut self, updates: &[WorkerUpdate]) -> Result<AggregationOutcome>;
}

/// The closed set of strategies, selected once per session.
#[derive(Clone, Debug)]
pub enum Aggregator {
    Mean(MeanAggregator),
    CoordinateMedian(CoordinateMedianAggregator),
    AdaptiveFilter(AdaptiveFilter),
}

impl Aggregator {
    /// Build the strategy named by `kind`.
    pub fn from_kind(kind: AggregatorKind, adaptive: &AdaptiveFilterConfig) -> Result<Self> {
        Ok(match kind {
            AggregatorKind::Mean => Self::Mean(MeanAggregator),
            AggregatorKind::CoordinateMedian => {
                Self::CoordinateMedian(CoordinateMedianAggregator)
            }
            AggregatorKind::AdaptiveFilter => {
                Self::AdaptiveFilter(AdaptiveFilter::new(adaptive.clone())?)
            }
        })
    }

    /// Drop any cross-round state.
    pub fn reset(&mut self) {
        if let Self::AdaptiveFilter(filter) = self {
            filter.reset();
        }
    }

    /// Access the adaptive filter, if that is the active strategy.
    pub fn adaptive(&self) -> Option<&AdaptiveFilter> {
        match self {
            Self::AdaptiveFilter(filter) => Some(filter),
            _ => None,
        }
    }

    /// Mutable access to the adaptive filter.
    pub fn adaptive_mut(&mut self) -> Option<&mut AdaptiveFilter> {
        match self {
            Self::AdaptiveFilter(filter) => Some(filter),
            _ => None,
        }
    }
}

impl AggregationStrategy for Aggregator {
    fn kind(&self) -> AggregatorKind {
        match self {
            Self::Mean(a) => a.kind(),
            Self::CoordinateMedian(a) => a.kind(),
            Self::AdaptiveFilter(a) => a.kind(),
        }
    }

    fn aggregate(&mut self, updates: &[WorkerUpdate]) -> Result<AggregationOutcome> {
        match self {
            Self::Mean(a) => a.aggregate(updates),
            Self::CoordinateMedian(a) => a.aggregate(updates),
            Self::AdaptiveFilter(a) => a.aggregate(updates),
        }
    }
}

/// Updates sorted by worker id.
pub(crate) fn canonical_order(updates: &[WorkerUpdate]) -> Vec<&WorkerUpdate> {
    let mut ordered: Vec<&WorkerUpdate> = updates.iter().collect();
    ordered.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    ordered
}

/// All updates must share the first update's shape.
pub(crate) fn check_uniform_shape(updates: &[&WorkerUpdate]) -> Result<()> {
    let first = updates.first().ok_or(Error::EmptyUpdateSet)?;
    let signature = first.parameters.signature();
    for update in &updates[1..] {
        update
            .parameters
            .conforms_to(&signature)
            .map_err(|detail| Error::ShapeMismatch {
                worker_id: update.worker_id.clone(),
                detail,
            })?;
    }
    Ok(())
}

/// Weighted element-wise average in `f64`.
///
/// Non-positive or non-finite total weight falls back to equal weights.
pub(crate) fn weighted_average(updates: &[&WorkerUpdate], weights: &[f64]) -> Result<ParameterSet> {
    let first = updates.first().ok_or(Error::EmptyUpdateSet)?;

    let total: f64 = weights.iter().sum();
    let normalized: Vec<f64> = if total > 0.0 && total.is_finite() {
        weights.iter().map(|w| w / total).collect()
    } else {
        vec![1.0 / updates.len() as f64; updates.len()]
    };

    let mut acc = vec![0.0f64; first.parameters.num_elements()];
    for (update, weight) in updates.iter().zip(normalized.iter()) {
        for (slot, value) in acc.iter_mut().zip(update.parameters.iter_values()) {
            *slot += weight * value as f64;
        }
    }

    let flat: Vec<f32> = acc.into_iter().map(|v| v as f32).collect();
    first
        .parameters
        .with_flat_values(&flat)
        .ok_or(Error::EmptyUpdateSet)
}

pub(crate) fn worker_ids(updates: &[&WorkerUpdate]) -> Vec<WorkerId> {
    updates.iter().map(|u| u.worker_id.clone()).collect()
}
