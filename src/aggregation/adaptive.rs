//! Adaptive anomaly-filtering aggregation.
//!
//! Each round the updates are compared against a coordinate-median
//! consensus. Distances far above the round's own distance distribution are
//! flagged, and detection repeats on the survivors with a looser threshold
//! until nothing new is flagged. Survivors are averaged with weights taken
//! from per-worker trust scores.
//!
//! Trust is evidence-based: every worker carries Beta pseudo-counts of its
//! unflagged and flagged rounds, and its trust is the posterior probability
//! that it behaves well more often than not. Evidence decays toward the
//! prior each committed round. A worker whose trust drops below the floor
//! is excluded until it is explicitly reinstated.

use crate::aggregation::median::coordinate_median;
use crate::aggregation::mean::mean;
use crate::aggregation::{
    canonical_order, check_uniform_shape, weighted_average, worker_ids, AggregationOutcome,
    AggregationStrategy, AggregatorKind,
};
use crate::core::{Error, Result, WorkerId};
use crate::model::WorkerUpdate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

const INTEGRATION_STEPS: usize = 1000;

/// Centre of the distance distribution used for the threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdCenter {
    /// Median distance (robust to many outliers)
    Median,
    /// Mean distance
    Mean,
}

/// Parameters of the adaptive filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveFilterConfig {
    /// Initial k in `center + k * stddev`
    pub threshold_multiplier: f64,
    /// Increase of k after each detection pass
    pub threshold_step: f64,
    /// Centre statistic for the threshold
    pub center: ThresholdCenter,
    /// Prior pseudo-count of unflagged rounds
    pub prior_good: f64,
    /// Prior pseudo-count of flagged rounds
    pub prior_flagged: f64,
    /// Lowest trust; falling below it excludes the worker
    pub trust_floor: f64,
    /// Highest trust used as an aggregation weight
    pub trust_ceiling: f64,
    /// Fraction of the evidence beyond the prior forgotten each round
    pub decay_rate: f64,
}

impl Default for AdaptiveFilterConfig {
    fn default() -> Self {
        Self {
            threshold_multiplier: 2.0,
            threshold_step: 0.5,
            center: ThresholdCenter::Median,
            prior_good: 1.0,
            prior_flagged: 1.0,
            trust_floor: 0.05,
            trust_ceiling: 1.0,
            decay_rate: 0.05,
        }
    }
}

impl AdaptiveFilterConfig {
    /// Check ranges of the detection and trust parameters.
    pub fn validate(&self) -> Result<()> {
        let values = [
            self.threshold_multiplier,
            self.threshold_step,
            self.prior_good,
            self.prior_flagged,
            self.trust_floor,
            self.trust_ceiling,
            self.decay_rate,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidConfig(
                "adaptive filter parameters must be finite".to_string(),
            ));
        }
        if self.threshold_step < 0.0 {
            return Err(Error::InvalidConfig(
                "threshold step must be non-negative".to_string(),
            ));
        }
        if self.prior_good < 1.0 || self.prior_flagged < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "trust priors must be at least 1, got ({}, {})",
                self.prior_good, self.prior_flagged
            )));
        }
        if self.trust_floor < 0.0 || self.trust_floor >= self.trust_ceiling || self.trust_ceiling > 1.0 {
            return Err(Error::InvalidConfig(format!(
                "trust bounds must satisfy 0 <= floor < ceiling <= 1, got [{}, {}]",
                self.trust_floor, self.trust_ceiling
            )));
        }
        let neutral = TrustEvidence::prior(self).trust();
        if neutral < self.trust_floor {
            return Err(Error::InvalidConfig(format!(
                "prior trust {:.4} is below the floor {}",
                neutral, self.trust_floor
            )));
        }
        if !(0.0..=1.0).contains(&self.decay_rate) {
            return Err(Error::InvalidConfig(format!(
                "decay rate {} outside [0, 1]",
                self.decay_rate
            )));
        }
        Ok(())
    }
}

/// Beta pseudo-counts of a worker's unflagged and flagged rounds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustEvidence {
    /// Unflagged rounds plus the prior
    pub good: f64,
    /// Flagged rounds plus the prior
    pub flagged: f64,
}

impl TrustEvidence {
    fn prior(config: &AdaptiveFilterConfig) -> Self {
        Self {
            good: config.prior_good,
            flagged: config.prior_flagged,
        }
    }

    /// Posterior probability that the worker's good-round rate exceeds 1/2.
    pub fn trust(&self) -> f64 {
        (1.0 - beta_mass_below_half(self.good, self.flagged)).clamp(0.0, 1.0)
    }

    fn decay_toward(&mut self, prior: &TrustEvidence, keep: f64) {
        self.good = prior.good + (self.good - prior.good) * keep;
        self.flagged = prior.flagged + (self.flagged - prior.flagged) * keep;
    }
}

/// `P(p <= 1/2)` for `p ~ Beta(a, b)` with `a, b >= 1`, by Simpson's rule
/// on the unnormalised density.
fn beta_mass_below_half(a: f64, b: f64) -> f64 {
    let log_term = |power: f64, base: f64| if power == 0.0 { 0.0 } else { power * base.ln() };
    let log_density: Vec<f64> = (0..=INTEGRATION_STEPS)
        .map(|i| {
            let x = i as f64 / INTEGRATION_STEPS as f64;
            log_term(a - 1.0, x) + log_term(b - 1.0, 1.0 - x)
        })
        .collect();
    let peak = log_density.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let simpson = |start: usize, end: usize| -> f64 {
        (start..=end)
            .map(|i| {
                let weight = if i == start || i == end {
                    1.0
                } else if (i - start) % 2 == 1 {
                    4.0
                } else {
                    2.0
                };
                weight * (log_density[i] - peak).exp()
            })
            .sum()
    };

    simpson(0, INTEGRATION_STEPS / 2) / simpson(0, INTEGRATION_STEPS)
}

/// Distance statistics threshold for one detection pass.
fn outlier_threshold(distances: &[f64], k: f64, center: ThresholdCenter) -> f64 {
    let finite: Vec<f64> = distances.iter().copied().filter(|d| d.is_finite()).collect();
    if finite.is_empty() {
        return f64::INFINITY;
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let variance = finite.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    let centre = match center {
        ThresholdCenter::Mean => mean,
        ThresholdCenter::Median => {
            let mut sorted = finite;
            sorted.sort_by(|a, b| a.total_cmp(b));
            let m = sorted.len();
            if m % 2 == 1 {
                sorted[m / 2]
            } else {
                (sorted[m / 2 - 1] + sorted[m / 2]) / 2.0
            }
        }
    };

    centre + k * std_dev
}

/// Trust-weighted averaging with per-round anomaly filtering.
#[derive(Clone, Debug)]
pub struct AdaptiveFilter {
    config: AdaptiveFilterConfig,
    /// Evidence of workers that are not excluded
    evidence: BTreeMap<WorkerId, TrustEvidence>,
    /// Excluded workers and the round count at which they were excluded
    excluded: BTreeMap<WorkerId, u64>,
    rounds_observed: u64,
}

impl AdaptiveFilter {
    /// Create a filter with an empty trust table.
    pub fn new(config: AdaptiveFilterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            evidence: BTreeMap::new(),
            excluded: BTreeMap::new(),
            rounds_observed: 0,
        })
    }

    /// Filter configuration.
    pub fn config(&self) -> &AdaptiveFilterConfig {
        &self.config
    }

    fn current_trust(&self, worker: &str) -> f64 {
        self.evidence
            .get(worker)
            .copied()
            .unwrap_or_else(|| TrustEvidence::prior(&self.config))
            .trust()
            .min(self.config.trust_ceiling)
    }

    /// Trust of a worker; unseen workers get the prior, excluded ones none.
    pub fn trust_score(&self, worker: &str) -> Option<f64> {
        if self.excluded.contains_key(worker) {
            return None;
        }
        Some(self.current_trust(worker))
    }

    /// Trust of every scored (seen and not excluded) worker.
    pub fn trust_scores(&self) -> BTreeMap<WorkerId, f64> {
        self.evidence
            .keys()
            .map(|id| (id.clone(), self.current_trust(id)))
            .collect()
    }

    /// Raw evidence of a scored worker.
    pub fn evidence(&self, worker: &str) -> Option<&TrustEvidence> {
        self.evidence.get(worker)
    }

    /// Whether a worker is excluded from aggregation.
    pub fn is_excluded(&self, worker: &str) -> bool {
        self.excluded.contains_key(worker)
    }

    /// Number of observed rounds at the time a worker was excluded.
    pub fn excluded_at(&self, worker: &str) -> Option<u64> {
        self.excluded.get(worker).copied()
    }

    /// Excluded workers in id order.
    pub fn excluded_workers(&self) -> Vec<WorkerId> {
        self.excluded.keys().cloned().collect()
    }

    /// Number of rounds whose outcome updated the trust table.
    pub fn rounds_observed(&self) -> u64 {
        self.rounds_observed
    }

    /// Re-admit an excluded worker with prior evidence.
    ///
    /// Returns false if the worker was not excluded.
    pub fn reinstate(&mut self, worker: &str) -> bool {
        if self.excluded.remove(worker).is_none() {
            return false;
        }
        self.evidence
            .insert(worker.to_string(), TrustEvidence::prior(&self.config));
        info!(worker, "Worker reinstated");
        true
    }

    /// Forget all trust history.
    pub fn reset(&mut self) {
        self.evidence.clear();
        self.excluded.clear();
        self.rounds_observed = 0;
    }

    /// Iterative detection. Returns flagged workers with their distance,
    /// ordered by distance (descending) then worker id.
    fn detect(&self, participants: &[&WorkerUpdate]) -> Result<Vec<(WorkerId, f64)>> {
        let mut good: Vec<&WorkerUpdate> = participants.to_vec();
        let mut flagged: Vec<(WorkerId, f64)> = Vec::new();
        let mut k = self.config.threshold_multiplier;

        while !good.is_empty() {
            let consensus = coordinate_median(&good)?;
            let distances: Vec<f64> = good
                .iter()
                .map(|u| u.parameters.l2_distance(&consensus))
                .collect();
            let threshold = outlier_threshold(&distances, k, self.config.center);

            let mut survivors = Vec::with_capacity(good.len());
            let mut newly = 0;
            for (update, distance) in good.iter().zip(distances.iter()) {
                let outlier = !distance.is_finite() || *distance > threshold;
                debug!(
                    worker = %update.worker_id,
                    distance,
                    threshold,
                    outlier,
                    "Distance to consensus"
                );
                if outlier {
                    flagged.push((update.worker_id.clone(), *distance));
                    newly += 1;
                } else {
                    survivors.push(*update);
                }
            }

            good = survivors;
            if newly == 0 {
                break;
            }
            k += self.config.threshold_step;
        }

        if good.is_empty() {
            return Err(Error::AllWorkersFlagged(participants.len()));
        }

        flagged.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(flagged)
    }

    /// Apply this round's evidence to the trust table.
    ///
    /// All scored workers decay toward the prior, silent ones included.
    /// Returns workers excluded by this round.
    fn commit(&mut self, participants: &[&WorkerUpdate], flagged: &BTreeSet<WorkerId>) -> Vec<WorkerId> {
        let prior = TrustEvidence::prior(&self.config);
        let keep = 1.0 - self.config.decay_rate;
        for evidence in self.evidence.values_mut() {
            evidence.decay_toward(&prior, keep);
        }

        for update in participants {
            let evidence = self
                .evidence
                .entry(update.worker_id.clone())
                .or_insert(prior);
            if flagged.contains(&update.worker_id) {
                evidence.flagged += 1.0;
            } else {
                evidence.good += 1.0;
            }
        }
        self.rounds_observed += 1;

        let floor = self.config.trust_floor;
        let below_floor: Vec<(WorkerId, f64)> = self
            .evidence
            .iter()
            .map(|(id, evidence)| (id.clone(), evidence.trust()))
            .filter(|(_, trust)| *trust < floor)
            .collect();

        for (id, trust) in &below_floor {
            self.evidence.remove(id);
            self.excluded.insert(id.clone(), self.rounds_observed);
            warn!(worker = %id, trust, floor, "Worker excluded");
        }
        below_floor.into_iter().map(|(id, _)| id).collect()
    }
}

impl AggregationStrategy for AdaptiveFilter {
    fn kind(&self) -> AggregatorKind {
        AggregatorKind::AdaptiveFilter
    }

    fn aggregate(&mut self, updates: &[WorkerUpdate]) -> Result<AggregationOutcome> {
        let ordered = canonical_order(updates);
        if ordered.is_empty() {
            return Err(Error::EmptyUpdateSet);
        }

        let (already_excluded, participants): (Vec<&WorkerUpdate>, Vec<&WorkerUpdate>) = ordered
            .into_iter()
            .partition(|u| self.excluded.contains_key(&u.worker_id));
        let mut excluded = worker_ids(&already_excluded);

        if participants.is_empty() {
            warn!(excluded = excluded.len(), "Only excluded workers submitted updates");
            return Err(Error::EmptyUpdateSet);
        }
        check_uniform_shape(&participants)?;

        let flagged = match self.detect(&participants) {
            Ok(flagged) => flagged,
            Err(Error::AllWorkersFlagged(count)) => {
                warn!(
                    count,
                    round = self.rounds_observed + 1,
                    "All updates flagged as anomalous, falling back to mean"
                );
                let parameters = mean(&participants)?;
                let ids = worker_ids(&participants);
                return Ok(AggregationOutcome {
                    parameters,
                    contributors: ids.clone(),
                    flagged: ids,
                    excluded,
                    fell_back_to_mean: true,
                });
            }
            Err(err) => return Err(err),
        };

        let flagged_set: BTreeSet<WorkerId> = flagged.iter().map(|(id, _)| id.clone()).collect();
        let good: Vec<&WorkerUpdate> = participants
            .iter()
            .copied()
            .filter(|u| !flagged_set.contains(&u.worker_id))
            .collect();
        let weights: Vec<f64> = good.iter().map(|u| self.current_trust(&u.worker_id)).collect();
        let parameters = weighted_average(&good, &weights)?;

        excluded.extend(self.commit(&participants, &flagged_set));
        excluded.sort();

        if !flagged.is_empty() {
            info!(
                flagged = flagged.len(),
                contributors = good.len(),
                "Anomalous updates filtered"
            );
        }

        Ok(AggregationOutcome {
            parameters,
            contributors: worker_ids(&good),
            flagged: flagged.into_iter().map(|(id, _)| id).collect(),
            excluded,
            fell_back_to_mean: false,
        })
    }
}
