//! Coordinate-wise median aggregation.
//!
//! Each element is the median of that element across all updates, so a
//! minority of arbitrary updates cannot push any coordinate outside the
//! range spanned by the honest values.

use crate::aggregation::{
    canonical_order, check_uniform_shape, worker_ids, AggregationOutcome, AggregationStrategy,
    AggregatorKind,
};
use crate::core::{Error, Result};
use crate::model::{ParameterSet, WorkerUpdate};

/// Stateless coordinate-wise median.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoordinateMedianAggregator;

/// Median of a column. Odd length: middle value; even: mean of the two middle values.
fn median_of(column: &mut [f32]) -> f32 {
    column.sort_by(|a, b| a.total_cmp(b));
    let n = column.len();
    if n % 2 == 1 {
        column[n / 2]
    } else {
        ((column[n / 2 - 1] as f64 + column[n / 2] as f64) / 2.0) as f32
    }
}

/// Coordinate-wise median of already-ordered updates.
pub(crate) fn coordinate_median(updates: &[&WorkerUpdate]) -> Result<ParameterSet> {
    check_uniform_shape(updates)?;
    let first = updates.first().ok_or(Error::EmptyUpdateSet)?;

    let rows: Vec<Vec<f32>> = updates.iter().map(|u| u.parameters.flatten()).collect();
    let width = first.parameters.num_elements();

    let mut column = vec![0.0f32; rows.len()];
    let mut flat = Vec::with_capacity(width);
    for i in 0..width {
        for (slot, row) in column.iter_mut().zip(rows.iter()) {
            *slot = row[i];
        }
        flat.push(median_of(&mut column));
    }

    first
        .parameters
        .with_flat_values(&flat)
        .ok_or(Error::EmptyUpdateSet)
}

impl AggregationStrategy for CoordinateMedianAggregator {
    fn kind(&self) -> AggregatorKind {
        AggregatorKind::CoordinateMedian
    }

    fn aggregate(&mut self, updates: &[WorkerUpdate]) -> Result<AggregationOutcome> {
        let ordered = canonical_order(updates);
        let parameters = coordinate_median(&ordered)?;
        Ok(AggregationOutcome::plain(parameters, worker_ids(&ordered)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn update(worker: &str, values: Vec<f32>) -> WorkerUpdate {
        WorkerUpdate::new(worker, 1, ParameterSet::from_vector(values))
    }

    #[test]
    fn test_odd_count_exact_median() {
        let updates = vec![
            update("a", vec![1.0, 9.0]),
            update("b", vec![3.0, 7.0]),
            update("c", vec![2.0, 8.0]),
        ];
        let outcome = CoordinateMedianAggregator.aggregate(&updates).unwrap();
        assert_eq!(outcome.parameters.flatten(), vec![2.0, 8.0]);
    }

    #[test]
    fn test_even_count_averages_middle_values() {
        let updates = vec![
            update("a", vec![1.0]),
            update("b", vec![4.0]),
            update("c", vec![2.0]),
            update("d", vec![100.0]),
        ];
        let outcome = CoordinateMedianAggregator.aggregate(&updates).unwrap();
        assert_eq!(outcome.parameters.flatten(), vec![3.0]);
    }

    #[test]
    fn test_coordinates_are_independent() {
        // No single worker holds the per-coordinate medians.
        let updates = vec![
            update("a", vec![0.0, 5.0]),
            update("b", vec![5.0, 0.0]),
            update("c", vec![1.0, 1.0]),
        ];
        let outcome = CoordinateMedianAggregator.aggregate(&updates).unwrap();
        assert_eq!(outcome.parameters.flatten(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_ties_are_value_based() {
        let updates = vec![
            update("z", vec![2.0]),
            update("a", vec![2.0]),
            update("m", vec![7.0]),
        ];
        let outcome = CoordinateMedianAggregator.aggregate(&updates).unwrap();
        assert_eq!(outcome.parameters.flatten(), vec![2.0]);
    }

    #[test]
    fn test_large_outliers_do_not_move_result() {
        let mut updates: Vec<WorkerUpdate> = (0..6)
            .map(|i| update(&format!("honest-{}", i), vec![1.0, 1.0]))
            .collect();
        for i in 0..4 {
            updates.push(update(&format!("byz-{}", i), vec![1000.0, 1000.0]));
        }
        let outcome = CoordinateMedianAggregator.aggregate(&updates).unwrap();
        assert_eq!(outcome.parameters.flatten(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_minority_stays_within_honest_range() {
        let mut rng = StdRng::seed_from_u64(42);
        for trial in 0..20 {
            let n = rng.gen_range(3..15);
            let f = (n - 1) / 2;
            let honest: Vec<Vec<f32>> = (0..n - f)
                .map(|_| (0..8).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
                .collect();

            let mut updates: Vec<WorkerUpdate> = honest
                .iter()
                .enumerate()
                .map(|(i, v)| update(&format!("h{}", i), v.clone()))
                .collect();
            for i in 0..f {
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                let values = (0..8).map(|_| sign * rng.gen_range(1e3f32..1e6)).collect();
                updates.push(update(&format!("b{}", i), values));
            }

            let result = CoordinateMedianAggregator
                .aggregate(&updates)
                .unwrap()
                .parameters
                .flatten();
            for (j, value) in result.iter().enumerate() {
                let lo = honest.iter().map(|v| v[j]).fold(f32::INFINITY, f32::min);
                let hi = honest.iter().map(|v| v[j]).fold(f32::NEG_INFINITY, f32::max);
                assert!(
                    *value >= lo && *value <= hi,
                    "trial {} coord {}: {} outside [{}, {}]",
                    trial,
                    j,
                    value,
                    lo,
                    hi
                );
            }
        }
    }

    #[test]
    fn test_permutation_invariance() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut updates: Vec<WorkerUpdate> = (0..9)
            .map(|i| {
                let values = (0..10).map(|_| rng.gen_range(-5.0f32..5.0)).collect();
                update(&format!("w{}", i), values)
            })
            .collect();

        let reference = CoordinateMedianAggregator.aggregate(&updates).unwrap();
        updates.shuffle(&mut rng);
        let shuffled = CoordinateMedianAggregator.aggregate(&updates).unwrap();
        assert_eq!(shuffled, reference);
    }
}
