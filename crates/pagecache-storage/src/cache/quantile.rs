//! Streaming quantile estimation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Frugal-1U streaming quantile estimator.
///
/// Keeps a single value and nudges it by `step` on each observation: up with
/// probability `q` when the sample is above the estimate, down with
/// probability `1 - q` when it is below. Over a stationary stream the
/// estimate drifts to the `q`-th quantile using O(1) memory.
#[derive(Debug)]
pub(crate) struct FrugalQuantileEstimator {
    /// Target percentile, 0..=100.
    percentile: u32,
    step: f64,
    estimate: f64,
    rng: StdRng,
}

impl FrugalQuantileEstimator {
    pub(crate) fn new(percentile: u32, step: f64, initial: f64) -> Self {
        Self::with_rng(percentile, step, initial, StdRng::from_entropy())
    }

    pub(crate) fn seeded(percentile: u32, step: f64, initial: f64, seed: u64) -> Self {
        Self::with_rng(percentile, step, initial, StdRng::seed_from_u64(seed))
    }

    fn with_rng(percentile: u32, step: f64, initial: f64, rng: StdRng) -> Self {
        assert!(percentile <= 100, "percentile {percentile} must be in [0, 100]");
        assert!(step > 0.0, "step {step} must be > 0");
        Self {
            percentile,
            step,
            estimate: initial,
            rng,
        }
    }

    /// Feeds one sample and returns the updated estimate.
    pub(crate) fn update(&mut self, sample: f64) -> f64 {
        let r = self.rng.gen::<f64>() * 100.0;
        let p = f64::from(self.percentile);
        if sample > self.estimate && r > 100.0 - p {
            self.estimate += self.step;
        } else if sample < self.estimate && r > p {
            self.estimate -= self.step;
        }
        self.estimate
    }

    pub(crate) fn estimate(&self) -> f64 {
        self.estimate
    }

    pub(crate) fn percentile(&self) -> u32 {
        self.percentile
    }

    /// Changes the percentile to track. The current estimate is kept and
    /// converges to the new percentile as samples arrive.
    pub(crate) fn set_target_percentile(&mut self, percentile: u32) {
        assert!(percentile <= 100, "percentile {percentile} must be in [0, 100]");
        self.percentile = percentile;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_uniform(estimator: &mut FrugalQuantileEstimator, rounds: usize) {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..rounds {
            estimator.update(f64::from(rng.gen_range(0..1000)));
        }
    }

    #[test]
    fn test_converges_to_median() {
        let mut estimator = FrugalQuantileEstimator::seeded(50, 1.0, 0.0, 42);
        feed_uniform(&mut estimator, 100_000);
        let estimate = estimator.estimate();
        assert!((400.0..600.0).contains(&estimate), "estimate = {estimate}");
    }

    #[test]
    fn test_low_percentile_stays_low() {
        let mut estimator = FrugalQuantileEstimator::seeded(10, 1.0, 0.0, 42);
        feed_uniform(&mut estimator, 100_000);
        let estimate = estimator.estimate();
        assert!((30.0..250.0).contains(&estimate), "estimate = {estimate}");
    }

    #[test]
    fn test_never_moves_past_constant_stream() {
        let mut estimator = FrugalQuantileEstimator::seeded(90, 0.5, 0.0, 1);
        for _ in 0..10_000 {
            estimator.update(5.0);
        }
        assert!(estimator.estimate() <= 5.0);
        assert!(estimator.estimate() >= 4.5);
    }

    #[test]
    fn test_retarget() {
        let mut estimator = FrugalQuantileEstimator::seeded(10, 0.5, 0.0, 1);
        estimator.set_target_percentile(20);
        assert_eq!(estimator.percentile(), 20);
    }

    #[test]
    #[should_panic(expected = "must be in [0, 100]")]
    fn test_bad_percentile() {
        let _ = FrugalQuantileEstimator::new(101, 0.5, 0.0);
    }
}
