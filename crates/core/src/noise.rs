//! Gaussian noise for clipped gradient sums.

use ndarray::ArrayView1;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::clipping::{ClippedGradients, ClippedSum};
use crate::error::{DpError, Result};
use crate::tensor::{Scalar, Tensor};

/// Add i.i.d. Gaussian noise with standard deviation `sigma` in-place.
///
/// Coordinates are drawn in order, so a fixed RNG stream reproduces the
/// same noise vector.
pub fn add_gaussian_noise<R: Rng + ?Sized>(
    values: &mut [f64],
    sigma: f64,
    rng: &mut R,
) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let dist = Normal::new(0.0, sigma)
        .map_err(|e| DpError::invalid(format!("noise stddev {sigma}: {e}")))?;
    for v in values.iter_mut() {
        *v += dist.sample(rng);
    }
    Ok(())
}

/// Gaussian mechanism with sensitivity calibration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaussianMechanism {
    /// Noise multiplier (sigma = noise_mult * sensitivity).
    pub noise_mult: f64,
    /// L2 sensitivity bound.
    pub sensitivity: f64,
}

impl GaussianMechanism {
    /// Create a new Gaussian mechanism.
    pub fn new(noise_mult: f64, sensitivity: f64) -> Self {
        Self {
            noise_mult,
            sensitivity,
        }
    }

    /// Get the noise standard deviation.
    pub fn sigma(&self) -> f64 {
        self.noise_mult * self.sensitivity
    }
}

/// Divisor applied to the noised sum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Normalization {
    /// Divide by the number of examples actually summed.
    #[default]
    BatchSize,
    /// Divide by a fixed expected batch size per physical batch (for Poisson
    /// sampling, where the realized size varies and may be zero).
    Expected(usize),
}

/// Turns a sum of clipped gradients into a noised, averaged update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoiseInjector {
    mechanism: GaussianMechanism,
    normalization: Normalization,
}

impl NoiseInjector {
    /// Create an injector for clip threshold `C` and noise multiplier `σ`.
    pub fn new(max_grad_norm: f64, noise_multiplier: f64) -> Result<Self> {
        if !max_grad_norm.is_finite() || max_grad_norm <= 0.0 {
            return Err(DpError::config(format!(
                "max_grad_norm must be positive and finite, got {max_grad_norm}"
            )));
        }
        if !noise_multiplier.is_finite() || noise_multiplier <= 0.0 {
            return Err(DpError::config(format!(
                "noise_multiplier must be positive and finite, got {noise_multiplier}"
            )));
        }
        Ok(Self {
            mechanism: GaussianMechanism::new(noise_multiplier, max_grad_norm),
            normalization: Normalization::BatchSize,
        })
    }

    /// Choose how the noised sum is averaged.
    pub fn with_normalization(mut self, normalization: Normalization) -> Result<Self> {
        if normalization == Normalization::Expected(0) {
            return Err(DpError::config("expected batch size must be positive"));
        }
        self.normalization = normalization;
        Ok(self)
    }

    /// Noise standard deviation per coordinate (`σ·C`).
    pub fn stddev(&self) -> f64 {
        self.mechanism.sigma()
    }

    /// The noise multiplier `σ`.
    pub fn noise_multiplier(&self) -> f64 {
        self.mechanism.noise_mult
    }

    /// Active normalization.
    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Sum, noise and average a single clipped batch.
    pub fn inject<R: Rng + ?Sized>(
        &self,
        clipped: ClippedGradients,
        rng: &mut R,
    ) -> Result<PrivateUpdate> {
        self.privatize(clipped.into_sum(), rng)
    }

    /// Noise and average an accumulated clipped sum.
    ///
    /// A single noise vector is drawn for the whole parameter vector,
    /// regardless of how many examples or batches went into `sum`.
    pub fn privatize<R: Rng + ?Sized>(
        &self,
        sum: ClippedSum,
        rng: &mut R,
    ) -> Result<PrivateUpdate> {
        if (sum.max_grad_norm - self.mechanism.sensitivity).abs() > 0.0 {
            return Err(DpError::invalid(format!(
                "sum was clipped at {} but noise is calibrated for {}",
                sum.max_grad_norm, self.mechanism.sensitivity
            )));
        }
        let denom = match self.normalization {
            Normalization::BatchSize => {
                if sum.examples == 0 {
                    return Err(DpError::invalid(
                        "cannot average an empty batch; use expected-batch-size normalization",
                    ));
                }
                sum.examples as f64
            }
            Normalization::Expected(b) => (b as f64) * (sum.batches.max(1) as f64),
        };

        let mut values = sum.sum;
        add_gaussian_noise(&mut values, self.stddev(), rng)?;
        let update: Tensor = values.into_iter().map(|v| (v / denom) as Scalar).collect();
        Ok(PrivateUpdate {
            values: update,
            examples: sum.examples,
        })
    }
}

/// The privatized update direction handed to the optimizer.
#[derive(Clone, Debug, PartialEq)]
pub struct PrivateUpdate {
    values: Tensor,
    examples: usize,
}

impl PrivateUpdate {
    /// The update vector.
    pub fn view(&self) -> ArrayView1<'_, Scalar> {
        self.values.view()
    }

    /// Consume into the update vector.
    pub fn into_inner(self) -> Tensor {
        self.values
    }

    /// Vector length.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the update has no coordinates.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of examples that contributed.
    pub fn examples(&self) -> usize {
        self.examples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipping::GradientClipper;
    use crate::gradients::PerExampleGradients;
    use ndarray::{array, Array2};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn clipped(rows: Array2<Scalar>, c: f64) -> ClippedGradients {
        GradientClipper::new(c)
            .expect("clipper")
            .clip(PerExampleGradients::new(rows))
            .expect("clip")
    }

    #[test]
    fn test_gaussian_deterministic() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut t1 = vec![0.0; 100];
        add_gaussian_noise(&mut t1, 1.0, &mut rng).expect("noise");

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut t2 = vec![0.0; 100];
        add_gaussian_noise(&mut t2, 1.0, &mut rng).expect("noise");

        assert_eq!(t1, t2);
    }

    #[test]
    fn test_gaussian_statistics() {
        let mut rng = ChaCha8Rng::seed_from_u64(123);
        let mut t = vec![0.0; 10_000];
        add_gaussian_noise(&mut t, 1.0, &mut rng).expect("noise");

        let mean: f64 = t.iter().sum::<f64>() / t.len() as f64;
        let var: f64 = t.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / t.len() as f64;

        assert!(mean.abs() < 0.1);
        assert!((var - 1.0).abs() < 0.1);
    }

    #[test]
    fn stddev_is_sigma_times_threshold() {
        let injector = NoiseInjector::new(1.5, 2.0).expect("injector");
        assert!((injector.stddev() - 3.0).abs() < 1e-12);
        assert_eq!(injector.noise_multiplier(), 2.0);
    }

    #[test]
    fn rejects_non_positive_parameters() {
        assert!(NoiseInjector::new(0.0, 1.0).is_err());
        assert!(NoiseInjector::new(1.0, 0.0).is_err());
        assert!(NoiseInjector::new(1.0, f64::NAN).is_err());
        let injector = NoiseInjector::new(1.0, 1.0).expect("injector");
        assert!(injector.with_normalization(Normalization::Expected(0)).is_err());
    }

    #[test]
    fn update_matches_sum_plus_noise_over_batch() {
        let injector = NoiseInjector::new(10.0, 0.5).expect("injector");
        let batch = clipped(array![[1.0, 2.0], [3.0, 4.0]], 10.0);
        let update = injector
            .inject(batch, &mut ChaCha8Rng::seed_from_u64(9))
            .expect("update");

        let mut expected = vec![4.0, 6.0];
        add_gaussian_noise(&mut expected, 5.0, &mut ChaCha8Rng::seed_from_u64(9)).expect("noise");
        for (got, want) in update.view().iter().zip(expected.iter()) {
            assert!(((*got as f64) - want / 2.0).abs() < 1e-6);
        }
        assert_eq!(update.examples(), 2);
    }

    #[test]
    fn empty_batch_requires_expected_normalization() {
        let injector = NoiseInjector::new(1.0, 1.0).expect("injector");
        let empty = clipped(Array2::zeros((0, 3)), 1.0);
        let err = injector
            .inject(empty.clone(), &mut ChaCha8Rng::seed_from_u64(0))
            .expect_err("empty batch");
        assert!(matches!(err, DpError::InvalidParameters { .. }));

        let injector = injector
            .with_normalization(Normalization::Expected(4))
            .expect("expected size");
        let update = injector
            .inject(empty, &mut ChaCha8Rng::seed_from_u64(0))
            .expect("noise-only update");
        assert_eq!(update.len(), 3);
        assert!(update.view().iter().all(|v| v.is_finite() && *v != 0.0));
    }

    #[test]
    fn accumulated_batches_share_one_noise_draw() {
        let injector = NoiseInjector::new(1.0, 1.0)
            .expect("injector")
            .with_normalization(Normalization::Expected(2))
            .expect("expected size");
        let mut sum = clipped(array![[1.0, 0.0]], 1.0).into_sum();
        sum.merge(clipped(array![[0.0, 1.0]], 1.0).into_sum())
            .expect("merge");
        assert_eq!(sum.batches(), 2);

        let update = injector
            .privatize(sum, &mut ChaCha8Rng::seed_from_u64(5))
            .expect("update");
        let mut expected = vec![1.0, 1.0];
        add_gaussian_noise(&mut expected, 1.0, &mut ChaCha8Rng::seed_from_u64(5)).expect("noise");
        for (got, want) in update.view().iter().zip(expected.iter()) {
            assert!(((*got as f64) - want / 4.0).abs() < 1e-6);
        }
    }

    #[test]
    fn threshold_mismatch_is_rejected() {
        let injector = NoiseInjector::new(2.0, 1.0).expect("injector");
        let batch = clipped(array![[1.0]], 1.0);
        assert!(injector
            .inject(batch, &mut ChaCha8Rng::seed_from_u64(1))
            .is_err());
    }
}
