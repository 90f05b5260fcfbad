#![allow(dead_code)]

use dp_engine::{
    GradientSampler, Parameters, PerExampleGradients, PrivacyConfig, Result, Scalar, Tensor,
};

/// One `(features, target)` pair.
pub type Example = (Vec<Scalar>, Scalar);

/// Least-squares linear model with explicit per-example gradients.
pub struct Linear {
    pub weights: Tensor,
}

impl Linear {
    pub fn new(dim: usize) -> Self {
        Self {
            weights: Tensor::zeros(dim),
        }
    }
}

impl Parameters for Linear {
    fn parameter_count(&self) -> usize {
        self.weights.len()
    }

    fn parameters_mut(&mut self) -> &mut Tensor {
        &mut self.weights
    }
}

impl GradientSampler<[Example]> for Linear {
    fn per_example_gradients(&mut self, batch: &[Example]) -> Result<PerExampleGradients> {
        let rows: Vec<Vec<Scalar>> = batch
            .iter()
            .map(|(x, y)| {
                let pred: Scalar = x.iter().zip(self.weights.iter()).map(|(a, w)| a * w).sum();
                let residual = 2.0 * (pred - y);
                x.iter().map(|a| residual * a).collect()
            })
            .collect();
        PerExampleGradients::from_rows(rows, self.weights.len())
    }
}

pub fn batch() -> Vec<Example> {
    vec![
        (vec![1.0, 0.0, 2.0], 1.0),
        (vec![0.0, 1.0, -1.0], -2.0),
        (vec![3.0, 3.0, 0.5], 4.0),
        (vec![-1.0, 0.5, 0.0], 0.0),
    ]
}

pub fn config() -> PrivacyConfig {
    PrivacyConfig::new(1.0, 8.0, 1e-5, 1.0, 0.05)
        .with_noise_multiplier(1.1)
        .with_seed(42)
}
