//! Train a least-squares model with DP-SGD under Poisson sampling.
//!
//! Run with `RUST_LOG=dp_engine=debug` to see per-step events.

use dp_engine::{
    DpError, GradientSampler, Parameters, PerExampleGradients, PrivacyConfig, PrivacyEngine,
    Result, Scalar, Sgd, Tensor,
};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DIM: usize = 4;
const EXAMPLES: usize = 2_000;

struct Linear {
    weights: Tensor,
}

impl Parameters for Linear {
    fn parameter_count(&self) -> usize {
        self.weights.len()
    }

    fn parameters_mut(&mut self) -> &mut Tensor {
        &mut self.weights
    }
}

impl GradientSampler<[(Vec<Scalar>, Scalar)]> for Linear {
    fn per_example_gradients(
        &mut self,
        batch: &[(Vec<Scalar>, Scalar)],
    ) -> Result<PerExampleGradients> {
        let rows: Vec<Vec<Scalar>> = batch
            .iter()
            .map(|(x, y)| {
                let pred: Scalar = x.iter().zip(self.weights.iter()).map(|(a, w)| a * w).sum();
                x.iter().map(|a| 2.0 * (pred - y) * a).collect()
            })
            .collect();
        PerExampleGradients::from_rows(rows, DIM)
    }
}

fn mse(model: &Linear, data: &[(Vec<Scalar>, Scalar)]) -> f64 {
    let total: f64 = data
        .iter()
        .map(|(x, y)| {
            let pred: Scalar = x.iter().zip(model.weights.iter()).map(|(a, w)| a * w).sum();
            ((pred - y) as f64).powi(2)
        })
        .sum();
    total / data.len() as f64
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let feature = Normal::new(0.0, 1.0)?;
    let label_noise = Normal::new(0.0, 0.1)?;
    let truth = [0.5, -1.0, 2.0, 0.0];
    let data: Vec<(Vec<Scalar>, Scalar)> = (0..EXAMPLES)
        .map(|_| {
            let x: Vec<f64> = (0..DIM).map(|_| feature.sample(&mut rng)).collect();
            let y = x.iter().zip(truth).map(|(a, w)| a * w).sum::<f64>()
                + label_noise.sample(&mut rng);
            (x.into_iter().map(|v| v as Scalar).collect(), y as Scalar)
        })
        .collect();

    let sample_rate = 0.02;
    let config = PrivacyConfig::new(1.0, 3.0, 1e-5, 5.0, sample_rate)
        .with_seed(2024)
        .with_expected_batch_size((EXAMPLES as f64 * sample_rate) as usize)
        .with_enforce_budget(true);
    let total_steps = config.total_steps()?;
    let mut engine = PrivacyEngine::new(config, Sgd::with_momentum(0.1, 0.9)?)?;
    let mut model = Linear {
        weights: Tensor::zeros(DIM),
    };
    info!(
        noise_multiplier = engine.noise_multiplier(),
        total_steps, "starting private training"
    );

    let monitor = engine.monitor();
    for step in 0..total_steps {
        // Poisson sampling: every example joins independently.
        let batch: Vec<_> = data
            .iter()
            .filter(|_| rng.gen_bool(sample_rate))
            .cloned()
            .collect();
        match engine.step(&mut model, &batch[..]) {
            Ok(_) => {}
            Err(DpError::BudgetExhausted { eps, .. }) => {
                info!(step, eps, "budget exhausted, stopping");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        if (step + 1) % 50 == 0 {
            let epsilon = monitor.epsilon()?;
            info!(step = step + 1, epsilon, mse = mse(&model, &data), "progress");
        }
    }

    let spend = engine.privacy_spent(1e-5)?;
    println!(
        "trained {} steps: eps={:.3} (order {:?}), mse={:.4}",
        engine.steps(),
        spend.epsilon,
        spend.order,
        mse(&model, &data)
    );
    Ok(())
}
