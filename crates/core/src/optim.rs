//! Optimizers that consume privatized updates.

use crate::error::{DpError, Result};
use crate::noise::PrivateUpdate;
use crate::tensor::{Scalar, Tensor};

/// Applies a privatized update direction to a parameter vector.
///
/// Optimizers only ever see [`PrivateUpdate`]s, never per-example gradients.
pub trait Optimizer {
    /// Apply one update step in-place.
    fn apply(&mut self, params: &mut Tensor, update: &PrivateUpdate) -> Result<()>;
}

/// Stochastic gradient descent with optional heavy-ball momentum.
#[derive(Clone, Debug)]
pub struct Sgd {
    learning_rate: f64,
    momentum: f64,
    velocity: Option<Tensor>,
}

impl Sgd {
    /// Plain SGD.
    pub fn new(learning_rate: f64) -> Result<Self> {
        Self::with_momentum(learning_rate, 0.0)
    }

    /// SGD with momentum in `[0, 1)`.
    pub fn with_momentum(learning_rate: f64, momentum: f64) -> Result<Self> {
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(DpError::config("learning_rate must be positive and finite"));
        }
        if !momentum.is_finite() || !(0.0..1.0).contains(&momentum) {
            return Err(DpError::config("momentum must be in [0, 1)"));
        }
        Ok(Self {
            learning_rate,
            momentum,
            velocity: None,
        })
    }

    /// The learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

impl Optimizer for Sgd {
    fn apply(&mut self, params: &mut Tensor, update: &PrivateUpdate) -> Result<()> {
        if params.len() != update.len() {
            return Err(DpError::invalid(format!(
                "update has {} coordinates but the model has {}",
                update.len(),
                params.len()
            )));
        }
        let lr = self.learning_rate as Scalar;
        if self.momentum == 0.0 {
            params.scaled_add(-lr, &update.view());
            return Ok(());
        }

        let mu = self.momentum as Scalar;
        let velocity = self
            .velocity
            .get_or_insert_with(|| Tensor::zeros(params.len()));
        velocity.zip_mut_with(&update.view(), |v, &g| *v = mu * *v + g);
        params.scaled_add(-lr, &*velocity);
        Ok(())
    }
}
