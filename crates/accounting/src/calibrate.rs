//! Noise multiplier calibration against a target `(ε, δ)` budget.

use dp_engine_core::{DpError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::accountant::{check_delta, PrivacyAccountant};
use crate::ledger::{LedgerSnapshot, StepRecord};
use crate::rdp::RdpAccountant;

/// Search bounds and tolerances for [`NoiseCalibrator`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationConfig {
    /// Smallest noise multiplier considered.
    pub min_noise: f64,
    /// Initial upper bracket.
    pub max_noise: f64,
    /// The upper bracket is doubled at most up to this value.
    pub noise_ceiling: f64,
    /// Stop once `target − ε(σ)` is within this slack.
    pub epsilon_tolerance: f64,
    /// Stop once the bracket is narrower than this.
    pub noise_tolerance: f64,
    /// Bisection iteration cap.
    pub max_iterations: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_noise: 0.01,
            max_noise: 100.0,
            noise_ceiling: 1e6,
            epsilon_tolerance: 0.01,
            noise_tolerance: 1e-9,
            max_iterations: 200,
        }
    }
}

impl CalibrationConfig {
    fn validate(&self) -> Result<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.min_noise) || !positive(self.max_noise) || !positive(self.noise_ceiling) {
            return Err(DpError::config("calibration noise bounds must be positive"));
        }
        if self.min_noise >= self.max_noise || self.max_noise > self.noise_ceiling {
            return Err(DpError::config(
                "calibration bounds must satisfy min_noise < max_noise <= noise_ceiling",
            ));
        }
        if !positive(self.epsilon_tolerance) || !positive(self.noise_tolerance) {
            return Err(DpError::config("calibration tolerances must be positive"));
        }
        if self.max_iterations == 0 {
            return Err(DpError::config("max_iterations must be at least 1"));
        }
        Ok(())
    }
}

/// Finds the smallest noise multiplier whose ledger stays within budget.
#[derive(Debug)]
pub struct NoiseCalibrator<'a, A: ?Sized> {
    accountant: &'a A,
    config: CalibrationConfig,
}

impl<'a, A: PrivacyAccountant + ?Sized> NoiseCalibrator<'a, A> {
    /// Calibrate against `accountant` with default bounds.
    pub fn new(accountant: &'a A) -> Self {
        Self {
            accountant,
            config: CalibrationConfig::default(),
        }
    }

    /// Override search bounds and tolerances.
    pub fn with_config(mut self, config: CalibrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Smallest σ (up to tolerance) such that `total_steps` steps at
    /// `sampling_rate` satisfy `ε(σ) ≤ target_epsilon` at `target_delta`.
    ///
    /// The returned σ is always on the feasible side of the bracket.
    pub fn calibrate(
        &self,
        target_epsilon: f64,
        target_delta: f64,
        sampling_rate: f64,
        total_steps: u64,
    ) -> Result<f64> {
        if !target_epsilon.is_finite() || target_epsilon <= 0.0 {
            return Err(DpError::config(format!(
                "target_epsilon must be positive and finite, got {target_epsilon}"
            )));
        }
        check_delta(target_delta)?;
        if !sampling_rate.is_finite() || sampling_rate <= 0.0 || sampling_rate > 1.0 {
            return Err(DpError::config(format!(
                "sampling_rate must be in (0, 1], got {sampling_rate}"
            )));
        }
        if total_steps == 0 {
            return Err(DpError::config("total_steps must be at least 1"));
        }
        self.config.validate()?;
        let cfg = &self.config;

        let epsilon_for = |sigma: f64| -> Result<f64> {
            let record = StepRecord::new(sampling_rate, sigma)?;
            let ledger = LedgerSnapshot::uniform(record, total_steps);
            match self.accountant.compute_epsilon(&ledger, target_delta) {
                Err(DpError::Numerical { .. }) => Ok(f64::INFINITY),
                other => other,
            }
        };

        let eps_min = epsilon_for(cfg.min_noise)?;
        if eps_min <= target_epsilon {
            warn!(
                noise_multiplier = cfg.min_noise,
                epsilon = eps_min,
                target_epsilon,
                "minimum noise multiplier already meets the target"
            );
            return Ok(cfg.min_noise);
        }

        let mut lo = cfg.min_noise;
        let mut hi = cfg.max_noise;
        let mut eps_hi = epsilon_for(hi)?;
        while eps_hi > target_epsilon {
            if hi >= cfg.noise_ceiling {
                return Err(DpError::calibration(format!(
                    "no noise multiplier up to {} reaches epsilon {target_epsilon} \
                     (delta={target_delta}, q={sampling_rate}, steps={total_steps})",
                    cfg.noise_ceiling
                )));
            }
            lo = hi;
            hi = (hi * 2.0).min(cfg.noise_ceiling);
            eps_hi = epsilon_for(hi)?;
        }

        let mut iterations = 0;
        while iterations < cfg.max_iterations
            && target_epsilon - eps_hi > cfg.epsilon_tolerance
            && hi - lo > cfg.noise_tolerance
        {
            let mid = 0.5 * (lo + hi);
            let eps_mid = epsilon_for(mid)?;
            if eps_mid <= target_epsilon {
                hi = mid;
                eps_hi = eps_mid;
            } else {
                lo = mid;
            }
            iterations += 1;
        }

        info!(
            accountant = self.accountant.mechanism(),
            noise_multiplier = hi,
            epsilon = eps_hi,
            target_epsilon,
            target_delta,
            iterations,
            "calibrated noise multiplier"
        );
        Ok(hi)
    }
}

/// Calibrate with the default RDP accountant and bounds.
pub fn calibrate_noise_multiplier(
    target_epsilon: f64,
    target_delta: f64,
    sampling_rate: f64,
    total_steps: u64,
) -> Result<f64> {
    NoiseCalibrator::new(&RdpAccountant::new()).calibrate(
        target_epsilon,
        target_delta,
        sampling_rate,
        total_steps,
    )
}

/// Number of optimizer steps in `epochs` passes at `sample_rate`:
/// `⌊epochs / sample_rate⌋`.
pub fn steps_for_epochs(epochs: f64, sample_rate: f64) -> Result<u64> {
    if !epochs.is_finite() || epochs <= 0.0 {
        return Err(DpError::config(format!("epochs must be positive, got {epochs}")));
    }
    if !sample_rate.is_finite() || sample_rate <= 0.0 || sample_rate > 1.0 {
        return Err(DpError::config(format!(
            "sampling_rate must be in (0, 1], got {sample_rate}"
        )));
    }
    let steps = (epochs / sample_rate).floor();
    if steps < 1.0 || steps > u64::MAX as f64 {
        return Err(DpError::config(format!(
            "{epochs} epochs at rate {sample_rate} is not a usable step count"
        )));
    }
    Ok(steps as u64)
}
