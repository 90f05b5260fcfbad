//! Session configuration supplied by the host application.

use dp_engine_accounting::{
    steps_for_epochs, AccountantKind, LedgerSnapshot, NoiseCalibrator, PrivacyAccountant,
    StepRecord,
};
use dp_engine_core::{DpError, Result};
use serde::{Deserialize, Serialize};

/// Parameters of one differentially private training session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrivacyConfig {
    /// L2 clipping threshold `C`.
    pub max_grad_norm: f64,
    /// Target epsilon for the whole schedule.
    pub target_epsilon: f64,
    /// Target delta.
    pub target_delta: f64,
    /// Passes over the data; may be fractional.
    pub epochs: f64,
    /// Poisson sampling rate of one physical batch.
    pub sample_rate: f64,
    /// Fixed noise multiplier; calibrated from the targets when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_multiplier: Option<f64>,
    /// Noise seed; OS entropy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Privacy analysis used for calibration and reporting.
    #[serde(default)]
    pub accountant: AccountantKind,
    /// Refuse any step that would take epsilon past `target_epsilon`.
    #[serde(default)]
    pub enforce_budget: bool,
    /// Average by this fixed batch size instead of the realized one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_batch_size: Option<usize>,
}

impl PrivacyConfig {
    /// A config with the required fields and default options.
    pub fn new(
        max_grad_norm: f64,
        target_epsilon: f64,
        target_delta: f64,
        epochs: f64,
        sample_rate: f64,
    ) -> Self {
        Self {
            max_grad_norm,
            target_epsilon,
            target_delta,
            epochs,
            sample_rate,
            noise_multiplier: None,
            seed: None,
            accountant: AccountantKind::default(),
            enforce_budget: false,
            expected_batch_size: None,
        }
    }

    /// Fix the noise multiplier instead of calibrating it.
    pub fn with_noise_multiplier(mut self, noise_multiplier: f64) -> Self {
        self.noise_multiplier = Some(noise_multiplier);
        self
    }

    /// Seed the noise for a reproducible session.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Choose the accountant.
    pub fn with_accountant(mut self, accountant: AccountantKind) -> Self {
        self.accountant = accountant;
        self
    }

    /// Stop training once the budget is spent.
    pub fn with_enforce_budget(mut self, enforce: bool) -> Self {
        self.enforce_budget = enforce;
        self
    }

    /// Normalize updates by a fixed expected batch size.
    pub fn with_expected_batch_size(mut self, batch_size: usize) -> Self {
        self.expected_batch_size = Some(batch_size);
        self
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.max_grad_norm.is_finite() || self.max_grad_norm <= 0.0 {
            return Err(DpError::config("max_grad_norm must be positive and finite"));
        }
        if !self.target_epsilon.is_finite() || self.target_epsilon <= 0.0 {
            return Err(DpError::config("target_epsilon must be positive and finite"));
        }
        if !self.target_delta.is_finite() || self.target_delta <= 0.0 || self.target_delta >= 1.0 {
            return Err(DpError::config("target_delta must be in (0, 1)"));
        }
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 || self.sample_rate > 1.0 {
            return Err(DpError::config("sample_rate must be in (0, 1]"));
        }
        if let Some(noise) = self.noise_multiplier {
            if !noise.is_finite() || noise <= 0.0 {
                return Err(DpError::config("noise_multiplier must be positive and finite"));
            }
            if !(noise * noise).is_normal() {
                return Err(DpError::config(format!(
                    "noise_multiplier {noise} is too small to account for"
                )));
            }
        }
        if self.expected_batch_size == Some(0) {
            return Err(DpError::config("expected_batch_size must be positive"));
        }
        self.total_steps()?;
        Ok(())
    }

    /// Planned optimizer steps: `⌊epochs / sample_rate⌋`.
    pub fn total_steps(&self) -> Result<u64> {
        steps_for_epochs(self.epochs, self.sample_rate)
    }

    /// Epsilon of the full planned schedule at `noise_multiplier`.
    pub fn resulting_epsilon<A: PrivacyAccountant + ?Sized>(
        &self,
        accountant: &A,
        noise_multiplier: f64,
    ) -> Result<f64> {
        let record = StepRecord::new(self.sample_rate, noise_multiplier)?;
        let ledger = LedgerSnapshot::uniform(record, self.total_steps()?);
        accountant.compute_epsilon(&ledger, self.target_delta)
    }

    /// The session noise multiplier: the fixed value if it fits the budget,
    /// otherwise the calibrated one.
    pub fn resolve_noise_multiplier<A: PrivacyAccountant + ?Sized>(
        &self,
        accountant: &A,
    ) -> Result<f64> {
        if let Some(noise) = self.noise_multiplier {
            let eps = self.resulting_epsilon(accountant, noise)?;
            if eps > self.target_epsilon {
                return Err(DpError::config(format!(
                    "noise_multiplier {noise} spends epsilon {eps:.4} over the planned \
                     schedule, above target_epsilon {}",
                    self.target_epsilon
                )));
            }
            return Ok(noise);
        }
        NoiseCalibrator::new(accountant).calibrate(
            self.target_epsilon,
            self.target_delta,
            self.sample_rate,
            self.total_steps()?,
        )
    }
}
