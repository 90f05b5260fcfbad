//! The DP-SGD training session.
//!
//! A [`PrivacyEngine`] wires the clipper, noise injector, privacy ledger and
//! accountant around a host model. Each [`PrivacyEngine::step`] runs
//! gradients → clip → sum → noise → ledger → optimizer, in that order. A
//! step is recorded as soon as its noise is drawn, even if the optimizer
//! then fails.

use std::sync::Arc;

use dp_engine_accounting::{
    LedgerReader, LedgerSnapshot, PrivacyAccountant, PrivacyLedger, PrivacySpend, StepRecord,
};
use dp_engine_core::{
    ClippedSum, DpError, GradientClipper, GradientSampler, NoiseInjector, Normalization,
    Optimizer, Parameters, PrivateUpdate, Result,
};
use dp_engine_prng::NoiseKey;
use tracing::{debug, info};

use crate::config::PrivacyConfig;

/// Outcome of one optimizer step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    /// 1-based index of the step just taken.
    pub step: u64,
    /// Sampling rate recorded for the step.
    pub sampling_rate: f64,
    /// Noise multiplier recorded for the step.
    pub noise_multiplier: f64,
    /// The privatized update that was applied.
    pub update: PrivateUpdate,
}

/// Differentially private training session over a host model.
pub struct PrivacyEngine<O, A: ?Sized = dyn PrivacyAccountant> {
    config: PrivacyConfig,
    optimizer: O,
    accountant: Arc<A>,
    clipper: GradientClipper,
    injector: NoiseInjector,
    ledger: PrivacyLedger,
    key: NoiseKey,
    pending: Option<ClippedSum>,
}

impl<O: Optimizer> PrivacyEngine<O> {
    /// Set up a session using the accountant named in `config`.
    pub fn new(config: PrivacyConfig, optimizer: O) -> Result<Self> {
        let accountant = config.accountant.build();
        Self::with_accountant(config, optimizer, accountant)
    }
}

impl<O: Optimizer, A: PrivacyAccountant + ?Sized> PrivacyEngine<O, A> {
    /// Set up a session with an explicit accountant.
    ///
    /// Fails closed: an invalid config, an over-budget fixed noise multiplier
    /// or an infeasible calibration all abort setup.
    pub fn with_accountant(config: PrivacyConfig, optimizer: O, accountant: Arc<A>) -> Result<Self> {
        config.validate()?;
        let noise_multiplier = config.resolve_noise_multiplier(&*accountant)?;
        let clipper = GradientClipper::new(config.max_grad_norm)?;
        let normalization = config
            .expected_batch_size
            .map_or(Normalization::BatchSize, Normalization::Expected);
        let injector =
            NoiseInjector::new(config.max_grad_norm, noise_multiplier)?.with_normalization(normalization)?;
        let key = config.seed.map_or_else(NoiseKey::from_entropy, NoiseKey::new);
        let total_steps = config.total_steps()?;

        info!(
            accountant = accountant.mechanism(),
            noise_multiplier,
            max_grad_norm = config.max_grad_norm,
            sample_rate = config.sample_rate,
            total_steps,
            seeded = config.seed.is_some(),
            "privacy engine ready"
        );
        Ok(Self {
            config,
            optimizer,
            accountant,
            clipper,
            injector,
            ledger: PrivacyLedger::new(),
            key,
            pending: None,
        })
    }

    /// Take one private optimizer step on `batch`, folding in any batches
    /// buffered by [`accumulate`](Self::accumulate).
    pub fn step<M, B>(&mut self, model: &mut M, batch: &B) -> Result<StepReport>
    where
        M: Parameters + GradientSampler<B>,
        B: ?Sized,
    {
        // Buffered batches belong to this step whether or not it succeeds.
        let pending = self.pending.take();
        let sum = self.clipped_sum(model, batch)?;
        let total = match pending {
            Some(mut pending) => {
                pending.merge(sum)?;
                pending
            }
            None => sum,
        };

        let sampling_rate = (self.config.sample_rate * total.batches() as f64).min(1.0);
        let record = StepRecord::new(sampling_rate, self.injector.noise_multiplier())?;
        let snapshot = self.ledger.snapshot();
        if self.config.enforce_budget {
            let delta = self.config.target_delta;
            let eps = self
                .accountant
                .compute_epsilon(&snapshot.with_step(record), delta)?;
            if eps > self.config.target_epsilon {
                return Err(DpError::BudgetExhausted { eps, delta });
            }
        }

        let step_index = snapshot.len();
        let mut rng = self.key.stream(step_index);
        let update = self.injector.privatize(total, &mut rng)?;
        self.ledger.append(record);
        self.optimizer.apply(model.parameters_mut(), &update)?;

        debug!(
            step = step_index + 1,
            sampling_rate,
            noise_multiplier = record.noise_multiplier(),
            "private step"
        );
        Ok(StepReport {
            step: step_index + 1,
            sampling_rate,
            noise_multiplier: record.noise_multiplier(),
            update,
        })
    }

    /// Clip and buffer a physical batch without stepping. Returns the number
    /// of buffered batches.
    pub fn accumulate<M, B>(&mut self, model: &mut M, batch: &B) -> Result<usize>
    where
        M: Parameters + GradientSampler<B>,
        B: ?Sized,
    {
        let sum = self.clipped_sum(model, batch)?;
        match self.pending.as_mut() {
            Some(pending) => pending.merge(sum)?,
            None => self.pending = Some(sum),
        }
        Ok(self.pending_batches())
    }

    fn clipped_sum<M, B>(&self, model: &mut M, batch: &B) -> Result<ClippedSum>
    where
        M: Parameters + GradientSampler<B>,
        B: ?Sized,
    {
        let grads = model.per_example_gradients(batch)?;
        let expected = model.parameter_count();
        if grads.parameter_count() != expected {
            return Err(DpError::invalid(format!(
                "gradients have {} columns but the model has {expected} parameters",
                grads.parameter_count()
            )));
        }
        Ok(self.clipper.clip(grads)?.into_sum())
    }

    /// `ε` spent so far at `delta`, from a fresh ledger snapshot.
    pub fn get_epsilon(&self, delta: f64) -> Result<f64> {
        self.accountant.compute_epsilon(&self.ledger.snapshot(), delta)
    }

    /// Full spend so far at `delta`.
    pub fn privacy_spent(&self, delta: f64) -> Result<PrivacySpend> {
        self.accountant.privacy_spent(&self.ledger.snapshot(), delta)
    }

    /// A handle other threads can use to watch the budget.
    pub fn monitor(&self) -> PrivacyMonitor<A> {
        PrivacyMonitor {
            reader: self.ledger.reader(),
            accountant: Arc::clone(&self.accountant),
            delta: self.config.target_delta,
        }
    }

    /// Read-only view of the ledger.
    pub fn ledger(&self) -> LedgerReader {
        self.ledger.reader()
    }

    /// Steps taken so far.
    pub fn steps(&self) -> u64 {
        self.ledger.len()
    }

    /// Physical batches buffered for the next step.
    pub fn pending_batches(&self) -> usize {
        self.pending.as_ref().map_or(0, ClippedSum::batches)
    }

    /// The session noise multiplier.
    pub fn noise_multiplier(&self) -> f64 {
        self.injector.noise_multiplier()
    }

    /// The clipping threshold.
    pub fn max_grad_norm(&self) -> f64 {
        self.clipper.max_grad_norm()
    }

    /// The session config.
    pub fn config(&self) -> &PrivacyConfig {
        &self.config
    }

    /// The accountant used for reporting and budget checks.
    pub fn accountant(&self) -> &A {
        &self.accountant
    }

    /// The optimizer.
    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Clear the ledger and buffered batches. Unseeded sessions get a fresh
    /// noise key.
    pub fn reset(&mut self) {
        self.ledger.reset();
        self.pending = None;
        if self.config.seed.is_none() {
            self.key = NoiseKey::from_entropy();
        }
        info!("privacy engine reset");
    }

    /// Checkpoint the ledger.
    pub fn ledger_state(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    /// Resume a fresh (or reset) session from a checkpointed ledger.
    ///
    /// Fails with `Configuration` once the session has stepped or buffered
    /// batches, since that history would be lost.
    pub fn restore_ledger(&mut self, snapshot: LedgerSnapshot) -> Result<()> {
        if self.pending.is_some() {
            return Err(DpError::config(
                "cannot restore a checkpoint while batches are buffered; reset first",
            ));
        }
        let steps = snapshot.len();
        self.ledger.restore(snapshot)?;
        info!(steps, "ledger restored");
        Ok(())
    }
}

impl<O, A: ?Sized> std::fmt::Debug for PrivacyEngine<O, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivacyEngine")
            .field("config", &self.config)
            .field("noise_multiplier", &self.injector.noise_multiplier())
            .field("steps", &self.ledger.len())
            .finish_non_exhaustive()
    }
}

/// Thread-safe, read-only view of a session's privacy spend.
pub struct PrivacyMonitor<A: ?Sized = dyn PrivacyAccountant> {
    reader: LedgerReader,
    accountant: Arc<A>,
    delta: f64,
}

impl<A: ?Sized> Clone for PrivacyMonitor<A> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            accountant: Arc::clone(&self.accountant),
            delta: self.delta,
        }
    }
}

impl<A: PrivacyAccountant + ?Sized> PrivacyMonitor<A> {
    /// `ε` at the session's target delta.
    pub fn epsilon(&self) -> Result<f64> {
        self.epsilon_at(self.delta)
    }

    /// `ε` at an arbitrary delta.
    pub fn epsilon_at(&self, delta: f64) -> Result<f64> {
        self.accountant.compute_epsilon(&self.reader.snapshot(), delta)
    }

    /// Full spend at an arbitrary delta.
    pub fn privacy_spent(&self, delta: f64) -> Result<PrivacySpend> {
        self.accountant.privacy_spent(&self.reader.snapshot(), delta)
    }

    /// Steps recorded so far.
    pub fn steps(&self) -> u64 {
        self.reader.len()
    }
}

impl<A: ?Sized> std::fmt::Debug for PrivacyMonitor<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivacyMonitor")
            .field("steps", &self.reader.len())
            .field("delta", &self.delta)
            .finish_non_exhaustive()
    }
}
