//! Append-only record of the privacy-relevant parameters of each step.

use std::iter;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dp_engine_core::{DpError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Sampling rate and noise multiplier of one optimizer step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStepRecord")]
pub struct StepRecord {
    sampling_rate: f64,
    noise_multiplier: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStepRecord {
    sampling_rate: f64,
    noise_multiplier: f64,
}

impl TryFrom<RawStepRecord> for StepRecord {
    type Error = DpError;

    fn try_from(raw: RawStepRecord) -> Result<Self> {
        Self::new(raw.sampling_rate, raw.noise_multiplier)
    }
}

impl StepRecord {
    /// Validate and build a record. `q` must lie in `(0, 1]` and `σ > 0`.
    pub fn new(sampling_rate: f64, noise_multiplier: f64) -> Result<Self> {
        if !sampling_rate.is_finite() || sampling_rate <= 0.0 || sampling_rate > 1.0 {
            return Err(DpError::invalid(format!(
                "sampling_rate must be in (0, 1], got {sampling_rate}"
            )));
        }
        if !noise_multiplier.is_finite() || noise_multiplier <= 0.0 {
            return Err(DpError::invalid(format!(
                "noise_multiplier must be positive and finite, got {noise_multiplier}"
            )));
        }
        Ok(Self {
            sampling_rate,
            noise_multiplier,
        })
    }

    /// Poisson sampling probability `q`.
    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Noise multiplier `σ`.
    pub fn noise_multiplier(&self) -> f64 {
        self.noise_multiplier
    }
}

/// `count` consecutive steps sharing one record.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepRun {
    /// The shared record.
    pub record: StepRecord,
    /// Number of steps, always at least one.
    pub count: u64,
}

/// Immutable copy of a ledger at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSnapshot")]
pub struct LedgerSnapshot {
    runs: Vec<StepRun>,
    #[serde(skip)]
    steps: u64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSnapshot {
    runs: Vec<StepRun>,
}

impl TryFrom<RawSnapshot> for LedgerSnapshot {
    type Error = DpError;

    fn try_from(raw: RawSnapshot) -> Result<Self> {
        let mut snapshot = Self::default();
        for run in raw.runs {
            if run.count == 0 {
                return Err(DpError::invalid("ledger run with zero steps"));
            }
            snapshot.push(run.record, run.count);
        }
        Ok(snapshot)
    }
}

impl LedgerSnapshot {
    /// A synthetic ledger of `steps` identical records.
    pub fn uniform(record: StepRecord, steps: u64) -> Self {
        let mut snapshot = Self::default();
        snapshot.push(record, steps);
        snapshot
    }

    /// Total number of recorded steps.
    pub fn len(&self) -> u64 {
        self.steps
    }

    /// Whether no step has been recorded.
    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }

    /// Run-length encoded steps, in order.
    pub fn runs(&self) -> &[StepRun] {
        &self.runs
    }

    /// One record per step, in order.
    pub fn iter(&self) -> impl Iterator<Item = StepRecord> + '_ {
        self.runs
            .iter()
            .flat_map(|run| iter::repeat(run.record).take(run.count as usize))
    }

    /// The first `steps` steps of this ledger.
    pub fn prefix(&self, steps: u64) -> Self {
        let mut out = Self::default();
        let mut remaining = steps;
        for run in &self.runs {
            if remaining == 0 {
                break;
            }
            let take = run.count.min(remaining);
            out.push(run.record, take);
            remaining -= take;
        }
        out
    }

    /// This ledger followed by one more step.
    pub fn with_step(&self, record: StepRecord) -> Self {
        let mut out = self.clone();
        out.push(record, 1);
        out
    }

    /// The latest record, if any.
    pub fn last(&self) -> Option<StepRecord> {
        self.runs.last().map(|run| run.record)
    }

    fn push(&mut self, record: StepRecord, count: u64) {
        if count == 0 {
            return;
        }
        match self.runs.last_mut() {
            Some(run) if run.record == record => run.count += count,
            _ => self.runs.push(StepRun { record, count }),
        }
        self.steps += count;
    }
}

/// The session's privacy ledger.
///
/// Appends go through `&self` under a write lock, so [`LedgerReader`]s on
/// other threads always see whole records.
#[derive(Debug, Default)]
pub struct PrivacyLedger {
    inner: Arc<RwLock<LedgerSnapshot>>,
}

impl PrivacyLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a ledger from a checkpoint.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Validate and append one step.
    pub fn record(&self, sampling_rate: f64, noise_multiplier: f64) -> Result<StepRecord> {
        let record = StepRecord::new(sampling_rate, noise_multiplier)?;
        self.append(record);
        Ok(record)
    }

    /// Append an already validated record.
    pub fn append(&self, record: StepRecord) {
        let mut ledger = self.write();
        ledger.push(record, 1);
        debug!(
            step = ledger.len(),
            sampling_rate = record.sampling_rate,
            noise_multiplier = record.noise_multiplier,
            "ledger append"
        );
    }

    /// Consistent copy of the current ledger.
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.read().clone()
    }

    /// Number of recorded steps.
    pub fn len(&self) -> u64 {
        self.read().len()
    }

    /// Whether no step has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A read-only handle for other threads.
    pub fn reader(&self) -> LedgerReader {
        LedgerReader {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Clear every record. Only used when a session is reset.
    pub fn reset(&self) {
        *self.write() = LedgerSnapshot::default();
    }

    /// Load a checkpoint into an empty ledger.
    ///
    /// Recorded steps are never overwritten: restoring into a ledger that
    /// already holds steps is a `Configuration` error.
    pub fn restore(&self, snapshot: LedgerSnapshot) -> Result<()> {
        let mut ledger = self.write();
        if !ledger.is_empty() {
            return Err(DpError::config(format!(
                "cannot restore a checkpoint over {} recorded steps; reset first",
                ledger.len()
            )));
        }
        *ledger = snapshot;
        Ok(())
    }

    // A poisoned lock still holds a whole ledger: every mutation is a single
    // push or increment.
    fn read(&self) -> RwLockReadGuard<'_, LedgerSnapshot> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerSnapshot> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable read-only view of a [`PrivacyLedger`].
#[derive(Clone, Debug)]
pub struct LedgerReader {
    inner: Arc<RwLock<LedgerSnapshot>>,
}

impl LedgerReader {
    /// Consistent copy of the current ledger.
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded steps.
    pub fn len(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no step has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
