//! The accountant capability shared by every privacy analysis.

use std::sync::Arc;

use dp_engine_core::{DpError, Result};
use serde::{Deserialize, Serialize};

use crate::gdp::GdpAccountant;
use crate::ledger::LedgerSnapshot;
use crate::rdp::RdpAccountant;

/// Cumulative `(ε, δ)` guarantee of a ledger.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PrivacySpend {
    /// Privacy loss `ε`.
    pub epsilon: f64,
    /// Failure probability `δ`.
    pub delta: f64,
    /// Optimal Rényi order, for accountants that optimize over one.
    pub order: Option<f64>,
}

/// Converts a ledger of steps into an `(ε, δ)` guarantee.
///
/// Implementations are stateless with respect to the ledger: every query
/// recomputes from the snapshot it is given.
pub trait PrivacyAccountant: Send + Sync {
    /// Short name of the analysis, e.g. `"rdp"`.
    fn mechanism(&self) -> &'static str;

    /// Full `(ε, δ)` spend of `ledger` at `delta`.
    fn privacy_spent(&self, ledger: &LedgerSnapshot, delta: f64) -> Result<PrivacySpend>;

    /// `ε` of `ledger` at `delta`.
    fn compute_epsilon(&self, ledger: &LedgerSnapshot, delta: f64) -> Result<f64> {
        Ok(self.privacy_spent(ledger, delta)?.epsilon)
    }
}

impl<A: PrivacyAccountant + ?Sized> PrivacyAccountant for Box<A> {
    fn mechanism(&self) -> &'static str {
        (**self).mechanism()
    }

    fn privacy_spent(&self, ledger: &LedgerSnapshot, delta: f64) -> Result<PrivacySpend> {
        (**self).privacy_spent(ledger, delta)
    }
}

impl<A: PrivacyAccountant + ?Sized> PrivacyAccountant for Arc<A> {
    fn mechanism(&self) -> &'static str {
        (**self).mechanism()
    }

    fn privacy_spent(&self, ledger: &LedgerSnapshot, delta: f64) -> Result<PrivacySpend> {
        (**self).privacy_spent(ledger, delta)
    }
}

/// Selects an accountant by name in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountantKind {
    /// Rényi DP over the default orders.
    #[default]
    Rdp,
    /// Gaussian DP central-limit approximation.
    Gdp,
}

impl AccountantKind {
    /// A fresh accountant of this kind with default settings.
    pub fn build(self) -> Arc<dyn PrivacyAccountant> {
        match self {
            Self::Rdp => Arc::new(RdpAccountant::new()),
            Self::Gdp => Arc::new(GdpAccountant::new()),
        }
    }
}

pub(crate) fn check_delta(delta: f64) -> Result<()> {
    if !delta.is_finite() || delta <= 0.0 || delta >= 1.0 {
        return Err(DpError::config(format!("delta must be in (0, 1), got {delta}")));
    }
    Ok(())
}
