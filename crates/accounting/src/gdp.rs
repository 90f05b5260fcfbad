//! Gaussian DP accounting via the central limit theorem (Dong, Roth & Su 2019).

use std::f64::consts::{LN_2, SQRT_2};

use dp_engine_core::{DpError, Result};

use crate::accountant::{check_delta, PrivacyAccountant, PrivacySpend};
use crate::ledger::LedgerSnapshot;
use crate::rdp::log_erfc;

const MAX_EPSILON: f64 = 500.0;
const BISECTION_STEPS: usize = 200;

/// Asymptotic μ-GDP accountant for a homogeneous Poisson-subsampled
/// Gaussian ledger.
#[derive(Clone, Copy, Debug, Default)]
pub struct GdpAccountant;

impl GdpAccountant {
    /// Create the accountant.
    pub fn new() -> Self {
        Self
    }

    /// μ of `steps` compositions at rate `q` and noise multiplier `σ`.
    pub fn mu(sampling_rate: f64, noise_multiplier: f64, steps: u64) -> f64 {
        let per_step = (1.0 / (noise_multiplier * noise_multiplier)).exp_m1().sqrt();
        sampling_rate * (steps as f64).sqrt() * per_step
    }
}

impl PrivacyAccountant for GdpAccountant {
    fn mechanism(&self) -> &'static str {
        "gdp"
    }

    fn privacy_spent(&self, ledger: &LedgerSnapshot, delta: f64) -> Result<PrivacySpend> {
        check_delta(delta)?;
        let run = match ledger.runs() {
            [] => {
                return Ok(PrivacySpend {
                    epsilon: 0.0,
                    delta,
                    order: None,
                })
            }
            [run] => *run,
            _ => {
                return Err(DpError::unsupported(
                    "GDP accounting needs a constant sampling rate and noise multiplier",
                ))
            }
        };

        let mu = Self::mu(
            run.record.sampling_rate(),
            run.record.noise_multiplier(),
            run.count,
        );
        if !mu.is_finite() {
            return Err(DpError::numerical(format!("GDP mu is not finite ({mu})")));
        }

        let log_delta = delta.ln();
        if log_delta_for(0.0, mu) <= log_delta {
            return Ok(PrivacySpend {
                epsilon: 0.0,
                delta,
                order: None,
            });
        }
        if log_delta_for(MAX_EPSILON, mu) > log_delta {
            return Err(DpError::numerical(format!(
                "GDP epsilon exceeds {MAX_EPSILON} (mu={mu:.4})"
            )));
        }

        // δ(ε) is decreasing; keep hi feasible.
        let (mut lo, mut hi) = (0.0, MAX_EPSILON);
        for _ in 0..BISECTION_STEPS {
            if hi - lo <= 1e-12 * hi.max(1.0) {
                break;
            }
            let mid = 0.5 * (lo + hi);
            if log_delta_for(mid, mu) > log_delta {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(PrivacySpend {
            epsilon: hi,
            delta,
            order: None,
        })
    }
}

/// `ln Φ(x)` for the standard normal.
fn log_ndtr(x: f64) -> f64 {
    -LN_2 + log_erfc(-x / SQRT_2)
}

/// `ln δ(ε)` for μ-GDP: `δ = Φ(−ε/μ + μ/2) − e^ε Φ(−ε/μ − μ/2)`.
fn log_delta_for(epsilon: f64, mu: f64) -> f64 {
    let a = log_ndtr(-epsilon / mu + mu / 2.0);
    let b = epsilon + log_ndtr(-epsilon / mu - mu / 2.0);
    if b >= a {
        return f64::NEG_INFINITY;
    }
    a + (-(b - a).exp()).ln_1p()
}
