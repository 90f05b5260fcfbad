//! Rényi Differential Privacy accounting for the Poisson-subsampled Gaussian.

use std::f64::consts::{LN_2, PI, SQRT_2};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dp_engine_core::{DpError, Result};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use tracing::{debug, warn};

use crate::accountant::{check_delta, PrivacyAccountant, PrivacySpend};
use crate::ledger::LedgerSnapshot;

/// Terms of the fractional-order series evaluated before giving up.
const MAX_SERIES_TERMS: usize = 100_000;

/// Series terms below `e^{-30}` are dropped.
const SERIES_CUTOFF: f64 = -30.0;

/// Sorted, deduplicated Rényi orders, all `> 1`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct RdpOrders(Vec<f64>);

impl RdpOrders {
    /// Validate a custom order set.
    pub fn new(orders: Vec<f64>) -> Result<Self> {
        if let Some(bad) = orders.iter().find(|a| !a.is_finite() || **a <= 1.0) {
            return Err(DpError::config(format!(
                "Renyi orders must be finite and > 1, got {bad}"
            )));
        }
        let mut orders = orders;
        orders.sort_by(f64::total_cmp);
        orders.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
        if orders.is_empty() {
            return Err(DpError::config("at least one Renyi order is required"));
        }
        Ok(Self(orders))
    }

    /// The orders in ascending order.
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Number of orders.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; an order set is never empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for RdpOrders {
    /// `linspace(1.01, 8, 50)`, then `8..64`, then `linspace(65, 512, 10)`
    /// rounded to integers.
    fn default() -> Self {
        let mut orders = Vec::new();
        orders.extend(linspace(1.01, 8.0, 50));
        orders.extend((8..64).map(f64::from));
        orders.extend(linspace(65.0, 512.0, 10).into_iter().map(f64::round));
        orders.sort_by(f64::total_cmp);
        orders.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
        Self(orders)
    }
}

impl TryFrom<Vec<f64>> for RdpOrders {
    type Error = DpError;

    fn try_from(orders: Vec<f64>) -> Result<Self> {
        Self::new(orders)
    }
}

impl From<RdpOrders> for Vec<f64> {
    fn from(orders: RdpOrders) -> Self {
        orders.0
    }
}

/// How per-order RDP is turned into `(ε, δ)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RdpConversion {
    /// `ε = RDP(α) + ln(1/δ)/(α−1)` (Mironov 2017).
    #[default]
    Classic,
    /// `ε = RDP(α) + ln((α−1)/α) − (ln δ + ln α)/(α−1)` (Balle et al. 2020).
    Improved,
}

impl RdpConversion {
    fn epsilon(self, rdp: f64, alpha: f64, delta: f64) -> f64 {
        match self {
            Self::Classic => rdp + (1.0 / delta).ln() / (alpha - 1.0),
            Self::Improved => {
                let eps = rdp + ((alpha - 1.0) / alpha).ln()
                    - (delta.ln() + alpha.ln()) / (alpha - 1.0);
                eps.max(0.0)
            }
        }
    }
}

/// RDP accountant for privacy composition.
#[derive(Clone, Debug)]
pub struct RdpAccountant {
    orders: RdpOrders,
    conversion: RdpConversion,
    log_factorials: Vec<f64>,
    // Set once the edge-of-grid warning has been emitted.
    edge_order_reported: Arc<AtomicBool>,
}

impl Default for RdpAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl RdpAccountant {
    /// Create an accountant with default Rényi orders.
    pub fn new() -> Self {
        Self::with_orders(RdpOrders::default())
    }

    /// Create an accountant with custom orders.
    pub fn with_orders(orders: RdpOrders) -> Self {
        let max_alpha = orders
            .as_slice()
            .iter()
            .map(|a| a.ceil() as usize)
            .max()
            .unwrap_or(0);
        Self {
            log_factorials: precompute_log_factorials(max_alpha),
            orders,
            conversion: RdpConversion::default(),
            edge_order_reported: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Choose the RDP-to-DP conversion.
    pub fn with_conversion(mut self, conversion: RdpConversion) -> Self {
        self.conversion = conversion;
        self
    }

    /// Active order set.
    pub fn orders(&self) -> &RdpOrders {
        &self.orders
    }

    /// Active conversion.
    pub fn conversion(&self) -> RdpConversion {
        self.conversion
    }

    /// Total RDP of `ledger` at every order.
    pub fn rdp(&self, ledger: &LedgerSnapshot) -> Vec<f64> {
        let mut total = vec![0.0; self.orders.len()];
        for run in ledger.runs() {
            let q = run.record.sampling_rate();
            let sigma = run.record.noise_multiplier();
            let count = run.count as f64;
            for (acc, &alpha) in total.iter_mut().zip(self.orders.as_slice()) {
                let step = compute_rdp(q, sigma, alpha, &self.log_factorials);
                *acc = if step.is_finite() {
                    *acc + step * count
                } else {
                    f64::INFINITY
                };
            }
        }
        total
    }
}

impl PrivacyAccountant for RdpAccountant {
    fn mechanism(&self) -> &'static str {
        "rdp"
    }

    fn privacy_spent(&self, ledger: &LedgerSnapshot, delta: f64) -> Result<PrivacySpend> {
        check_delta(delta)?;
        if ledger.is_empty() {
            return Ok(PrivacySpend {
                epsilon: 0.0,
                delta,
                order: None,
            });
        }

        let orders = self.orders.as_slice();
        let mut best: Option<(usize, f64)> = None;
        for (i, (&alpha, &rdp)) in orders.iter().zip(self.rdp(ledger).iter()).enumerate() {
            let eps = self.conversion.epsilon(rdp, alpha, delta);
            if !eps.is_finite() {
                continue;
            }
            if best.map_or(true, |(_, b)| eps < b) {
                best = Some((i, eps));
            }
        }

        let (idx, epsilon) = best.ok_or_else(|| {
            DpError::numerical(format!(
                "no Renyi order gives a finite epsilon for {} steps",
                ledger.len()
            ))
        })?;
        if orders.len() > 1 && (idx == 0 || idx == orders.len() - 1) {
            if self.edge_order_reported.swap(true, Ordering::Relaxed) {
                debug!(order = orders[idx], "optimal Renyi order at the edge of the order set");
            } else {
                warn!(
                    order = orders[idx],
                    "optimal Renyi order is at the edge of the order set; consider extending it"
                );
            }
        }
        Ok(PrivacySpend {
            epsilon,
            delta,
            order: Some(orders[idx]),
        })
    }
}

fn linspace(start: f64, end: f64, num: usize) -> Vec<f64> {
    if num == 0 {
        return Vec::new();
    }
    if num == 1 {
        return vec![start];
    }
    let step = (end - start) / (num as f64 - 1.0);
    (0..num).map(|i| start + step * i as f64).collect()
}

fn precompute_log_factorials(max_alpha: usize) -> Vec<f64> {
    let mut log_fact = vec![0.0; max_alpha.saturating_add(1)];
    for i in 1..log_fact.len() {
        log_fact[i] = log_fact[i - 1] + (i as f64).ln();
    }
    log_fact
}

/// Per-step RDP at order `alpha` of the Gaussian mechanism with noise
/// multiplier `sigma`, under Poisson subsampling with rate `q`.
pub(crate) fn compute_rdp(q: f64, sigma: f64, alpha: f64, log_fact: &[f64]) -> f64 {
    // σ² must be representable or the series degenerates to NaN.
    if !(sigma * sigma).is_normal() {
        return f64::INFINITY;
    }
    if q >= 1.0 {
        return alpha / (2.0 * sigma * sigma);
    }
    let log_a = if is_integer(alpha) && (alpha as usize) < log_fact.len() {
        log_a_int(q, sigma, alpha as usize, log_fact)
    } else {
        log_a_frac(q, sigma, alpha)
    };
    if log_a.is_nan() {
        return f64::INFINITY;
    }
    // A_α >= 1; rounding in the series can dip just below.
    log_a.max(0.0) / (alpha - 1.0)
}

fn is_integer(x: f64) -> bool {
    (x - x.round()).abs() < 1e-12
}

/// `log A_α` for integer α as a log-sum-exp of binomial terms.
fn log_a_int(q: f64, sigma: f64, alpha: usize, log_fact: &[f64]) -> f64 {
    let log_q = q.ln();
    let log_1mq = (-q).ln_1p();
    let sigma_sq = sigma * sigma;
    let alpha_f = alpha as f64;

    let mut log_sum = f64::NEG_INFINITY;
    for j in 0..=alpha {
        let j_f = j as f64;
        let log_binom = log_fact[alpha] - log_fact[j] - log_fact[alpha - j];
        let log_prob = j_f * log_q + (alpha_f - j_f) * log_1mq;
        let log_exp = j_f * (j_f - 1.0) / (2.0 * sigma_sq);
        log_sum = log_add_exp(log_sum, log_binom + log_prob + log_exp);
    }
    log_sum
}

/// `log A_α` for fractional α via the two-sided erfc series.
///
/// Returns `+∞` if the series fails to converge or cancels below zero.
fn log_a_frac(q: f64, sigma: f64, alpha: f64) -> f64 {
    let log_q = q.ln();
    let log_1mq = (-q).ln_1p();
    let sigma_sq = sigma * sigma;
    let z0 = sigma_sq * (1.0 / q - 1.0).ln() + 0.5;
    let erfc_scale = SQRT_2 * sigma;

    let mut log_a0 = f64::NEG_INFINITY;
    let mut log_a1 = f64::NEG_INFINITY;
    // Signed binomial coefficient C(α, i), tracked as (ln|c|, sign).
    let mut log_coef = 0.0;
    let mut positive = true;

    for i in 0..MAX_SERIES_TERMS {
        let i_f = i as f64;
        let j = alpha - i_f;

        let log_t0 = log_coef + i_f * log_q + j * log_1mq;
        let log_t1 = log_coef + j * log_q + i_f * log_1mq;
        let log_e0 = -LN_2 + log_erfc((i_f - z0) / erfc_scale);
        let log_e1 = -LN_2 + log_erfc((z0 - j) / erfc_scale);
        let log_s0 = log_t0 + (i_f * i_f - i_f) / (2.0 * sigma_sq) + log_e0;
        let log_s1 = log_t1 + (j * j - j) / (2.0 * sigma_sq) + log_e1;

        if positive {
            log_a0 = log_add_exp(log_a0, log_s0);
            log_a1 = log_add_exp(log_a1, log_s1);
        } else {
            match (log_sub_exp(log_a0, log_s0), log_sub_exp(log_a1, log_s1)) {
                (Some(a0), Some(a1)) => {
                    log_a0 = a0;
                    log_a1 = a1;
                }
                _ => return f64::INFINITY,
            }
        }

        if log_s0.max(log_s1) < SERIES_CUTOFF {
            return log_add_exp(log_a0, log_a1);
        }

        let ratio = alpha - i_f;
        log_coef += ratio.abs().ln() - (i_f + 1.0).ln();
        if ratio < 0.0 {
            positive = !positive;
        }
    }
    f64::INFINITY
}

/// Numerically stable `ln(erfc(x))`, using the asymptotic expansion where
/// `erfc` underflows.
pub(crate) fn log_erfc(x: f64) -> f64 {
    let r = erfc(x);
    if r > 0.0 {
        return r.ln();
    }
    let x2 = x * x;
    -PI.ln() / 2.0 - x.ln() - x2 - 0.5 / x2 + 0.625 / (x2 * x2) - 37.0 / 24.0 / x2.powi(3)
        + 353.0 / 64.0 / x2.powi(4)
}

/// Numerically stable `ln(e^a + e^b)`.
pub(crate) fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    if a > b {
        a + (b - a).exp().ln_1p()
    } else {
        b + (a - b).exp().ln_1p()
    }
}

/// `ln(e^a − e^b)`, or `None` when `b > a`.
fn log_sub_exp(a: f64, b: f64) -> Option<f64> {
    if b == f64::NEG_INFINITY {
        return Some(a);
    }
    if b > a {
        return None;
    }
    if a == b {
        return Some(f64::NEG_INFINITY);
    }
    Some((a - b).exp_m1().ln() + b)
}
