//! Differentially private training sessions over a host-provided model.
//!
//! The host implements [`Parameters`] and [`GradientSampler`] for its model;
//! a [`PrivacyEngine`] then clips, noises, applies and accounts for every
//! step, calibrating the noise to a target `(ε, δ)` budget up front.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use dp_engine_accounting as accounting;
pub use dp_engine_core as core;
pub use dp_engine_prng as prng;
pub use ndarray;

pub use dp_engine_accounting::{
    calibrate_noise_multiplier, steps_for_epochs, AccountantKind, CalibrationConfig,
    GdpAccountant, LedgerReader, LedgerSnapshot, NoiseCalibrator, PrivacyAccountant,
    PrivacyLedger, PrivacySpend, RdpAccountant, RdpConversion, RdpOrders, StepRecord,
};
pub use config::PrivacyConfig;
pub use dp_engine_core::{
    DpError, GradientClipper, GradientSampler, NoiseInjector, Normalization, Optimizer,
    Parameters, PerExampleGradients, PrivateUpdate, Result, Scalar, Sgd, Tensor,
};
pub use engine::{PrivacyEngine, PrivacyMonitor, StepReport};
pub use dp_engine_prng::NoiseKey;

/// Convenience prelude covering a training session.
pub mod prelude {
    pub use crate::config::PrivacyConfig;
    pub use crate::engine::{PrivacyEngine, PrivacyMonitor, StepReport};
    pub use dp_engine_accounting::prelude::*;
    pub use dp_engine_core::prelude::*;
    pub use dp_engine_prng::prelude::*;
}
