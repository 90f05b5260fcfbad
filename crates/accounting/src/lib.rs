//! Privacy accounting for differentially private training.
//!
//! A [`PrivacyLedger`] records the sampling rate and noise multiplier of every
//! step; a [`PrivacyAccountant`] turns a [`LedgerSnapshot`] into an `(ε, δ)`
//! guarantee; a [`NoiseCalibrator`] inverts that to pick a noise multiplier
//! for a target budget.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accountant;
pub mod calibrate;
pub mod gdp;
pub mod ledger;
pub mod rdp;

pub use accountant::{AccountantKind, PrivacyAccountant, PrivacySpend};
pub use calibrate::{
    calibrate_noise_multiplier, steps_for_epochs, CalibrationConfig, NoiseCalibrator,
};
pub use gdp::GdpAccountant;
pub use ledger::{LedgerReader, LedgerSnapshot, PrivacyLedger, StepRecord, StepRun};
pub use rdp::{RdpAccountant, RdpConversion, RdpOrders};

/// Common imports for privacy accounting.
pub mod prelude {
    pub use crate::{
        calibrate_noise_multiplier, steps_for_epochs, AccountantKind, CalibrationConfig,
        GdpAccountant, LedgerReader, LedgerSnapshot, NoiseCalibrator, PrivacyAccountant,
        PrivacyLedger, PrivacySpend, RdpAccountant, RdpConversion, RdpOrders, StepRecord,
    };
}
