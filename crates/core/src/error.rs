//! Error types for differentially private training.
//!
//! Every variant is fatal to the current training session: a session that
//! cannot verify its privacy guarantee must stop rather than keep training.

/// Errors that can occur during DP operations.
#[derive(Debug, thiserror::Error)]
pub enum DpError {
    /// Invalid session configuration (threshold, rate, epsilon or delta).
    #[error("configuration error: {msg}")]
    Configuration {
        /// Human-readable error description.
        msg: String,
    },

    /// Invalid runtime input such as a malformed gradient batch.
    #[error("invalid parameter: {msg}")]
    InvalidParameters {
        /// Human-readable error description.
        msg: String,
    },

    /// The accountant could not produce a finite epsilon.
    #[error("numerical error: {msg}")]
    Numerical {
        /// Human-readable error description.
        msg: String,
    },

    /// No noise multiplier in the search range meets the target budget.
    #[error("calibration error: {msg}")]
    Calibration {
        /// Human-readable error description.
        msg: String,
    },

    /// Taking another step would exceed the configured privacy budget.
    #[error("privacy budget exhausted (eps={eps:.4}, delta={delta:.2e})")]
    BudgetExhausted {
        /// Epsilon the refused step would have reached.
        eps: f64,
        /// Delta the budget is expressed at.
        delta: f64,
    },

    /// Unsupported feature or ledger shape.
    #[error("unsupported feature: {msg}")]
    Unsupported {
        /// Human-readable error description.
        msg: String,
    },

    /// Malformed configuration or ledger checkpoint.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for DP operations.
pub type Result<T> = std::result::Result<T, DpError>;

impl DpError {
    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration { msg: msg.into() }
    }

    /// Create an invalid parameter error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameters { msg: msg.into() }
    }

    /// Create a numerical error.
    pub fn numerical<S: Into<String>>(msg: S) -> Self {
        Self::Numerical { msg: msg.into() }
    }

    /// Create a calibration error.
    pub fn calibration<S: Into<String>>(msg: S) -> Self {
        Self::Calibration { msg: msg.into() }
    }

    /// Create an unsupported feature error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported { msg: msg.into() }
    }
}
