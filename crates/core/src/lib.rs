//! Core differentially private training primitives.
//!
//! This crate provides the framework-agnostic per-step machinery of DP-SGD:
//! per-example gradient clipping, Gaussian noise addition and the interfaces
//! a host model implements to feed them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clipping;
pub mod error;
pub mod gradients;
pub mod noise;
pub mod optim;
pub mod tensor;

pub use clipping::{ClippedGradients, ClippedSum, GradientClipper};
pub use error::{DpError, Result};
pub use gradients::{GradientSampler, Parameters, PerExampleGradients};
pub use noise::{add_gaussian_noise, GaussianMechanism, NoiseInjector, Normalization, PrivateUpdate};
pub use optim::{Optimizer, Sgd};
pub use tensor::{l2_norm, Scalar, Tensor};

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        ClippedGradients, ClippedSum, DpError, GaussianMechanism, GradientClipper,
        GradientSampler, NoiseInjector, Normalization, Optimizer, Parameters,
        PerExampleGradients, PrivateUpdate, Result, Scalar, Sgd, Tensor,
    };
}
