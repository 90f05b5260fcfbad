//! Per-example gradient clipping for bounded sensitivity.

use std::fmt;

use ndarray::{ArrayViewMut1, Axis};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{DpError, Result};
use crate::gradients::PerExampleGradients;
use crate::tensor::{all_finite, l2_norm, Scalar};

/// Attempts at shaving the scale when rounding leaves a row above the bound.
const MAX_SCALE_ADJUSTMENTS: usize = 8;

/// Clip a vector to a maximum L2 norm in-place, returning whether it changed.
///
/// Vectors already inside the ball are left untouched. Rows with NaN or
/// infinite entries are zeroed. After rescaling, the norm is re-measured in
/// f64 and the scale is shaved until `‖g‖₂ ≤ max_norm` holds exactly.
pub(crate) fn clip_row(mut row: ArrayViewMut1<'_, Scalar>, max_norm: f64) -> bool {
    if !all_finite(row.view()) {
        row.fill(0.0 as Scalar);
        return true;
    }

    let norm = l2_norm(row.view());
    if norm <= max_norm {
        return false;
    }

    let original = row.to_owned();
    let mut scale = max_norm / norm;
    for _ in 0..MAX_SCALE_ADJUSTMENTS {
        row.zip_mut_with(&original, |dst, &src| *dst = src * (scale as Scalar));
        if l2_norm(row.view()) <= max_norm {
            return true;
        }
        scale *= 1.0 - 4.0 * (Scalar::EPSILON as f64);
    }

    // The zero vector is always inside the ball.
    row.fill(0.0 as Scalar);
    true
}

/// Rescales each per-example gradient into the L2 ball of radius `C`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradientClipper {
    max_grad_norm: f64,
}

impl GradientClipper {
    /// Create a clipper with threshold `max_grad_norm`.
    pub fn new(max_grad_norm: f64) -> Result<Self> {
        if !max_grad_norm.is_finite() || max_grad_norm <= 0.0 {
            return Err(DpError::config(format!(
                "max_grad_norm must be positive and finite, got {max_grad_norm}"
            )));
        }
        Ok(Self { max_grad_norm })
    }

    /// The clipping threshold `C`.
    pub fn max_grad_norm(&self) -> f64 {
        self.max_grad_norm
    }

    /// Clip every row of the batch.
    pub fn clip(&self, grads: PerExampleGradients) -> Result<ClippedGradients> {
        let mut rows = grads.rows;
        let c = self.max_grad_norm;

        #[cfg(feature = "parallel")]
        rows.axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|row| {
                clip_row(row, c);
            });

        #[cfg(not(feature = "parallel"))]
        rows.axis_iter_mut(Axis(0)).for_each(|row| {
            clip_row(row, c);
        });

        Ok(ClippedGradients {
            grads: PerExampleGradients { rows },
            max_grad_norm: c,
        })
    }
}

/// Per-example gradients that are each bounded by the clip threshold.
///
/// Like [`PerExampleGradients`], the rows stay private to this crate; the
/// only way forward is summation into a [`ClippedSum`].
#[derive(Clone)]
pub struct ClippedGradients {
    pub(crate) grads: PerExampleGradients,
    pub(crate) max_grad_norm: f64,
}

impl ClippedGradients {
    /// Number of examples.
    pub fn batch_size(&self) -> usize {
        self.grads.batch_size()
    }

    /// Row length.
    pub fn parameter_count(&self) -> usize {
        self.grads.parameter_count()
    }

    /// The bound every row satisfies.
    pub fn max_grad_norm(&self) -> f64 {
        self.max_grad_norm
    }

    /// Reduce to the per-coordinate sum, accumulated in f64.
    pub fn into_sum(self) -> ClippedSum {
        let dim = self.parameter_count();
        let mut sum = vec![0.0f64; dim];
        for i in 0..self.batch_size() {
            for (acc, &v) in sum.iter_mut().zip(self.grads.row(i).iter()) {
                *acc += v as f64;
            }
        }
        ClippedSum {
            sum,
            examples: self.batch_size(),
            batches: 1,
            max_grad_norm: self.max_grad_norm,
        }
    }
}

impl fmt::Debug for ClippedGradients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClippedGradients")
            .field("batch_size", &self.batch_size())
            .field("parameter_count", &self.parameter_count())
            .field("max_grad_norm", &self.max_grad_norm)
            .finish_non_exhaustive()
    }
}

/// Sum of clipped gradients over one or more physical batches.
#[derive(Clone)]
pub struct ClippedSum {
    pub(crate) sum: Vec<f64>,
    pub(crate) examples: usize,
    pub(crate) batches: usize,
    pub(crate) max_grad_norm: f64,
}

impl ClippedSum {
    /// Total number of clipped examples folded into the sum.
    pub fn examples(&self) -> usize {
        self.examples
    }

    /// Number of physical batches folded into the sum.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Row length.
    pub fn parameter_count(&self) -> usize {
        self.sum.len()
    }

    /// Fold another batch into this sum (gradient accumulation).
    pub fn merge(&mut self, other: ClippedSum) -> Result<()> {
        if other.sum.len() != self.sum.len() {
            return Err(DpError::invalid(format!(
                "cannot merge gradient sums of width {} and {}",
                self.sum.len(),
                other.sum.len()
            )));
        }
        if (other.max_grad_norm - self.max_grad_norm).abs() > 0.0 {
            return Err(DpError::invalid(
                "cannot merge gradient sums clipped at different thresholds",
            ));
        }
        for (a, b) in self.sum.iter_mut().zip(other.sum) {
            *a += b;
        }
        self.examples += other.examples;
        self.batches += other.batches;
        Ok(())
    }
}

impl fmt::Debug for ClippedSum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClippedSum")
            .field("examples", &self.examples)
            .field("batches", &self.batches)
            .field("parameter_count", &self.parameter_count())
            .finish_non_exhaustive()
    }
}
