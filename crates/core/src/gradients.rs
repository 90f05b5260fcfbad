//! Per-example gradients and the host-side interfaces that produce them.
//!
//! The host owns the model and its autodiff; this crate only needs the
//! `batch_size × parameter_count` gradient matrix for each step. Raw rows are
//! readable only inside this crate so that nothing outside the clipper and
//! noise injector can observe unclipped gradients.

use std::fmt;

use ndarray::{Array2, ArrayView1};

use crate::error::{DpError, Result};
use crate::tensor::{Scalar, Tensor};

/// One gradient row per example in a batch.
///
/// Ownership moves into the clipper; the raw values are never handed back.
#[derive(Clone)]
pub struct PerExampleGradients {
    pub(crate) rows: Array2<Scalar>,
}

impl PerExampleGradients {
    /// Wrap an existing `batch_size × parameter_count` matrix.
    pub fn new(rows: Array2<Scalar>) -> Self {
        Self { rows }
    }

    /// Build from one vector per example; all rows must share a length.
    pub fn from_rows(rows: Vec<Vec<Scalar>>, parameter_count: usize) -> Result<Self> {
        let batch_size = rows.len();
        let mut flat = Vec::with_capacity(batch_size.saturating_mul(parameter_count));
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != parameter_count {
                return Err(DpError::invalid(format!(
                    "gradient row {i} has {} entries, expected {parameter_count}",
                    row.len()
                )));
            }
            flat.extend(row);
        }
        let rows = Array2::from_shape_vec((batch_size, parameter_count), flat)
            .map_err(|e| DpError::invalid(format!("gradient shape: {e}")))?;
        Ok(Self { rows })
    }

    /// Build from per-example tensors.
    pub fn from_tensors(tensors: &[Tensor], parameter_count: usize) -> Result<Self> {
        Self::from_rows(tensors.iter().map(|t| t.to_vec()).collect(), parameter_count)
    }

    /// An empty batch, as produced by Poisson sampling that selected nothing.
    pub fn empty(parameter_count: usize) -> Self {
        Self {
            rows: Array2::zeros((0, parameter_count)),
        }
    }

    /// Number of examples in the batch.
    pub fn batch_size(&self) -> usize {
        self.rows.nrows()
    }

    /// Length of every gradient row.
    pub fn parameter_count(&self) -> usize {
        self.rows.ncols()
    }

    /// Whether the batch has no examples.
    pub fn is_empty(&self) -> bool {
        self.batch_size() == 0
    }

    pub(crate) fn row(&self, i: usize) -> ArrayView1<'_, Scalar> {
        self.rows.row(i)
    }
}

impl fmt::Debug for PerExampleGradients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerExampleGradients")
            .field("batch_size", &self.batch_size())
            .field("parameter_count", &self.parameter_count())
            .finish_non_exhaustive()
    }
}

/// Host collaborator that computes per-example gradients for a batch.
///
/// Implementations typically run a vectorized or looped backward pass and
/// stack the flattened gradients.
pub trait GradientSampler<B: ?Sized> {
    /// Compute one flattened gradient per example in `batch`.
    fn per_example_gradients(&mut self, batch: &B) -> Result<PerExampleGradients>;
}

impl<B: ?Sized, F> GradientSampler<B> for F
where
    F: FnMut(&B) -> Result<PerExampleGradients>,
{
    fn per_example_gradients(&mut self, batch: &B) -> Result<PerExampleGradients> {
        self(batch)
    }
}

/// Access to a model's flattened, trainable parameter vector.
pub trait Parameters {
    /// Number of trainable scalars.
    fn parameter_count(&self) -> usize;

    /// Mutable access for the optimizer.
    fn parameters_mut(&mut self) -> &mut Tensor;
}

impl Parameters for Tensor {
    fn parameter_count(&self) -> usize {
        self.len()
    }

    fn parameters_mut(&mut self) -> &mut Tensor {
        self
    }
}
