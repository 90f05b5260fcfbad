//! Tensor types and low-level operations.

use ndarray::{Array1, ArrayView1};

/// Scalar type (f64 by default, f32 with feature flag).
#[cfg(not(feature = "f32"))]
pub type Scalar = f64;

/// Scalar type (f64 by default, f32 with feature flag).
#[cfg(feature = "f32")]
pub type Scalar = f32;

/// Flattened parameter vector.
pub type Tensor = Array1<Scalar>;

/// Compute the L2 norm of a vector in f64, handling NaN/inf.
///
/// Values are widened before squaring so reduced-precision storage does not
/// bias the clip threshold.
pub fn l2_norm(t: ArrayView1<'_, Scalar>) -> f64 {
    let mut sum_sq: f64 = 0.0;
    for &v in t.iter() {
        let v = v as f64;
        if v.is_nan() {
            return f64::NAN;
        }
        if !v.is_finite() {
            return f64::INFINITY;
        }
        sum_sq += v * v;
    }
    sum_sq.sqrt()
}

/// Whether every element is finite.
pub fn all_finite(t: ArrayView1<'_, Scalar>) -> bool {
    t.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_l2_norm() {
        let t = array![3.0, 4.0];
        assert!((l2_norm(t.view()) - 5.0).abs() < 1e-10);
    }

    #[test]
    fn test_l2_norm_nan() {
        let t = array![1.0, Scalar::NAN, 2.0];
        assert!(l2_norm(t.view()).is_nan());
    }

    #[test]
    fn test_l2_norm_inf() {
        let t = array![1.0, Scalar::INFINITY];
        assert_eq!(l2_norm(t.view()), f64::INFINITY);
        assert!(!all_finite(t.view()));
    }
}
