//! Covariance inversion and generalized least squares.
//!
//! Everything here works on small dense matrices (tens of measurements), so
//! we use nalgebra's Cholesky decomposition directly. Covariance matrices
//! that reach these routines must be symmetric positive definite; anything
//! else is reported as [`Error::SingularMatrix`] instead of producing
//! garbage.
//!
//! The GLS solution of `d ≈ X β` with metric `V⁻¹` and an optional diagonal
//! penalty `P` is
//!
//! ```text
//! β = (Xᵀ V⁻¹ X + P)⁻¹ Xᵀ V⁻¹ d
//! ```
//!
//! and the linear map `(Xᵀ V⁻¹ X + P)⁻¹ Xᵀ V⁻¹` is what the weights matrix and
//! the group-average recomputation need.

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

/// Relative size below which a Cholesky pivot counts as zero.
const PIVOT_EPS: f64 = 1e-13;

/// Invert a symmetric positive definite matrix.
///
/// `what` names the matrix in the error message.
pub fn invert_spd(m: &DMatrix<f64>, what: &str) -> Result<DMatrix<f64>> {
    if !m.is_square() || m.nrows() == 0 {
        return Err(Error::SingularMatrix(format!(
            "{what} has shape {}x{}",
            m.nrows(),
            m.ncols()
        )));
    }
    if m.iter().any(|v| !v.is_finite()) {
        return Err(Error::SingularMatrix(format!("{what} is not finite")));
    }

    let scale = m.diagonal().amax();
    if scale == 0.0 {
        return Err(Error::SingularMatrix(format!("{what} is zero")));
    }

    let chol = m
        .clone()
        .cholesky()
        .ok_or_else(|| Error::SingularMatrix(format!("{what} is not positive definite")))?;

    // nalgebra accepts tiny positive pivots; treat them as rank deficiency.
    let l = chol.l_dirty();
    let min_pivot = (0..m.nrows())
        .map(|i| l[(i, i)])
        .fold(f64::INFINITY, f64::min);
    if min_pivot <= PIVOT_EPS * scale.sqrt() {
        return Err(Error::SingularMatrix(format!(
            "{what} is numerically singular (pivot {min_pivot:.3e})"
        )));
    }

    let inv = chol.inverse();
    if inv.iter().any(|v| !v.is_finite()) {
        return Err(Error::SingularMatrix(format!("{what} inverse overflowed")));
    }
    Ok(symmetrize(&inv))
}

/// Lower Cholesky factor of a symmetric positive definite matrix.
pub fn cholesky_factor(m: &DMatrix<f64>, what: &str) -> Result<DMatrix<f64>> {
    m.clone()
        .cholesky()
        .map(|c| c.l())
        .ok_or_else(|| Error::SingularMatrix(format!("{what} is not positive definite")))
}

/// `(m + mᵀ) / 2`, removes rounding asymmetry.
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Linear GLS estimator.
#[derive(Debug, Clone)]
pub struct GlsMap {
    /// `(Xᵀ V⁻¹ X + P)⁻¹ Xᵀ V⁻¹`, one row per parameter, one column per datum.
    pub weights: DMatrix<f64>,
    /// `(Xᵀ V⁻¹ X + P)⁻¹`.
    pub covariance: DMatrix<f64>,
}

impl GlsMap {
    pub fn estimate(&self, data: &DVector<f64>) -> DVector<f64> {
        &self.weights * data
    }
}

/// Build the GLS map for design `x` and inverse covariance `inv_cov`.
///
/// `penalty` is the diagonal of `P` (one entry per column of `x`); pass
/// zeros for unconstrained parameters.
pub fn gls_map(
    x: &DMatrix<f64>,
    inv_cov: &DMatrix<f64>,
    penalty: Option<&DVector<f64>>,
) -> Result<GlsMap> {
    let xt_vinv = x.transpose() * inv_cov;
    let mut normal = &xt_vinv * x;
    if let Some(p) = penalty {
        for (i, v) in p.iter().enumerate() {
            normal[(i, i)] += v;
        }
    }
    let covariance = invert_spd(&normal, "normal matrix")?;
    let weights = &covariance * xt_vinv;
    Ok(GlsMap {
        weights,
        covariance,
    })
}
