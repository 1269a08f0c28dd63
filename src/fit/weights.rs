//! Weights of the input measurements in the combined values.
//!
//! The weight of measurement `i` in group average `k` is `∂p_k/∂d_i`. With
//! the model linearised at the fitted point, `μ ≈ J q`, the fit is a
//! penalised GLS problem and
//!
//! ```text
//! ∂q/∂d = (Jᵀ R⁻¹ J + P)⁻¹ Jᵀ R⁻¹
//! ```
//!
//! whose first `G` rows are the weights. For additive sources this is exact.
//! Row sums are not normalised: correlated systematics can push individual
//! weights above one or below zero.

use nalgebra::DMatrix;

use crate::error::Result;
use crate::fit::chi2::FitContext;
use crate::fit::fitter::FitResult;
use crate::math::gls_map;

/// Weights matrix, one row per group and one column per measurement.
pub fn weights_matrix(context: &FitContext, fit: &FitResult) -> Result<DMatrix<f64>> {
    let jac = context.jacobian(&fit.parameters);
    let penalty = context.penalty();
    let map = gls_map(&jac, context.inv_reduced(), Some(&penalty))?;
    Ok(map.weights.rows(0, context.n_groups()).into_owned())
}
