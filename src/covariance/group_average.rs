//! Group-average recomputation of a correlated contribution (option `q`).
//!
//! A fully correlated normalisation uncertainty quoted relative to each raw
//! input biases a weighted average towards low values (d'Agostini's
//! puzzle). Following Neudecker and Bohm–Zech, the contribution is instead
//! evaluated at the combined value of each group:
//!
//! 1. `V⁻¹` is the inverse of the reduced total,
//! 2. group averages `a = (Gᵀ V⁻¹ G)⁻¹ Gᵀ V⁻¹ x`,
//! 3. shift `s_i = (e_i / x_i) · a_{group(i)}`,
//! 4. contribution `s sᵀ`.

use nalgebra::{DMatrix, DVector};

use crate::domain::GroupMatrix;
use crate::error::Result;
use crate::math::gls_map;

pub fn group_average_contribution(
    errors: &[f64],
    values: &[f64],
    groups: &GroupMatrix,
    inv_reduced: &DMatrix<f64>,
) -> Result<DMatrix<f64>> {
    let x = DVector::from_column_slice(values);
    let map = gls_map(groups.matrix(), inv_reduced, None)?;
    let averages = map.estimate(&x);
    let broadcast = groups.matrix() * averages;

    let shifts = DVector::from_fn(values.len(), |i, _| {
        let rel = if values[i] != 0.0 { errors[i] / values[i] } else { 0.0 };
        rel * broadcast[i]
    });
    Ok(&shifts * shifts.transpose())
}
