//! Chi-square objective of the averaging fit.
//!
//! Parameters are laid out as `[p_1 .. p_G, θ_1 .. θ_K]`: one combined value
//! per group followed by one nuisance parameter per systematic-shift row.
//! The model prediction for measurement `i` is
//!
//! ```text
//! μ_i = (G p)_i
//! μ_i -= θ_j s_ji                   additive source j
//! μ_i /= 1 + θ_j s_ji / d_i         relative source j
//! ```
//!
//! applied in source order, and the objective is
//!
//! ```text
//! χ² = (d - μ)ᵀ R⁻¹ (d - μ) + Σ θ_j²
//! ```
//!
//! with `R` the reduced total covariance. The context is immutable, so the
//! objective can be evaluated from several threads at once.

use nalgebra::{DMatrix, DVector};

use crate::covariance::CovarianceSet;
use crate::domain::{GroupMatrix, strip_leading_digits};
use crate::error::{Error, Result};
use crate::fit::minimizer::Objective;
use crate::math::invert_spd;

/// Relative step for the numerical Jacobian of relative sources.
const JACOBIAN_STEP: f64 = 1e-6;

/// A floated systematic: one nuisance parameter and its per-measurement shifts.
#[derive(Debug, Clone)]
pub struct NuisanceTerm {
    pub name: String,
    pub relative: bool,
    pub shifts: DVector<f64>,
}

/// Immutable inputs of the chi-square.
#[derive(Debug, Clone)]
pub struct FitContext {
    data: DVector<f64>,
    reduced: DMatrix<f64>,
    inv_reduced: DMatrix<f64>,
    design: DMatrix<f64>,
    group_names: Vec<String>,
    nuisance: Vec<NuisanceTerm>,
}

impl FitContext {
    /// Build the context; fails if the reduced covariance cannot be inverted.
    pub fn new(values: &[f64], covariances: &CovarianceSet, groups: &GroupMatrix) -> Result<Self> {
        let n = values.len();
        if covariances.dim() != n || groups.n_measurements() != n {
            return Err(Error::config(
                "values",
                format!(
                    "dimension mismatch: {n} values, {}x{} covariance, {} group rows",
                    covariances.dim(),
                    covariances.dim(),
                    groups.n_measurements()
                ),
            ));
        }

        let inv_reduced = invert_spd(&covariances.total_reduced, "reduced covariance")?;

        let nuisance: Vec<NuisanceTerm> = covariances
            .syst
            .iter()
            .map(|row| NuisanceTerm {
                name: strip_leading_digits(&row.key).to_string(),
                relative: row.relative,
                shifts: row.shifts.clone(),
            })
            .collect();

        for (term, row) in nuisance.iter().zip(&covariances.syst) {
            if !term.relative {
                continue;
            }
            let zero_datum = (0..n).any(|i| term.shifts[i] != 0.0 && values[i] == 0.0);
            if zero_datum {
                return Err(Error::config(
                    &row.key,
                    "relative systematic applied to a measurement with value 0",
                ));
            }
        }

        Ok(Self {
            data: DVector::from_column_slice(values),
            reduced: covariances.total_reduced.clone(),
            inv_reduced,
            design: groups.matrix().clone(),
            group_names: groups.labels().to_vec(),
            nuisance,
        })
    }

    /// Same covariance and model, different data (pseudo-experiments).
    pub fn with_data(&self, data: DVector<f64>) -> Self {
        Self {
            data,
            ..self.clone()
        }
    }

    pub fn data(&self) -> &DVector<f64> {
        &self.data
    }

    pub fn reduced(&self) -> &DMatrix<f64> {
        &self.reduced
    }

    pub fn inv_reduced(&self) -> &DMatrix<f64> {
        &self.inv_reduced
    }

    pub fn design(&self) -> &DMatrix<f64> {
        &self.design
    }

    pub fn nuisance(&self) -> &[NuisanceTerm] {
        &self.nuisance
    }

    pub fn n_data(&self) -> usize {
        self.data.len()
    }

    pub fn n_groups(&self) -> usize {
        self.design.ncols()
    }

    pub fn n_params(&self) -> usize {
        self.n_groups() + self.nuisance.len()
    }

    /// Measurements minus combined values; nuisance parameters are not counted.
    pub fn ndof(&self) -> usize {
        self.n_data().saturating_sub(self.n_groups())
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.group_names
            .iter()
            .cloned()
            .chain(self.nuisance.iter().map(|t| t.name.clone()))
            .collect()
    }

    /// Diagonal of the nuisance penalty: 0 for group parameters, 1 for nuisances.
    pub fn penalty(&self) -> DVector<f64> {
        let g = self.n_groups();
        DVector::from_fn(self.n_params(), |k, _| if k < g { 0.0 } else { 1.0 })
    }

    pub fn predict(&self, params: &[f64]) -> DVector<f64> {
        let g = self.n_groups();
        let p = DVector::from_column_slice(&params[..g]);
        let mut mu = &self.design * p;
        for i in 0..self.n_data() {
            for (j, term) in self.nuisance.iter().enumerate() {
                let s = term.shifts[i];
                if s == 0.0 {
                    continue;
                }
                let shift = params[g + j] * s;
                if term.relative {
                    mu[i] /= 1.0 + shift / self.data[i];
                } else {
                    mu[i] -= shift;
                }
            }
        }
        mu
    }

    pub fn chi2(&self, params: &[f64]) -> f64 {
        debug_assert_eq!(params.len(), self.n_params());
        let delta = &self.data - self.predict(params);
        let quad = (delta.transpose() * &self.inv_reduced * &delta)[(0, 0)];
        let penalty: f64 = params[self.n_groups()..].iter().map(|t| t * t).sum();
        quad + penalty
    }

    /// `∂μ/∂q` at `params`, one row per measurement.
    ///
    /// Exact for additive sources; relative sources use central differences.
    pub fn jacobian(&self, params: &[f64]) -> DMatrix<f64> {
        let n = self.n_data();
        let g = self.n_groups();
        if self.nuisance.iter().all(|t| !t.relative) {
            let mut jac = DMatrix::zeros(n, self.n_params());
            jac.columns_mut(0, g).copy_from(&self.design);
            for (j, term) in self.nuisance.iter().enumerate() {
                jac.set_column(g + j, &(-&term.shifts));
            }
            return jac;
        }

        let mut jac = DMatrix::zeros(n, self.n_params());
        let mut work = params.to_vec();
        for k in 0..self.n_params() {
            let h = JACOBIAN_STEP * params[k].abs().max(1.0);
            work[k] = params[k] + h;
            let up = self.predict(&work);
            work[k] = params[k] - h;
            let down = self.predict(&work);
            work[k] = params[k];
            jac.set_column(k, &((up - down) / (2.0 * h)));
        }
        jac
    }
}

impl Objective for FitContext {
    fn value(&self, params: &[f64]) -> f64 {
        self.chi2(params)
    }
}
