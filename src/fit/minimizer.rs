//! Minimizer contract and the default argmin-based implementation.
//!
//! The averaging fit only needs a narrow interface: an objective that maps a
//! parameter vector to a scalar, a start point, step sizes and names. It gets
//! back the parameters at the minimum, their errors and covariance, and the
//! objective value there.
//!
//! [`LbfgsMinimizer`] runs L-BFGS with a More–Thuente line search on a
//! central-difference gradient, then a Hesse-style step: a numerical
//! Hessian, a few Newton refinement iterations and the parameter covariance
//! `2 H⁻¹` (chi-square convention, Δχ² = 1).

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::math::invert_spd;

/// Scalar objective of a parameter vector. Must be a pure function.
pub trait Objective: Sync {
    fn value(&self, params: &[f64]) -> f64;
}

/// Everything the fit needs back from a minimization.
#[derive(Debug, Clone)]
pub struct MinimizerOutput {
    pub parameters: Vec<f64>,
    pub errors: Vec<f64>,
    pub covariance: DMatrix<f64>,
    pub fval: f64,
    pub n_iter: u64,
    pub message: String,
}

pub trait Minimizer: Send + Sync {
    /// Minimize `objective` starting at `start`.
    ///
    /// `steps` sets the scale of each parameter for numerical derivatives;
    /// `names` and `ndof` are informational.
    fn minimize(
        &self,
        objective: &dyn Objective,
        start: &[f64],
        steps: &[f64],
        names: &[String],
        ndof: usize,
    ) -> Result<MinimizerOutput>;
}

#[derive(Debug, Clone)]
pub struct MinimizerConfig {
    /// L-BFGS iteration limit.
    pub max_iter: u64,
    /// L-BFGS gradient-norm tolerance.
    pub tol: f64,
    /// L-BFGS history size.
    pub m: usize,
    /// Newton refinement iterations after L-BFGS.
    pub newton_iter: usize,
    /// Converged when the Newton decrement `gᵀ H⁻¹ g` is below this.
    pub decrement_tol: f64,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            tol: 1e-8,
            m: 10,
            newton_iter: 10,
            decrement_tol: 1e-8,
        }
    }
}

/// Relative step of the central-difference gradient.
const GRAD_STEP: f64 = 1e-6;
/// Relative step of the central-difference Hessian.
const HESSE_STEP: f64 = 1e-3;

struct ArgminProblem<'a> {
    objective: &'a dyn Objective,
    steps: &'a [f64],
}

impl CostFunction for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        Ok(self.objective.value(params))
    }
}

impl Gradient for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        let grad = numerical_gradient(self.objective, params, self.steps, GRAD_STEP);
        Ok(grad.as_slice().to_vec())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LbfgsMinimizer {
    config: MinimizerConfig,
}

impl LbfgsMinimizer {
    pub fn new(config: MinimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MinimizerConfig {
        &self.config
    }

    /// Run L-BFGS; `None` if argmin gives up without a usable point.
    fn run_lbfgs(
        &self,
        objective: &dyn Objective,
        start: &[f64],
        steps: &[f64],
    ) -> Option<(Vec<f64>, u64, String)> {
        let problem = ArgminProblem { objective, steps };
        let linesearch = MoreThuenteLineSearch::new();
        let tol_cost = (0.1 * self.config.tol).max(1e-12);
        let solver = LBFGS::new(linesearch, self.config.m)
            .with_tolerance_grad(self.config.tol)
            .and_then(|s| s.with_tolerance_cost(tol_cost));
        let solver = match solver {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "invalid L-BFGS configuration");
                return None;
            }
        };

        let init = start.to_vec();
        let max_iter = self.config.max_iter;
        let res = Executor::new(problem, solver)
            .configure(|state| state.param(init).max_iters(max_iter))
            .run();
        let res = match res {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "L-BFGS stopped early");
                return None;
            }
        };

        let state = res.state();
        let best = state.get_best_param()?.clone();
        if best.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );
        tracing::debug!(
            iters = state.get_iter(),
            fval = state.get_best_cost(),
            converged,
            "L-BFGS finished"
        );
        Some((best, state.get_iter(), termination.to_string()))
    }
}

impl Minimizer for LbfgsMinimizer {
    fn minimize(
        &self,
        objective: &dyn Objective,
        start: &[f64],
        steps: &[f64],
        names: &[String],
        ndof: usize,
    ) -> Result<MinimizerOutput> {
        if start.len() != steps.len() || start.len() != names.len() {
            return Err(Error::config(
                "parameters",
                format!(
                    "{} start values, {} steps, {} names",
                    start.len(),
                    steps.len(),
                    names.len()
                ),
            ));
        }
        if start.is_empty() {
            return Err(Error::config("parameters", "nothing to minimize"));
        }

        let (mut x, n_iter, message) = match self.run_lbfgs(objective, start, steps) {
            Some(found) => found,
            None => (start.to_vec(), 0, "L-BFGS failed".to_string()),
        };

        // Newton refinement on the numerical Hessian.
        let mut fval = objective.value(&x);
        for _ in 0..self.config.newton_iter {
            let grad = numerical_gradient(objective, &x, steps, GRAD_STEP);
            let hess = numerical_hessian(objective, &x, steps);
            let Ok(inv) = invert_spd(&hess, "Hessian") else {
                break;
            };
            let step = &inv * &grad;
            if grad.dot(&step) < self.config.decrement_tol {
                break;
            }

            let mut alpha = 1.0;
            let mut accepted = false;
            for _ in 0..30 {
                let trial: Vec<f64> = x
                    .iter()
                    .zip(step.iter())
                    .map(|(xi, si)| xi - alpha * si)
                    .collect();
                let f_trial = objective.value(&trial);
                if f_trial.is_finite() && f_trial <= fval {
                    x = trial;
                    fval = f_trial;
                    accepted = true;
                    break;
                }
                alpha *= 0.5;
            }
            if !accepted {
                break;
            }
        }

        let grad = numerical_gradient(objective, &x, steps, GRAD_STEP);
        let hess = numerical_hessian(objective, &x, steps);
        let inv = invert_spd(&hess, "Hessian").map_err(|e| {
            Error::NotConverged(format!("singular Hessian at the minimum ({e})"))
        })?;
        let decrement = grad.dot(&(&inv * &grad));
        if !(decrement.is_finite() && decrement < self.config.decrement_tol) {
            return Err(Error::NotConverged(format!(
                "Newton decrement {decrement:.3e} above tolerance {:.1e} ({message})",
                self.config.decrement_tol
            )));
        }

        let covariance = inv * 2.0;
        let errors = (0..x.len())
            .map(|i| covariance[(i, i)].max(0.0).sqrt())
            .collect();
        tracing::debug!(n_params = names.len(), ndof, fval, "minimum found");

        Ok(MinimizerOutput {
            parameters: x,
            errors,
            covariance,
            fval,
            n_iter,
            message,
        })
    }
}

fn step_size(x: f64, step: f64, rel: f64) -> f64 {
    rel * x.abs().max(step.abs()).max(f64::EPSILON)
}

/// Central-difference gradient.
pub fn numerical_gradient(
    objective: &dyn Objective,
    x: &[f64],
    steps: &[f64],
    rel: f64,
) -> DVector<f64> {
    let mut work = x.to_vec();
    DVector::from_fn(x.len(), |i, _| {
        let h = step_size(x[i], steps[i], rel);
        work[i] = x[i] + h;
        let up = objective.value(&work);
        work[i] = x[i] - h;
        let down = objective.value(&work);
        work[i] = x[i];
        (up - down) / (2.0 * h)
    })
}

/// Central-difference Hessian, symmetric by construction.
pub fn numerical_hessian(objective: &dyn Objective, x: &[f64], steps: &[f64]) -> DMatrix<f64> {
    let n = x.len();
    let h: Vec<f64> = (0..n)
        .map(|i| step_size(x[i], steps[i], HESSE_STEP))
        .collect();
    let f0 = objective.value(x);
    let mut work = x.to_vec();
    let mut hess = DMatrix::zeros(n, n);

    for i in 0..n {
        work[i] = x[i] + h[i];
        let up = objective.value(&work);
        work[i] = x[i] - h[i];
        let down = objective.value(&work);
        work[i] = x[i];
        hess[(i, i)] = (up - 2.0 * f0 + down) / (h[i] * h[i]);

        for j in 0..i {
            let mut corner = |si: f64, sj: f64| {
                work[i] = x[i] + si * h[i];
                work[j] = x[j] + sj * h[j];
                let v = objective.value(&work);
                work[i] = x[i];
                work[j] = x[j];
                v
            };
            let fpp = corner(1.0, 1.0);
            let fpm = corner(1.0, -1.0);
            let fmp = corner(-1.0, 1.0);
            let fmm = corner(-1.0, -1.0);
            let v = (fpp - fpm - fmp + fmm) / (4.0 * h[i] * h[j]);
            hess[(i, j)] = v;
            hess[(j, i)] = v;
        }
    }
    hess
}
