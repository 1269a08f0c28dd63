//! Pseudo-experiments around a fitted average.
//!
//! Each toy draws data from the fitted model, `d = G p̂ + L z + Σ u_j s_j`
//! with `L` the Cholesky factor of the reduced covariance and `z`, `u`
//! standard normal, refits it and records the pull of every combined value.
//! Toys are independent and seeded from `seed + index`, so the summary does
//! not depend on thread scheduling.

use nalgebra::DVector;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fit::chi2::FitContext;
use crate::fit::fitter::{FitResult, fit_average};
use crate::fit::minimizer::Minimizer;
use crate::math::cholesky_factor;

#[derive(Debug, Clone)]
pub struct ToyConfig {
    pub n_toys: usize,
    pub seed: u64,
}

impl Default for ToyConfig {
    fn default() -> Self {
        Self {
            n_toys: 1000,
            seed: 42,
        }
    }
}

/// Pull statistics per group, in group order.
#[derive(Debug, Clone)]
pub struct ToySummary {
    pub n_toys: usize,
    pub n_failed: usize,
    pub group_names: Vec<String>,
    pub pull_mean: Vec<f64>,
    pub pull_width: Vec<f64>,
    pub chi2_mean: f64,
}

struct ToyOutcome {
    pulls: Vec<f64>,
    chi2: f64,
}

pub fn run_toys(
    context: &FitContext,
    fit: &FitResult,
    minimizer: &dyn Minimizer,
    config: &ToyConfig,
) -> Result<ToySummary> {
    if config.n_toys == 0 {
        return Err(Error::config("toys", "number of toys must be > 0"));
    }
    let chol = cholesky_factor(context.reduced(), "reduced covariance")?;
    let g = context.n_groups();
    let truth = context.design() * DVector::from_column_slice(fit.averages());
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| Error::config("toys", format!("noise distribution error: {e}")))?;

    let outcomes: Vec<Option<ToyOutcome>> = (0..config.n_toys)
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(i as u64));
            let z = DVector::from_fn(context.n_data(), |_, _| normal.sample(&mut rng));
            let mut data = &truth + &chol * z;
            for term in context.nuisance() {
                let u = normal.sample(&mut rng);
                data += &term.shifts * u;
            }

            match fit_average(&context.with_data(data), minimizer) {
                Ok(res) => {
                    let pulls = (0..g)
                        .map(|k| (res.parameters[k] - fit.parameters[k]) / res.errors[k])
                        .collect();
                    Some(ToyOutcome {
                        pulls,
                        chi2: res.chi2,
                    })
                }
                Err(e) => {
                    debug!(toy = i, error = %e, "toy fit failed");
                    None
                }
            }
        })
        .collect();

    let ok: Vec<ToyOutcome> = outcomes.into_iter().flatten().collect();
    let n_failed = config.n_toys - ok.len();
    if ok.is_empty() {
        let n = config.n_toys;
        return Err(Error::NotConverged(format!("all {n} toy fits failed")));
    }

    let n_ok = ok.len() as f64;
    let mut pull_mean = vec![0.0; g];
    let mut pull_width = vec![0.0; g];
    for k in 0..g {
        let mean = ok.iter().map(|o| o.pulls[k]).sum::<f64>() / n_ok;
        let var = ok.iter().map(|o| (o.pulls[k] - mean).powi(2)).sum::<f64>() / n_ok;
        pull_mean[k] = mean;
        pull_width[k] = var.sqrt();
    }
    let chi2_mean = ok.iter().map(|o| o.chi2).sum::<f64>() / n_ok;

    Ok(ToySummary {
        n_toys: config.n_toys,
        n_failed,
        group_names: fit.group_names().to_vec(),
        pull_mean,
        pull_width,
        chi2_mean,
    })
}
