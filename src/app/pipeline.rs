//! Shared averaging pipeline used by every CLI command.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! dataset -> groups -> covariances -> fit context -> fit -> weights
//!
//! The commands can then focus on presentation.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::covariance::{CovarianceSet, build_covariances};
use crate::domain::{Dataset, GroupMatrix};
use crate::error::{Error, Result};
use crate::fit::{FitContext, FitResult, Minimizer, fit_average, weights_matrix};

/// Combined value of one group, in the units of the input values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedValue {
    pub group: String,
    pub value: f64,
    pub error: f64,
}

/// All computed outputs of a single averaging run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub dataset: Dataset,
    pub groups: GroupMatrix,
    pub covariances: CovarianceSet,
    pub context: FitContext,
    pub fit: FitResult,
    /// One row per group, one column per measurement.
    pub weights: nalgebra::DMatrix<f64>,
    pub combined: Vec<CombinedValue>,
}

/// Execute the full averaging pipeline and return the computed outputs.
pub fn run_average(dataset: Dataset, minimizer: &dyn Minimizer) -> Result<RunOutput> {
    // `Dataset` fields are public, so it may not have gone through `Dataset::new`.
    if dataset.is_empty() {
        return Err(Error::config("values", "no measurements given"));
    }

    // 1) Group design matrix.
    let groups = GroupMatrix::from_measurements(&dataset.measurements);
    info!(
        measurements = dataset.len(),
        sources = dataset.sources.len(),
        groups = groups.n_groups(),
        "averaging"
    );

    // 2) Per-source and total covariances.
    let covariances = build_covariances(&dataset, &groups)?;
    debug!(nuisance = covariances.syst.len(), "covariances built");

    // 3) Chi-square context and minimization.
    let context = FitContext::new(&dataset.values(), &covariances, &groups)?;
    let fit = fit_average(&context, minimizer)?;
    info!(
        chi2 = fit.chi2,
        ndof = fit.ndof,
        n_iter = fit.n_iter,
        "fit converged"
    );

    // 4) Weights and back-transformed combined values.
    let weights = weights_matrix(&context, &fit)?;
    let combined = combined_values(&fit, dataset.lognormal);

    Ok(RunOutput {
        dataset,
        groups,
        covariances,
        context,
        fit,
        weights,
        combined,
    })
}

/// Combined values per group; log-normal fits are mapped back with `exp`.
pub fn combined_values(fit: &FitResult, lognormal: bool) -> Vec<CombinedValue> {
    fit.group_names()
        .iter()
        .zip(fit.averages().iter().zip(fit.average_errors()))
        .map(|(group, (&p, &sigma))| {
            let (value, error) = if lognormal {
                let v = p.exp();
                (v, v * sigma)
            } else {
                (p, sigma)
            };
            CombinedValue {
                group: group.clone(),
                value,
                error,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GlobalOptions;
    use crate::fit::LbfgsMinimizer;
    use crate::io::parse_dataset;
    use approx::assert_relative_eq;

    const TOP_MASS: &str = r#"
names  = ["m1", "m2", "m3", "m4", "m5"]
values = [172.1, 173.4, 171.8, 172.9, 174.0]
correlation_factor = 0.5

[errors]
"00stat" = { values = [0.6, 0.9, 0.7, 1.1, 1.3], option = "u" }
"01jes"  = { values = [0.8, 0.5, 1.0, 0.7, 0.9], option = "f" }
"02lumi" = { values = [0.3, 0.3, 0.4, 0.3, 0.2], option = "%f" }
"03bkg"  = { values = [0.4, 0.3, 0.5, 0.2, 0.6], option = "u" }
"#;

    // Closed-form GLS on R + Σ s sᵀ, which profiling additive nuisances reproduces.
    const REF_AVERAGE: f64 = 172.992277118582;
    const REF_ERROR: f64 = 0.978951856351672;
    const REF_CHI2: f64 = 2.835567193448719;
    const REF_NUISANCE: [f64; 2] = [0.370863019836243, 0.261997627887865];
    const REF_NUISANCE_ERRORS: [f64; 2] = [0.926915605358777, 0.976943918256931];

    #[test]
    fn end_to_end_reference_values() {
        let ds = parse_dataset(TOP_MASS).unwrap();
        let run = run_average(ds, &LbfgsMinimizer::default()).unwrap();

        assert_eq!(run.fit.ndof, 4);
        assert_eq!(run.fit.nuisance_names(), &["jes", "lumi"]);
        assert_relative_eq!(run.combined[0].value, REF_AVERAGE, max_relative = 1e-6);
        assert_relative_eq!(run.combined[0].error, REF_ERROR, max_relative = 1e-6);
        assert_relative_eq!(run.fit.chi2, REF_CHI2, max_relative = 1e-6);
        for k in 0..2 {
            assert_relative_eq!(run.fit.nuisance()[k], REF_NUISANCE[k], epsilon = 1e-6);
            assert_relative_eq!(
                run.fit.nuisance_errors()[k],
                REF_NUISANCE_ERRORS[k],
                max_relative = 1e-6
            );
        }
        assert_relative_eq!(run.weights.row(0).sum(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn correlation_factor_damps_the_total_covariance() {
        let ds = parse_dataset(TOP_MASS).unwrap();
        let lumi = ds.source("02lumi").unwrap().errors.clone();
        let run = run_average(ds, &LbfgsMinimizer::default()).unwrap();
        let covs = &run.covariances;

        // Fully correlated off-diagonals have correlation 1 and are halved;
        // diagonals and the reduced metric are untouched.
        let jes = covs.source("01jes").unwrap();
        assert_relative_eq!(jes.covariance[(0, 1)], 0.5 * 0.8 * 0.5, epsilon = 1e-12);
        assert_relative_eq!(jes.covariance[(2, 2)], 1.0, epsilon = 1e-12);
        let expected = 0.5 * (0.8 * 0.5 + lumi[0] * lumi[1]);
        assert_relative_eq!(covs.total[(0, 1)], expected, epsilon = 1e-12);
        assert_relative_eq!(covs.total[(1, 0)], expected, epsilon = 1e-12);
        assert_eq!(covs.total_reduced[(0, 1)], 0.0);

        let undamped = TOP_MASS.replace("correlation_factor = 0.5\n", "");
        let plain = parse_dataset(&undamped).unwrap();
        let plain = run_average(plain, &LbfgsMinimizer::default()).unwrap();
        let total = &plain.covariances.total;
        assert_relative_eq!(total[(0, 1)], 2.0 * expected, epsilon = 1e-12);
        // The fit metric does not see the damping.
        assert_relative_eq!(plain.fit.chi2, run.fit.chi2, epsilon = 1e-9);
    }

    #[test]
    fn lognormal_results_are_back_transformed() {
        let text = r#"
names  = ["a", "b"]
values = [10.0, 10.0]
lognormal = true
[errors]
"00stat" = { values = [1.0, 1.0], option = "u" }
"#;
        let ds = parse_dataset(text).unwrap();
        let run = run_average(ds, &LbfgsMinimizer::default()).unwrap();
        assert_relative_eq!(run.combined[0].value, 10.0, epsilon = 1e-7);
        // ln-space error 0.1 / sqrt(2)
        assert_relative_eq!(
            run.combined[0].error,
            10.0 * 0.1 / 2.0_f64.sqrt(),
            epsilon = 1e-7
        );
    }

    #[test]
    fn singular_input_fails_before_minimizing() {
        let text = r#"
names  = ["a", "b"]
values = [10.0, 11.0]
[errors]
"01jes" = { values = [1.0, 1.0], option = "f" }
"#;
        let ds = parse_dataset(text).unwrap();
        let err = run_average(ds, &LbfgsMinimizer::default()).unwrap_err();
        assert!(err.is_numerical());
    }

    #[test]
    fn empty_dataset_is_a_config_error() {
        let ds = Dataset {
            measurements: Vec::new(),
            sources: Vec::new(),
            options: GlobalOptions::default(),
            lognormal: false,
        };
        let err = run_average(ds, &LbfgsMinimizer::default()).unwrap_err();
        assert!(matches!(err, Error::Config { ref key, .. } if key == "values"));
    }
}
