//! Run the averaging fit and collect its result.
//!
//! All parameters start at zero with unit steps; the combined values come
//! first, one per group, followed by the nuisance parameters in error-source
//! order.

use nalgebra::DMatrix;

use crate::error::Result;
use crate::fit::chi2::FitContext;
use crate::fit::minimizer::Minimizer;

/// Immutable snapshot of one fit.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub names: Vec<String>,
    pub parameters: Vec<f64>,
    pub errors: Vec<f64>,
    /// Covariance of all parameters (groups then nuisances).
    pub covariance: DMatrix<f64>,
    pub n_groups: usize,
    pub chi2: f64,
    pub ndof: usize,
    pub n_iter: u64,
}

impl FitResult {
    pub fn averages(&self) -> &[f64] {
        &self.parameters[..self.n_groups]
    }

    pub fn average_errors(&self) -> &[f64] {
        &self.errors[..self.n_groups]
    }

    pub fn group_names(&self) -> &[String] {
        &self.names[..self.n_groups]
    }

    pub fn nuisance(&self) -> &[f64] {
        &self.parameters[self.n_groups..]
    }

    pub fn nuisance_errors(&self) -> &[f64] {
        &self.errors[self.n_groups..]
    }

    pub fn nuisance_names(&self) -> &[String] {
        &self.names[self.n_groups..]
    }

    /// Covariance of the combined values only.
    pub fn average_covariance(&self) -> DMatrix<f64> {
        self.covariance
            .view((0, 0), (self.n_groups, self.n_groups))
            .into_owned()
    }

    pub fn chi2_per_ndof(&self) -> Option<f64> {
        (self.ndof > 0).then(|| self.chi2 / self.ndof as f64)
    }
}

/// Minimize the chi-square of `context`.
pub fn fit_average(context: &FitContext, minimizer: &dyn Minimizer) -> Result<FitResult> {
    let n_params = context.n_params();
    let start = vec![0.0; n_params];
    let steps = vec![1.0; n_params];
    let names = context.parameter_names();
    let ndof = context.ndof();

    let out = minimizer.minimize(context, &start, &steps, &names, ndof)?;

    Ok(FitResult {
        names,
        parameters: out.parameters,
        errors: out.errors,
        covariance: out.covariance,
        n_groups: context.n_groups(),
        chi2: out.fval,
        ndof,
        n_iter: out.n_iter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::build_covariances;
    use crate::domain::{Dataset, ErrorSource, GlobalOptions, GroupMatrix, Measurement};
    use crate::fit::minimizer::LbfgsMinimizer;
    use crate::math::{gls_map, invert_spd};
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn dataset(values: &[f64], groups: &[&str], sources: &[(&str, Vec<f64>, &str)]) -> Dataset {
        let measurements = values
            .iter()
            .zip(groups)
            .enumerate()
            .map(|(i, (&value, group))| Measurement {
                name: format!("m{i}"),
                value,
                group: group.to_string(),
            })
            .collect();
        let sources = sources
            .iter()
            .map(|(k, e, c)| ErrorSource::new(*k, e.clone(), c, None, values).unwrap())
            .collect();
        Dataset::new(measurements, sources, GlobalOptions::default()).unwrap()
    }

    fn fit(ds: &Dataset) -> (FitContext, FitResult) {
        let groups = GroupMatrix::from_measurements(&ds.measurements);
        let cov = build_covariances(ds, &groups).unwrap();
        let ctx = FitContext::new(&ds.values(), &cov, &groups).unwrap();
        let res = fit_average(&ctx, &LbfgsMinimizer::default()).unwrap();
        (ctx, res)
    }

    #[test]
    fn uncorrelated_average_is_inverse_variance_mean() {
        let ds = dataset(
            &[10.0, 12.0, 11.0],
            &["x", "x", "x"],
            &[("00stat", vec![1.0, 2.0, 0.5], "u")],
        );
        let (_, res) = fit(&ds);
        let w = [1.0, 0.25, 4.0];
        let sw: f64 = w.iter().sum();
        let mean = (10.0 * w[0] + 12.0 * w[1] + 11.0 * w[2]) / sw;
        assert_relative_eq!(res.averages()[0], mean, epsilon = 1e-8);
        let error = (1.0 / sw).sqrt();
        assert_relative_eq!(res.average_errors()[0], error, epsilon = 1e-8);
        assert_eq!(res.ndof, 2);
        assert!(res.nuisance().is_empty());
    }

    #[test]
    fn nuisance_fit_equals_gls_with_full_covariance() {
        // Profiling the nuisance parameters of additive sources is equivalent
        // to GLS with the covariance R + Σ s sᵀ.
        let values = [10.0, 12.0, 11.0, 10.5];
        let ds = dataset(
            &values,
            &["x", "x", "x", "x"],
            &[
                ("00stat", vec![1.0, 2.0, 0.5, 1.5], "u"),
                ("01jes", vec![0.4, 0.8, 0.3, 0.6], "f"),
                ("02gp", vec![0.5, 0.7, 0.6, 0.9], "gp"),
            ],
        );
        let (ctx, res) = fit(&ds);

        let groups = GroupMatrix::from_measurements(&ds.measurements);
        let cov = build_covariances(&ds, &groups).unwrap();
        let mut full = cov.total_reduced.clone();
        for row in &cov.syst {
            full += &row.shifts * row.shifts.transpose();
        }
        let inv = invert_spd(&full, "full").unwrap();
        let map = gls_map(groups.matrix(), &inv, None).unwrap();
        let d = DVector::from_column_slice(&values);
        let avg = map.estimate(&d)[0];
        assert_relative_eq!(res.averages()[0], avg, epsilon = 1e-7);
        assert_relative_eq!(
            res.average_errors()[0],
            map.covariance[(0, 0)].sqrt(),
            epsilon = 1e-7
        );

        let r = &d - groups.matrix() * DVector::from_element(1, avg);
        let chi2 = (r.transpose() * invert_spd(&full, "full").unwrap() * &r)[(0, 0)];
        assert_relative_eq!(res.chi2, chi2, epsilon = 1e-7);
        assert_relative_eq!(ctx.chi2(&res.parameters), res.chi2, epsilon = 1e-12);
        assert_eq!(res.nuisance_names(), &["jes", "gp"]);
    }

    #[test]
    fn one_average_per_group() {
        let ds = dataset(
            &[10.0, 12.0, 20.0, 22.0],
            &["b", "b", "a", "a"],
            &[("00stat", vec![1.0, 1.0, 1.0, 1.0], "u")],
        );
        let (_, res) = fit(&ds);
        assert_eq!(res.group_names(), &["a", "b"]);
        assert_relative_eq!(res.averages()[0], 21.0, epsilon = 1e-8);
        assert_relative_eq!(res.averages()[1], 11.0, epsilon = 1e-8);
        assert_eq!(res.ndof, 2);
        assert_eq!(res.average_covariance().shape(), (2, 2));
    }
}
