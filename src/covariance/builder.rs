//! Per-source covariance construction.
//!
//! For every error source we produce
//!
//! - the covariance matrix of that source,
//! - the reduced matrix (the part that stays in the fit's metric),
//! - optionally a systematic-shift row, which the fit turns into a nuisance
//!   parameter.
//!
//! Fully correlated content is moved out of the reduced matrix and into a
//! shift row, because a fully correlated source over a single group makes the
//! covariance singular. The totals are plain sums, except for sources with
//! the group-average flag (see [`crate::covariance::group_average`]).

use nalgebra::{DMatrix, DVector};

use crate::covariance::group_average::group_average_contribution;
use crate::domain::{CorrelationData, CovKind, Dataset, ElementRule, ErrorSource, GroupMatrix};
use crate::error::{Error, Result};
use crate::math::invert_spd;

/// Matrices derived from a single error source.
#[derive(Debug, Clone)]
pub struct SourceCovariance {
    pub key: String,
    pub covariance: DMatrix<f64>,
    pub reduced: DMatrix<f64>,
    /// Per-measurement shift of the source's nuisance parameter, if it has one.
    pub shifts: Option<DVector<f64>>,
}

/// One row of the systematic-error matrix.
#[derive(Debug, Clone)]
pub struct SystRow {
    pub key: String,
    pub relative: bool,
    pub shifts: DVector<f64>,
}

/// Output of the covariance build. All-or-nothing: a failed build returns
/// no matrices at all.
#[derive(Debug, Clone)]
pub struct CovarianceSet {
    pub sources: Vec<SourceCovariance>,
    pub total: DMatrix<f64>,
    pub total_reduced: DMatrix<f64>,
    /// Rows in error-source order, one per nuisance parameter.
    pub syst: Vec<SystRow>,
}

impl CovarianceSet {
    pub fn source(&self, key: &str) -> Option<&SourceCovariance> {
        self.sources.iter().find(|s| s.key == key)
    }

    pub fn dim(&self) -> usize {
        self.total.nrows()
    }
}

/// Build all covariance matrices for `dataset`.
pub fn build_covariances(dataset: &Dataset, groups: &GroupMatrix) -> Result<CovarianceSet> {
    let n = dataset.len();
    let values = dataset.values();
    let factor = dataset.options.correlation_factor;

    let mut sources = Vec::with_capacity(dataset.sources.len());
    let mut total_reduced = DMatrix::zeros(n, n);
    for source in &dataset.sources {
        let built = source_covariance(source, &values, factor)?;
        total_reduced += &built.reduced;
        sources.push(built);
    }

    // The reduced total is complete before any group-average recomputation.
    let needs_group_average = dataset.sources.iter().any(|s| s.option.group_average);
    let inv_reduced = if needs_group_average {
        Some(invert_spd(&total_reduced, "reduced covariance")?)
    } else {
        None
    };

    let mut total = DMatrix::zeros(n, n);
    for (source, built) in dataset.sources.iter().zip(&sources) {
        match &inv_reduced {
            Some(inv) if source.option.group_average => {
                total += group_average_contribution(&source.errors, &values, groups, inv)?;
            }
            _ => total += &built.covariance,
        }
    }

    let syst = dataset
        .sources
        .iter()
        .zip(&sources)
        .filter_map(|(source, built)| {
            built.shifts.as_ref().map(|shifts| SystRow {
                key: source.key.clone(),
                relative: source.option.relative,
                shifts: shifts.clone(),
            })
        })
        .collect();

    Ok(CovarianceSet {
        sources,
        total,
        total_reduced,
        syst,
    })
}

/// Covariance, reduced covariance and shift row of one source.
pub fn source_covariance(
    source: &ErrorSource,
    values: &[f64],
    correlation_factor: Option<f64>,
) -> Result<SourceCovariance> {
    let e = &source.errors;
    let n = e.len();
    if values.len() != n {
        return Err(Error::config(
            &source.key,
            format!("{n} errors given for {} measurements", values.len()),
        ));
    }

    let (mut covariance, reduced, shifts) = match source.option.kind {
        CovKind::GlobalPartialRelative => {
            let ratios = e.iter().zip(values).map(|(err, v)| err / v);
            let minrel = min_positive(ratios, e).unwrap_or(0.0);
            let cov = DMatrix::from_fn(n, n, |i, j| {
                if i == j {
                    e[i] * e[i]
                } else {
                    minrel * minrel * values[i] * values[j]
                }
            });
            let reduced = DMatrix::from_fn(n, n, |i, j| {
                if i == j {
                    (e[i] * e[i] - (minrel * values[i]).powi(2)).max(0.0)
                } else {
                    0.0
                }
            });
            let shifts = DVector::from_fn(n, |i, _| minrel * values[i]);
            (cov, Some(reduced), Some(shifts))
        }
        CovKind::GlobalPartial => {
            let minerr = min_positive(e.iter().copied(), e).unwrap_or(0.0);
            let common = minerr * minerr;
            let cov = DMatrix::from_fn(n, n, |i, j| if i == j { e[i] * e[i] } else { common });
            let reduced = DMatrix::from_fn(n, n, |i, j| {
                if i == j {
                    e[i] * e[i] - minerr * minerr
                } else {
                    0.0
                }
            });
            let shifts = DVector::from_element(n, minerr);
            (cov, Some(reduced), Some(shifts))
        }
        CovKind::Full => (
            element_matrix(e, |_, _| ElementRule::Full),
            Some(DMatrix::zeros(n, n)),
            Some(DVector::from_column_slice(e)),
        ),
        CovKind::Anti => (element_matrix(e, |_, _| ElementRule::Anti), None, None),
        CovKind::Partial => (element_matrix(e, |_, _| ElementRule::Partial), None, None),
        CovKind::Uncorrelated => (
            element_matrix(e, |_, _| ElementRule::Uncorrelated),
            None,
            None,
        ),
        CovKind::Explicit { onion } => {
            let Some(CorrelationData::Coefficients(rho)) = &source.correlation else {
                return Err(Error::config(&source.key, "no correlation coefficients"));
            };
            let cov = DMatrix::from_fn(n, n, |i, j| {
                let c = rho[i * n + j] * e[i] * e[j];
                if onion && e[i] > 0.0 && e[j] > 0.0 {
                    c.min(e[i].min(e[j]).powi(2))
                } else {
                    c
                }
            });
            (cov, None, None)
        }
        CovKind::Mixed => {
            let Some(CorrelationData::Rules(rules)) = &source.correlation else {
                return Err(Error::config(&source.key, "no per-element option codes"));
            };
            let cov = element_matrix(e, |i, j| rules[i * n + j]);
            let has_full = rules.contains(&ElementRule::Full);
            let has_partial = rules.contains(&ElementRule::Partial);
            if has_full && !has_partial {
                (
                    cov,
                    Some(DMatrix::zeros(n, n)),
                    Some(DVector::from_column_slice(e)),
                )
            } else {
                (cov, None, None)
            }
        }
    };

    if let Some(factor) = correlation_factor {
        damp_off_diagonal(&mut covariance, factor);
    }
    let reduced = reduced.unwrap_or_else(|| covariance.clone());

    Ok(SourceCovariance {
        key: source.key.clone(),
        covariance,
        reduced,
        shifts,
    })
}

fn element_matrix(e: &[f64], rule: impl Fn(usize, usize) -> ElementRule) -> DMatrix<f64> {
    let n = e.len();
    DMatrix::from_fn(n, n, |i, j| rule(i, j).covariance(e[i], e[j], i == j))
}

/// Minimum of `candidates` over positions where the error is positive.
fn min_positive(candidates: impl Iterator<Item = f64>, errors: &[f64]) -> Option<f64> {
    candidates
        .zip(errors)
        .filter(|(_, e)| **e > 0.0)
        .map(|(c, _)| c)
        .reduce(f64::min)
}

/// `m_ij *= (m_ij / sqrt(m_ii m_jj)) * factor` for `i != j`.
fn damp_off_diagonal(m: &mut DMatrix<f64>, factor: f64) {
    let n = m.nrows();
    let diag: Vec<f64> = (0..n).map(|i| m[(i, i)]).collect();
    for i in 0..n {
        for j in 0..n {
            if i == j || diag[i] == 0.0 || diag[j] == 0.0 {
                continue;
            }
            let corr = m[(i, j)] / (diag[i] * diag[j]).sqrt();
            m[(i, j)] *= corr * factor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CorrelationInput, GlobalOptions, Measurement};
    use approx::assert_relative_eq;

    const VALUES: [f64; 3] = [100.0, 110.0, 95.0];

    fn source(key: &str, errors: &[f64], code: &str) -> ErrorSource {
        ErrorSource::new(key, errors.to_vec(), code, None, &VALUES).unwrap()
    }

    fn mixed(key: &str, errors: &[f64], codes: &[&str]) -> ErrorSource {
        let codes = codes.iter().map(|s| s.to_string()).collect();
        let input = Some(CorrelationInput::Codes(codes));
        ErrorSource::new(key, errors.to_vec(), "m", input, &VALUES).unwrap()
    }

    fn dataset(sources: Vec<ErrorSource>, factor: Option<f64>) -> Dataset {
        let measurements = VALUES
            .iter()
            .enumerate()
            .map(|(i, &value)| Measurement {
                name: format!("m{i}"),
                value,
                group: "average".into(),
            })
            .collect();
        Dataset::new(
            measurements,
            sources,
            GlobalOptions {
                correlation_factor: factor,
            },
        )
        .unwrap()
    }

    #[test]
    fn uncorrelated_is_diagonal() {
        let e = [1.0, 2.0, 3.0];
        let c = source_covariance(&source("u", &e, "u"), &VALUES, None).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { e[i] * e[i] } else { 0.0 };
                assert_eq!(c.covariance[(i, j)], expected);
            }
        }
        assert_eq!(c.reduced, c.covariance);
        assert!(c.shifts.is_none());
    }

    #[test]
    fn fully_correlated_moves_into_shift_row() {
        let e = [1.0, 2.0, 3.0];
        let c = source_covariance(&source("f", &e, "f"), &VALUES, None).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(c.covariance[(i, j)], e[i] * e[j]);
                assert_eq!(c.reduced[(i, j)], 0.0);
            }
        }
        assert_eq!(c.shifts.unwrap().as_slice(), &e);
    }

    #[test]
    fn partial_uses_min_error_envelope() {
        let e = [1.0, 2.0, 3.0];
        let c = source_covariance(&source("p", &e, "p"), &VALUES, None).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(c.covariance[(i, j)], e[i].min(e[j]).powi(2));
            }
        }
        assert_eq!(c.covariance, c.covariance.transpose());
        assert_eq!(c.reduced, c.covariance);
    }

    #[test]
    fn anti_correlated_off_diagonal_is_negative() {
        let e = [1.0, 2.0, 3.0];
        let c = source_covariance(&source("a", &e, "a"), &VALUES, None).unwrap();
        assert_eq!(c.covariance[(0, 0)], 1.0);
        assert_eq!(c.covariance[(0, 1)], -2.0);
        assert_eq!(c.covariance[(2, 1)], -6.0);
    }

    #[test]
    fn global_partial_splits_common_minimum() {
        let e = [0.0, 2.0, 3.0];
        let c = source_covariance(&source("gp", &e, "gp"), &VALUES, None).unwrap();
        // Minimum over positive errors only.
        assert_eq!(c.covariance[(1, 2)], 4.0);
        assert_eq!(c.covariance[(2, 2)], 9.0);
        assert_eq!(c.reduced[(2, 2)], 5.0);
        assert_eq!(c.reduced[(1, 2)], 0.0);
        assert_eq!(c.shifts.unwrap(), DVector::from_element(3, 2.0));
    }

    #[test]
    fn global_partial_relative_scales_with_value() {
        let e = [2.0, 1.1, 1.9];
        let c = source_covariance(&source("gpr", &e, "gpr"), &VALUES, None).unwrap();
        let minrel = 0.01;
        assert_relative_eq!(
            c.covariance[(0, 1)],
            minrel * minrel * 100.0 * 110.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(c.reduced[(0, 0)], 4.0 - 1.0, epsilon = 1e-12);
        assert_relative_eq!(c.reduced[(1, 1)], 0.0, epsilon = 1e-12);
        let shifts = c.shifts.unwrap();
        assert_relative_eq!(shifts[2], 0.95, epsilon = 1e-12);
    }

    #[test]
    fn explicit_correlations_with_onion_cap() {
        let e = [1.0, 2.0, 3.0];
        let rho = vec![1.0, 0.9, 0.0, 0.9, 1.0, 0.2, 0.0, 0.2, 1.0];
        let plain = ErrorSource::new(
            "c",
            e.to_vec(),
            "c",
            Some(CorrelationInput::Coefficients(rho.clone())),
            &VALUES,
        )
        .unwrap();
        let c = source_covariance(&plain, &VALUES, None).unwrap();
        assert_relative_eq!(c.covariance[(0, 1)], 1.8);
        assert_relative_eq!(c.covariance[(1, 2)], 1.2);

        let onion = ErrorSource::new(
            "co",
            e.to_vec(),
            "co",
            Some(CorrelationInput::Coefficients(rho)),
            &VALUES,
        )
        .unwrap();
        let c = source_covariance(&onion, &VALUES, None).unwrap();
        assert_relative_eq!(c.covariance[(0, 1)], 1.0);
        assert_relative_eq!(c.covariance[(1, 2)], 1.2);
        assert_relative_eq!(c.covariance[(2, 2)], 9.0);
    }

    #[test]
    fn mixed_with_full_and_no_partial_is_fully_correlated() {
        let e = [1.0, 2.0, 3.0];
        let src = mixed("m", &e, &["u", "f", "u", "f", "u", "a", "u", "a", "u"]);
        let c = source_covariance(&src, &VALUES, None).unwrap();
        assert_eq!(c.covariance[(0, 1)], 2.0);
        assert_eq!(c.covariance[(1, 2)], -6.0);
        assert_eq!(c.covariance[(0, 2)], 0.0);
        assert_eq!(c.reduced, DMatrix::zeros(3, 3));
        assert!(c.shifts.is_some());

        let src = mixed("m2", &e, &["u", "f", "p", "f", "u", "u", "p", "u", "u"]);
        let c = source_covariance(&src, &VALUES, None).unwrap();
        assert_eq!(c.reduced, c.covariance);
        assert!(c.shifts.is_none());
    }

    #[test]
    fn damping_rescales_off_diagonal_only() {
        let e = [1.0, 2.0, 3.0];
        let c = source_covariance(&source("f", &e, "f"), &VALUES, Some(0.5)).unwrap();
        // Fully correlated: correlation is 1, so off-diagonal scales by the factor.
        assert_relative_eq!(c.covariance[(0, 1)], 1.0);
        assert_relative_eq!(c.covariance[(1, 1)], 4.0);

        let rho = vec![1.0, 0.5, 0.0, 0.5, 1.0, 0.0, 0.0, 0.0, 1.0];
        let src = ErrorSource::new(
            "c",
            e.to_vec(),
            "c",
            Some(CorrelationInput::Coefficients(rho)),
            &VALUES,
        )
        .unwrap();
        let c = source_covariance(&src, &VALUES, Some(0.5)).unwrap();
        // 1.0 * (0.5 * 0.5)
        assert_relative_eq!(c.covariance[(0, 1)], 0.25);
        assert_eq!(c.reduced, c.covariance);
    }

    #[test]
    fn totals_are_sums_of_sources() {
        let ds = dataset(
            vec![
                source("00stat", &[1.0, 2.0, 1.5], "u"),
                source("01jes", &[0.5, 0.7, 0.9], "f"),
                source("02had", &[0.3, 0.2, 0.4], "p"),
                source("03lumi", &[1.0, 1.0, 2.0], "%f"),
            ],
            Some(0.8),
        );
        let groups = GroupMatrix::from_measurements(&ds.measurements);
        let set = build_covariances(&ds, &groups).unwrap();

        let mut sum = DMatrix::zeros(3, 3);
        let mut sum_reduced = DMatrix::zeros(3, 3);
        for s in &set.sources {
            sum += &s.covariance;
            sum_reduced += &s.reduced;
        }
        assert_eq!(set.total, sum);
        assert_eq!(set.total_reduced, sum_reduced);

        assert_eq!(set.syst.len(), 2);
        assert_eq!(set.syst[0].key, "01jes");
        assert_relative_eq!(set.syst[1].shifts[2], 1.9);
    }

    #[test]
    fn group_average_source_replaces_its_total_contribution() {
        let ds = dataset(
            vec![
                source("00stat", &[1.0, 2.0, 1.5], "u"),
                source("01lumi", &[2.0, 2.0, 2.0], "%fq"),
            ],
            None,
        );
        let groups = GroupMatrix::from_measurements(&ds.measurements);
        let set = build_covariances(&ds, &groups).unwrap();
        let lumi = set.source("01lumi").unwrap();
        let stat = set.source("00stat").unwrap();
        assert_ne!(set.total, &stat.covariance + &lumi.covariance);
        // Reduced total is unaffected by the recomputation.
        assert_eq!(set.total_reduced, stat.reduced);
        // Contribution is an outer product evaluated at the common average.
        let q = &set.total - &stat.covariance;
        assert_relative_eq!(q[(0, 1)].powi(2), q[(0, 0)] * q[(1, 1)], epsilon = 1e-9);
    }

    #[test]
    fn group_average_needs_invertible_reduced_total() {
        let ds = dataset(vec![source("01lumi", &[2.0, 2.0, 2.0], "%fq")], None);
        let groups = GroupMatrix::from_measurements(&ds.measurements);
        let err = build_covariances(&ds, &groups).unwrap_err();
        assert!(err.is_numerical());
    }
}
