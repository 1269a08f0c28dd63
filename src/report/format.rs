//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the covariance and fitting code stays clean and testable
//! - output changes are localized

use nalgebra::DMatrix;

use crate::app::pipeline::RunOutput;
use crate::covariance::CovarianceSet;
use crate::domain::{CorrelationData, Dataset};
use crate::fit::ToySummary;
use crate::io::AverageReport;
use crate::report::rank_pulls;

const NAME_WIDTH: usize = 16;
const COL_WIDTH: usize = 12;

/// Measurements, per-source errors and totals, plus declared correlation lists.
pub fn format_inputs(dataset: &Dataset) -> String {
    let mut out = String::new();

    out.push_str("=== avg - inputs ===\n");
    if dataset.lognormal {
        out.push_str("Log-normal treatment: values are ln(x), errors are relative\n");
    }
    if let Some(f) = dataset.options.correlation_factor {
        out.push_str(&format!("Correlation factor: {f}\n"));
    }
    out.push('\n');

    let mut header = format!(
        "{:<NAME_WIDTH$} {:<10} {:>COL_WIDTH$}",
        "name", "group", "value"
    );
    let mut rule = format!("{:-<NAME_WIDTH$} {:-<10} {:-<COL_WIDTH$}", "", "", "");
    for source in &dataset.sources {
        let label = format!("{} ({})", source.display_key(), source.code);
        header.push_str(&format!(" {:>COL_WIDTH$}", truncate(&label, COL_WIDTH)));
        rule.push_str(&format!(" {:-<COL_WIDTH$}", ""));
    }
    header.push_str(&format!(" {:>COL_WIDTH$}", "total"));
    rule.push_str(&format!(" {:-<COL_WIDTH$}", ""));
    out.push_str(header.trim_end());
    out.push('\n');
    out.push_str(rule.trim_end());
    out.push('\n');

    let totals = dataset.total_errors();
    for (i, m) in dataset.measurements.iter().enumerate() {
        let mut line = format!(
            "{:<NAME_WIDTH$} {:<10} {:>COL_WIDTH$.4}",
            truncate(&m.name, NAME_WIDTH),
            truncate(&m.group, 10),
            m.value
        );
        for source in &dataset.sources {
            line.push_str(&format!(" {:>COL_WIDTH$.4}", source.errors[i]));
        }
        line.push_str(&format!(" {:>COL_WIDTH$.4}", totals[i]));
        out.push_str(line.trim_end());
        out.push('\n');
    }

    for source in &dataset.sources {
        let Some(correlation) = &source.correlation else {
            continue;
        };
        out.push_str(&format!("\nCorrelations of {}:\n", source.display_key()));
        let n = dataset.len();
        match correlation {
            CorrelationData::Coefficients(rho) => {
                for row in rho.chunks(n) {
                    out.push_str(&format!("  {}\n", fmt_vec(row, 3)));
                }
            }
            CorrelationData::Rules(rules) => {
                for row in rules.chunks(n) {
                    let codes: Vec<&str> = row.iter().map(|r| r.code()).collect();
                    out.push_str(&format!("  {}\n", codes.join(" ")));
                }
            }
        }
    }

    out
}

/// Per-source covariance matrices followed by the totals.
pub fn format_covariances(covariances: &CovarianceSet, names: &[String]) -> String {
    let mut out = String::new();
    for source in &covariances.sources {
        out.push_str(&format!("Covariance {}:\n", source.key));
        out.push_str(&format_matrix(&source.covariance, names));
        out.push('\n');
    }
    out.push_str("Total covariance:\n");
    out.push_str(&format_matrix(&covariances.total, names));
    out.push('\n');
    out.push_str("Reduced covariance (fit metric):\n");
    out.push_str(&format_matrix(&covariances.total_reduced, names));
    out
}

/// Combined values, nuisance pulls and fit quality.
pub fn format_fit(run: &RunOutput) -> String {
    let fit = &run.fit;
    let mut out = String::new();

    out.push_str("=== avg - combined values ===\n");
    for c in &run.combined {
        out.push_str(&value_line(&c.group, c.value, c.error));
    }
    if run.dataset.lognormal {
        out.push_str("(transformed back from ln-space)\n");
    }

    let (chi2, ndof) = (fit.chi2, fit.ndof);
    let quality = match fit.chi2_per_ndof() {
        Some(r) => format!("chi2/ndof = {chi2:.4}/{ndof} = {r:.4}"),
        None => format!("chi2 = {chi2:.4} (ndof = 0)"),
    };
    out.push_str(&format!("\n{quality}\n"));

    if !fit.nuisance().is_empty() {
        out.push_str("\nNuisance parameters (largest pulls first):\n");
        let header = format!(
            "{:<NAME_WIDTH$} {:>COL_WIDTH$} {:>COL_WIDTH$}",
            "name", "value", "error"
        );
        out.push_str(header.trim_end());
        out.push('\n');
        for pull in rank_pulls(fit, fit.nuisance().len()) {
            out.push_str(&format!(
                "{:<NAME_WIDTH$} {:>COL_WIDTH$.4} {:>COL_WIDTH$.4}\n",
                truncate(&pull.name, NAME_WIDTH),
                pull.value,
                pull.error
            ));
        }
    }

    if run.groups.n_groups() > 1 {
        out.push_str("\nCorrelation of the combined values:\n");
        let cov = fit.average_covariance();
        let g = cov.nrows();
        let sigma: Vec<f64> = (0..g).map(|i| cov[(i, i)].sqrt()).collect();
        let corr = DMatrix::from_fn(g, g, |i, j| cov[(i, j)] / (sigma[i] * sigma[j]));
        out.push_str(&format_matrix(&corr, fit.group_names()));
    }

    out
}

/// Weights of each measurement, one column per group.
pub fn format_weights(weights: &DMatrix<f64>, names: &[String], groups: &[String]) -> String {
    let mut out = String::new();
    out.push_str("Weights:\n");
    let mut header = format!("{:<NAME_WIDTH$}", "name");
    for g in groups {
        header.push_str(&format!(" {:>COL_WIDTH$}", truncate(g, COL_WIDTH)));
    }
    out.push_str(header.trim_end());
    out.push('\n');
    for (i, name) in names.iter().enumerate() {
        let mut line = format!("{:<NAME_WIDTH$}", truncate(name, NAME_WIDTH));
        for k in 0..groups.len() {
            line.push_str(&format!(" {:>COL_WIDTH$.4}", weights[(k, i)]));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

pub fn format_toys(summary: &ToySummary) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "=== avg - toys: {} generated, {} failed ===\n",
        summary.n_toys, summary.n_failed
    ));
    let header = format!(
        "{:<NAME_WIDTH$} {:>COL_WIDTH$} {:>COL_WIDTH$}",
        "group", "pull mean", "pull width"
    );
    out.push_str(header.trim_end());
    out.push('\n');
    for (k, g) in summary.group_names.iter().enumerate() {
        out.push_str(&format!(
            "{:<NAME_WIDTH$} {:>COL_WIDTH$.4} {:>COL_WIDTH$.4}\n",
            truncate(g, NAME_WIDTH),
            summary.pull_mean[k],
            summary.pull_width[k]
        ));
    }
    out.push_str(&format!("mean chi2 = {:.4}\n", summary.chi2_mean));
    out
}

/// Exported result, re-printed without refitting.
pub fn format_report(report: &AverageReport) -> String {
    let mut out = String::new();
    let stamp = report.generated_at.format("%Y-%m-%d %H:%M:%S UTC");
    let tool = &report.tool;
    out.push_str(&format!("=== {tool} - exported result ({stamp}) ===\n"));
    for c in &report.averages {
        out.push_str(&value_line(&c.group, c.value, c.error));
    }
    if report.lognormal {
        out.push_str("(transformed back from ln-space)\n");
    }
    let (chi2, ndof) = (report.chi2, report.ndof);
    out.push_str(&format!("\nchi2 = {chi2:.4}, ndof = {ndof}\n"));

    if !report.nuisance.is_empty() {
        out.push_str("\nNuisance parameters:\n");
        for n in &report.nuisance {
            out.push_str(&format!(
                "{:<NAME_WIDTH$} {:>COL_WIDTH$.4} {:>COL_WIDTH$.4}\n",
                truncate(&n.name, NAME_WIDTH),
                n.value,
                n.error
            ));
        }
    }

    out.push_str("\nWeights:\n");
    for (i, name) in report.measurements.iter().enumerate() {
        let mut line = format!("{:<NAME_WIDTH$}", truncate(name, NAME_WIDTH));
        for row in &report.weights {
            let w = row.get(i).copied().unwrap_or(f64::NAN);
            line.push_str(&format!(" {w:>COL_WIDTH$.4}"));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn value_line(group: &str, value: f64, error: f64) -> String {
    format!("{group:<NAME_WIDTH$} {value:.6} +- {error:.6}\n")
}

fn format_matrix(m: &DMatrix<f64>, names: &[String]) -> String {
    let mut out = String::new();
    for (i, name) in names.iter().enumerate() {
        let mut line = format!("  {:<NAME_WIDTH$}", truncate(name, NAME_WIDTH));
        for j in 0..m.ncols() {
            line.push_str(&format!(" {:>COL_WIDTH$.5}", m[(i, j)]));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn fmt_vec(v: &[f64], digits: usize) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.digits$}")).collect();
    format!("[{}]", parts.join(", "))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        if i + 1 >= max {
            break;
        }
        out.push(ch);
    }
    out.push('.');
    out
}
