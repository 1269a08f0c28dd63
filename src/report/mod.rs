//! Reporting utilities: nuisance pulls and formatted terminal output.

pub mod format;

pub use format::*;

use crate::fit::FitResult;

/// A fitted nuisance parameter, in units of its prior width.
#[derive(Debug, Clone, PartialEq)]
pub struct Pull {
    pub name: String,
    pub value: f64,
    pub error: f64,
}

/// The `top_n` nuisance parameters with the largest `|value|`.
pub fn rank_pulls(fit: &FitResult, top_n: usize) -> Vec<Pull> {
    let mut pulls: Vec<Pull> = fit
        .nuisance_names()
        .iter()
        .zip(fit.nuisance().iter().zip(fit.nuisance_errors()))
        .map(|(name, (&value, &error))| Pull {
            name: name.clone(),
            value,
            error,
        })
        .collect();
    pulls.sort_by(|a, b| {
        b.value
            .abs()
            .partial_cmp(&a.value.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    pulls.truncate(top_n);
    pulls
}
