//! Export averaging results to JSON.
//!
//! The report is meant to be easy to consume from downstream scripts: the
//! combined values in input units, the nuisance parameters, the fit quality
//! and the weight matrix, stamped with the generation time.

use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::pipeline::{CombinedValue, RunOutput};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NuisanceValue {
    pub name: String,
    pub value: f64,
    pub error: f64,
}

/// Portable representation of one averaging run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageReport {
    pub tool: String,
    pub generated_at: DateTime<Utc>,
    pub lognormal: bool,
    pub measurements: Vec<String>,
    pub averages: Vec<CombinedValue>,
    pub nuisance: Vec<NuisanceValue>,
    pub chi2: f64,
    pub ndof: usize,
    /// One row per group, one entry per measurement.
    pub weights: Vec<Vec<f64>>,
}

impl AverageReport {
    pub fn from_run(run: &RunOutput, generated_at: DateTime<Utc>) -> Self {
        let fit = &run.fit;
        let nuisance = fit
            .nuisance_names()
            .iter()
            .zip(fit.nuisance().iter().zip(fit.nuisance_errors()))
            .map(|(name, (&value, &error))| NuisanceValue {
                name: name.clone(),
                value,
                error,
            })
            .collect();
        let weights = run
            .weights
            .row_iter()
            .map(|row| row.iter().copied().collect())
            .collect();

        Self {
            tool: "avg".to_string(),
            generated_at,
            lognormal: run.dataset.lognormal,
            measurements: run.dataset.names(),
            averages: run.combined.clone(),
            nuisance,
            chi2: fit.chi2,
            ndof: fit.ndof,
            weights,
        }
    }
}

/// Write the report of `run` as pretty-printed JSON.
pub fn write_result_json(path: &Path, run: &RunOutput) -> Result<()> {
    let report = AverageReport::from_run(run, Utc::now());
    let file = File::create(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to create '{}': {e}", path.display()),
        ))
    })?;
    serde_json::to_writer_pretty(file, &report)?;
    Ok(())
}

/// Read a report written by [`write_result_json`].
pub fn read_result_json(path: &Path) -> Result<AverageReport> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(file)?)
}
