//! TOML ingest and validation.
//!
//! This module turns a measurement file into a resolved [`Dataset`]:
//!
//! ```toml
//! names  = ["m1", "m2"]
//! values = [171.5, 172.3]
//! groups = ["top", "top"]          # optional
//! correlation_factor = 0.5         # optional
//! lognormal = false                # optional
//!
//! [errors]
//! "00stat" = { values = [1.0, 2.0], option = "u" }
//! "01lumi" = "2.0 2.0 %f"          # compact form: errors then option
//!
//! [covariances]
//! "02jes" = [1.0, 0.5, 0.5, 1.0]   # coefficients for "c"
//! ```
//!
//! Design goals:
//! - **Strict schema** (unknown keys and length mismatches are errors)
//! - **Deterministic order**: error sources are sorted by key, which fixes
//!   the order of the nuisance parameters
//! - **No fitting logic here**

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::domain::{
    CorrelationInput, DEFAULT_GROUP, Dataset, ErrorSource, GlobalOptions, Measurement,
};
use crate::error::{Error, Result};

/// Raw file layout, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputFile {
    pub names: Vec<String>,
    pub values: Vec<f64>,
    #[serde(default)]
    pub groups: Option<Vec<String>>,
    #[serde(default)]
    pub correlation_factor: Option<f64>,
    #[serde(default)]
    pub lognormal: bool,
    pub errors: BTreeMap<String, ErrorEntry>,
    #[serde(default)]
    pub covariances: BTreeMap<String, CorrelationInput>,
}

/// One `[errors]` entry: a table or a compact `"e1 e2 ... option"` line.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorEntry {
    Table { values: Vec<f64>, option: String },
    Line(String),
}

impl ErrorEntry {
    fn resolve(self, key: &str) -> Result<(Vec<f64>, String)> {
        match self {
            ErrorEntry::Table { values, option } => Ok((values, option)),
            ErrorEntry::Line(line) => parse_compact_line(key, &line),
        }
    }
}

fn parse_compact_line(key: &str, line: &str) -> Result<(Vec<f64>, String)> {
    let mut tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(option) = tokens.pop() else {
        return Err(Error::config(key, "empty error line"));
    };
    if option.parse::<f64>().is_ok() {
        return Err(Error::config(key, "line must end with an option code"));
    }
    let values = tokens
        .iter()
        .map(|t| {
            t.parse::<f64>()
                .map_err(|_| Error::config(key, format!("invalid error value '{t}'")))
        })
        .collect::<Result<Vec<f64>>>()?;
    Ok((values, option.to_string()))
}

/// Read and validate a measurement file.
pub fn load_dataset(path: &Path) -> Result<Dataset> {
    let text = fs::read_to_string(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read '{}': {e}", path.display()),
        ))
    })?;
    parse_dataset(&text)
}

/// Parse and validate the contents of a measurement file.
///
/// When the file sets `lognormal = true` the returned dataset is already
/// transformed.
pub fn parse_dataset(text: &str) -> Result<Dataset> {
    let input: InputFile = toml::from_str(text)?;
    input.into_dataset()
}

impl InputFile {
    pub fn into_dataset(self) -> Result<Dataset> {
        let n = self.values.len();
        if self.names.len() != n {
            return Err(Error::config(
                "names",
                format!("{} names given for {n} values", self.names.len()),
            ));
        }
        if let Some(bad) = self.values.iter().find(|v| !v.is_finite()) {
            return Err(Error::config("values", format!("non-finite value {bad}")));
        }
        let groups = match self.groups {
            Some(groups) if groups.len() != n => {
                return Err(Error::config(
                    "groups",
                    format!("{} group labels given for {n} values", groups.len()),
                ));
            }
            Some(groups) => groups,
            None => vec![DEFAULT_GROUP.to_string(); n],
        };

        let measurements: Vec<Measurement> = self
            .names
            .into_iter()
            .zip(&self.values)
            .zip(groups)
            .map(|((name, &value), group)| Measurement { name, value, group })
            .collect();

        if self.errors.is_empty() {
            return Err(Error::config("errors", "no error sources given"));
        }

        let mut covariances = self.covariances;
        let mut sources = Vec::with_capacity(self.errors.len());
        for (key, entry) in self.errors {
            let (declared, option) = entry.resolve(&key)?;
            let correlation = covariances.remove(&key);
            sources.push(ErrorSource::new(
                key,
                declared,
                &option,
                correlation,
                &self.values,
            )?);
        }
        if let Some(orphan) = covariances.keys().next() {
            return Err(Error::config(
                orphan,
                "[covariances] entry without a matching error source",
            ));
        }

        let options = GlobalOptions {
            correlation_factor: self.correlation_factor,
        };
        let dataset = Dataset::new(measurements, sources, options)?;
        if self.lognormal {
            dataset.into_lognormal()
        } else {
            Ok(dataset)
        }
    }
}
