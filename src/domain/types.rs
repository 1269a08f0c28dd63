//! Shared domain types.
//!
//! A [`Dataset`] is the fully resolved input of one averaging run:
//!
//! - the measurements (name, value, group label)
//! - the error sources, already in absolute units
//! - global options (correlation damping)
//!
//! It is built once by the loader and is immutable afterwards.

use serde::{Deserialize, Serialize};

use crate::domain::option::{CovKind, CovOption, ElementRule};
use crate::error::{Error, Result};

/// Group label used when the input does not assign groups.
pub const DEFAULT_GROUP: &str = "average";

/// One input measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub group: String,
}

/// Correlation list as declared in the input, before it is tied to an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationInput {
    Coefficients(Vec<f64>),
    Codes(Vec<String>),
}

/// Decoded per-source correlation data, `n * n` entries in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationData {
    Coefficients(Vec<f64>),
    Rules(Vec<ElementRule>),
}

/// One named source of uncertainty across all measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorSource {
    pub key: String,
    /// Absolute errors, one per measurement.
    pub errors: Vec<f64>,
    pub option: CovOption,
    /// Option code as written in the input, kept for reporting.
    pub code: String,
    pub correlation: Option<CorrelationData>,
}

impl ErrorSource {
    /// Build an error source from declared errors.
    ///
    /// Percent-flagged errors are converted with `error * value / 100`.
    pub fn new(
        key: impl Into<String>,
        declared: Vec<f64>,
        code: &str,
        correlation: Option<CorrelationInput>,
        values: &[f64],
    ) -> Result<Self> {
        let key = key.into();
        let option: CovOption = code.parse().map_err(|msg| Error::config(&key, msg))?;

        let n = values.len();
        if declared.len() != n {
            return Err(Error::config(
                &key,
                format!("{} errors given for {n} measurements", declared.len()),
            ));
        }
        if let Some(bad) = declared.iter().find(|e| !e.is_finite()) {
            return Err(Error::config(&key, format!("non-finite error {bad}")));
        }

        let errors = if option.percent {
            declared
                .iter()
                .zip(values)
                .map(|(e, v)| e * v / 100.0)
                .collect()
        } else {
            declared
        };

        let correlation = if option.needs_correlation_data() {
            let Some(input) = correlation else {
                return Err(Error::config(
                    &key,
                    format!("option '{code}' needs an entry in the [covariances] section"),
                ));
            };
            Some(decode_correlation(&key, option.kind, input, n)?)
        } else {
            None
        };

        Ok(Self {
            key,
            errors,
            option,
            code: code.trim().to_string(),
            correlation,
        })
    }

    /// Key without its leading ordering digits (`"01lumi"` -> `"lumi"`).
    pub fn display_key(&self) -> &str {
        strip_leading_digits(&self.key)
    }
}

fn decode_correlation(
    key: &str,
    kind: CovKind,
    input: CorrelationInput,
    n: usize,
) -> Result<CorrelationData> {
    let len = match &input {
        CorrelationInput::Coefficients(v) => v.len(),
        CorrelationInput::Codes(v) => v.len(),
    };
    if len != n * n {
        return Err(Error::config(
            key,
            format!("correlation list has {len} entries, expected {}", n * n),
        ));
    }

    match (kind, input) {
        (CovKind::Explicit { .. }, CorrelationInput::Coefficients(v)) => {
            Ok(CorrelationData::Coefficients(v))
        }
        (CovKind::Mixed, CorrelationInput::Codes(codes)) => {
            let rules = codes
                .iter()
                .map(|c| c.parse::<ElementRule>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|msg| Error::config(key, msg))?;
            Ok(CorrelationData::Rules(rules))
        }
        (CovKind::Explicit { .. }, CorrelationInput::Codes(_)) => {
            Err(Error::config(key, "option 'c' needs numeric coefficients"))
        }
        (_, _) => Err(Error::config(key, "option 'm' needs element codes")),
    }
}

/// Strip leading non-alphabetic characters from an error-source key.
pub fn strip_leading_digits(word: &str) -> &str {
    match word.char_indices().find(|(_, c)| c.is_alphabetic()) {
        Some((idx, _)) => &word[idx..],
        None => word,
    }
}

/// Options applying to every error source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalOptions {
    /// Damping factor applied to the off-diagonal covariance elements.
    pub correlation_factor: Option<f64>,
}

/// Resolved input of one averaging run.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub measurements: Vec<Measurement>,
    pub sources: Vec<ErrorSource>,
    pub options: GlobalOptions,
    /// Values and errors have been replaced by logarithms and relative errors.
    pub lognormal: bool,
}

impl Dataset {
    pub fn new(
        measurements: Vec<Measurement>,
        sources: Vec<ErrorSource>,
        options: GlobalOptions,
    ) -> Result<Self> {
        if measurements.is_empty() {
            return Err(Error::config("values", "no measurements given"));
        }
        let n = measurements.len();
        for source in &sources {
            if source.errors.len() != n {
                return Err(Error::config(
                    &source.key,
                    format!("{} errors given for {n} measurements", source.errors.len()),
                ));
            }
        }
        if let Some(factor) = options.correlation_factor {
            if !factor.is_finite() {
                return Err(Error::config("correlation_factor", "must be finite"));
            }
        }
        Ok(Self {
            measurements,
            sources,
            options,
            lognormal: false,
        })
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.measurements.iter().map(|m| m.name.clone()).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.measurements.iter().map(|m| m.value).collect()
    }

    pub fn source(&self, key: &str) -> Option<&ErrorSource> {
        self.sources.iter().find(|s| s.key == key)
    }

    /// Quadratic sum of all error sources per measurement.
    pub fn total_errors(&self) -> Vec<f64> {
        (0..self.len())
            .map(|i| {
                self.sources
                    .iter()
                    .map(|s| s.errors[i].powi(2))
                    .sum::<f64>()
                    .sqrt()
            })
            .collect()
    }

    /// Switch to log-normal treatment: `value -> ln(value)`, `error -> error / value`.
    ///
    /// Must run before covariance construction.
    pub fn into_lognormal(mut self) -> Result<Self> {
        if self.lognormal {
            return Ok(self);
        }
        let values = self.values();
        if let Some(m) = self.measurements.iter().find(|m| m.value <= 0.0) {
            return Err(Error::config(
                &m.name,
                format!("log-normal needs positive values, got {}", m.value),
            ));
        }
        for source in &mut self.sources {
            for (e, v) in source.errors.iter_mut().zip(&values) {
                *e /= v;
            }
        }
        for m in &mut self.measurements {
            m.value = m.value.ln();
        }
        self.lognormal = true;
        Ok(self)
    }
}
