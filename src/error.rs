//! Error type shared by the library and the `avg` binary.
//!
//! Configuration problems and numerical failures are kept as distinct
//! variants: a singular matrix or a failed minimization cannot be fixed by
//! editing an option code, and callers usually want to tell them apart.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad input: unknown option code, missing covariance list, length mismatch.
    #[error("configuration error in '{key}': {message}")]
    Config { key: String, message: String },

    /// A matrix that must be inverted is singular (or not positive definite).
    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    /// The minimizer did not reach a minimum.
    #[error("minimization did not converge: {0}")]
    NotConverged(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Process exit code used by the binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config { .. } | Error::Io(_) | Error::Toml(_) | Error::Json(_) => 2,
            Error::SingularMatrix(_) => 3,
            Error::NotConverged(_) => 4,
        }
    }

    pub fn is_numerical(&self) -> bool {
        matches!(self, Error::SingularMatrix(_) | Error::NotConverged(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
