//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - decoded covariance option codes (`CovOption`, `ElementRule`)
//! - measurements, error sources and the resolved `Dataset`
//! - the measurement-to-group design matrix (`GroupMatrix`)

pub mod groups;
pub mod option;
pub mod types;

pub use groups::*;
pub use option::*;
pub use types::*;
