//! Covariance construction.
//!
//! - per-source full/reduced matrices and systematic shift rows (`builder`)
//! - group-average recomputation for `q` sources (`group_average`)

pub mod builder;
pub mod group_average;

pub use builder::*;
pub use group_average::*;
