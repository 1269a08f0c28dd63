//! `avg-combine` library crate.
//!
//! Combines several correlated measurements of the same quantities into one
//! value per group. Error sources are turned into covariance matrices; fully
//! correlated parts become nuisance parameters of a chi-square fit.
//!
//! The binary (`avg`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the covariance builder and the fit are reusable on their own

pub mod app;
pub mod cli;
pub mod covariance;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod report;
