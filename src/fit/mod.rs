//! Averaging fit.
//!
//! Responsibilities:
//!
//! - chi-square objective with one nuisance per systematic row (`chi2`)
//! - minimizer contract and the L-BFGS + Hesse implementation (`minimizer`)
//! - run the fit and collect its result (`fitter`)
//! - weights of each measurement in the combined values (`weights`)
//! - pseudo-experiment pulls (`toys`)

pub mod chi2;
pub mod fitter;
pub mod minimizer;
pub mod toys;
pub mod weights;

pub use chi2::*;
pub use fitter::*;
pub use minimizer::*;
pub use toys::*;
pub use weights::*;
