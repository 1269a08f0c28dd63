//! Dense linear algebra helpers on top of nalgebra.

pub mod linalg;

pub use linalg::*;
