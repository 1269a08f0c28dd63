//! Command-line parsing for the measurement averager.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! covariance and fitting code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::Level;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "avg",
    version,
    about = "Combine correlated measurements with a nuisance-parameter fit"
)]
pub struct Cli {
    /// Log verbosity (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: Level,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit the combined values and print them with weights and pulls.
    Fit(FitArgs),
    /// Print the measurements and error sources as read from the input file.
    Inputs(InputArgs),
    /// Run pseudo-experiments around the fitted values and report the pulls.
    Toys(ToyArgs),
    /// Print a result previously written with `fit --export`.
    Show(ShowArgs),
}

#[derive(Debug, Args, Clone)]
pub struct InputArgs {
    /// Measurement file (TOML).
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    /// Treat values as log-normal: fit ln(x) with relative errors.
    #[arg(long)]
    pub lognormal: bool,
}

/// Stopping criteria of the L-BFGS stage.
#[derive(Debug, Args, Clone)]
pub struct MinimizerArgs {
    /// Maximum number of L-BFGS iterations.
    #[arg(long, default_value_t = 1000)]
    pub max_iter: u64,

    /// Gradient-norm tolerance of L-BFGS.
    #[arg(long, default_value_t = 1e-8)]
    pub tolerance: f64,
}

#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub minimizer: MinimizerArgs,

    /// Also print every per-source covariance matrix.
    #[arg(long)]
    pub show_covariances: bool,

    /// Export the result to JSON.
    #[arg(long, value_name = "JSON")]
    pub export: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct ToyArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub minimizer: MinimizerArgs,

    /// Number of pseudo-experiments.
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub n_toys: usize,

    /// Base random seed; toy `i` uses `seed + i`.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[derive(Debug, Args, Clone)]
pub struct ShowArgs {
    /// Result file written by `fit --export`.
    #[arg(value_name = "JSON")]
    pub report: PathBuf,
}
