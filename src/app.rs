//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and installs the log subscriber
//! - loads the measurement file
//! - runs the averaging pipeline (or the toy study)
//! - prints reports and writes optional exports, or re-prints an export

use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Command, FitArgs, InputArgs, MinimizerArgs, ShowArgs, ToyArgs};
use crate::domain::Dataset;
use crate::error::{Error, Result};
use crate::fit::{LbfgsMinimizer, MinimizerConfig, ToyConfig, run_toys};

pub mod pipeline;

/// Entry point for the `avg` binary.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Inputs(args) => handle_inputs(args),
        Command::Toys(args) => handle_toys(args),
        Command::Show(args) => handle_show(args),
    }
}

fn load(args: &InputArgs) -> Result<Dataset> {
    let dataset = crate::io::load_dataset(&args.input)?;
    info!(path = %args.input.display(), measurements = dataset.len(), "loaded");
    if args.lognormal {
        dataset.into_lognormal()
    } else {
        Ok(dataset)
    }
}

fn minimizer(args: &MinimizerArgs) -> Result<LbfgsMinimizer> {
    if args.max_iter == 0 {
        return Err(Error::config("max-iter", "must be at least 1"));
    }
    if !(args.tolerance.is_finite() && args.tolerance > 0.0) {
        return Err(Error::config("tolerance", "must be a positive number"));
    }
    let config = MinimizerConfig {
        max_iter: args.max_iter,
        tol: args.tolerance,
        ..MinimizerConfig::default()
    };
    Ok(LbfgsMinimizer::new(config))
}

fn handle_fit(args: FitArgs) -> Result<()> {
    let minimizer = minimizer(&args.minimizer)?;
    let dataset = load(&args.input)?;
    let run = pipeline::run_average(dataset, &minimizer)?;
    let names = run.dataset.names();

    println!("{}", crate::report::format_inputs(&run.dataset));
    if args.show_covariances {
        println!(
            "{}",
            crate::report::format_covariances(&run.covariances, &names)
        );
    }
    println!("{}", crate::report::format_fit(&run));
    println!(
        "{}",
        crate::report::format_weights(&run.weights, &names, run.fit.group_names())
    );

    if let Some(path) = &args.export {
        crate::io::export::write_result_json(path, &run)?;
        info!(path = %path.display(), "result exported");
    }

    Ok(())
}

fn handle_inputs(args: InputArgs) -> Result<()> {
    let dataset = load(&args)?;
    println!("{}", crate::report::format_inputs(&dataset));
    Ok(())
}

fn handle_toys(args: ToyArgs) -> Result<()> {
    let minimizer = minimizer(&args.minimizer)?;
    let dataset = load(&args.input)?;
    let run = pipeline::run_average(dataset, &minimizer)?;
    println!("{}", crate::report::format_fit(&run));

    let config = ToyConfig {
        n_toys: args.n_toys,
        seed: args.seed,
    };
    let summary = run_toys(&run.context, &run.fit, &minimizer, &config)?;
    println!("{}", crate::report::format_toys(&summary));
    Ok(())
}

fn handle_show(args: ShowArgs) -> Result<()> {
    let report = crate::io::export::read_result_json(&args.report)?;
    info!(
        path = %args.report.display(),
        generated_at = %report.generated_at,
        "loaded report"
    );
    println!("{}", crate::report::format_report(&report));
    Ok(())
}
