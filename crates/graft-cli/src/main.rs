//! # graft-cli
//!
//! Command-line host for the Graft module framework. It loads a directory of
//! bundle descriptors into a framework, resolves or runs them, and reports
//! what happened.

use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::CommandContext;
use output::errors::ErrorFormatter;

/// Run and inspect sets of Graft bundles
#[derive(Parser)]
#[command(name = "graft", version, about = "Run and inspect Graft bundle sets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file; defaults to graft.toml in the working directory
    /// or one of its parents
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<Utf8PathBuf>,

    /// Override a configuration value, e.g. --set begin-start-level=3
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration and, optionally, a bundle directory
    Check {
        /// Directory of bundle descriptors
        bundles: Option<Utf8PathBuf>,
    },
    /// Install a bundle directory into an in-memory framework and resolve it
    Resolve {
        /// Directory of bundle descriptors
        bundles: Utf8PathBuf,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Install and start a bundle directory, then shut the framework down
    Run {
        /// Directory of bundle descriptors
        bundles: Utf8PathBuf,
        /// Start level to run at instead of the configured one
        #[arg(long)]
        level: Option<u32>,
    },
    /// List the bundles recorded in the configured cache directory
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_json);
    setup_panic_handler();

    info!("Starting graft v{}", env!("CARGO_PKG_VERSION"));

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            eprint!("{}", ErrorFormatter::default().format_error(&err));
            ExitCode::FAILURE
        }
    }
}

fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let ctx = CommandContext::new(cli.config.as_deref(), &cli.overrides)?;
    commands::dispatch_command(cli.command, &ctx)
}

fn setup_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "graft={level},graft_framework={level},graft_resolver={level},graft_cache={level},graft_config={level}"
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        error!("graft encountered an unexpected error: {}", panic_info);
        eprintln!("graft crashed! This is a bug.");
        eprintln!("Error: {}", panic_info);
    }));
}
