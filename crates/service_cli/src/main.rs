//! revolve - Command Line Operations for the Checkpointed Adjoint Tape
//!
//! # Commands
//!
//! - `revolve schedule --blocks N --fast S [--slow T]` - Simulate the
//!   binomial schedule and print its replay count and snapshot traffic
//! - `revolve run` - Differentiate a time-stepping demo under the configured
//!   checkpointing schedule and verify it against finite differences
//! - `revolve check` - Validate and print the resolved configuration
//!
//! Configuration is resolved from CLI arguments, `TAPE_*` environment
//! variables, a TOML file and defaults, in that order.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod error;

pub use error::{CliError, Result};

use commands::run::DemoParams;
use config::{build_config, CliArgs};

/// Checkpointed adjoint tape CLI
#[derive(Parser)]
#[command(name = "revolve")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output (schedule events at info level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Checkpointing overrides shared by `run` and `check`.
#[derive(Args, Debug, Clone)]
struct CheckpointArgs {
    /// Configuration file path (TOML format)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Checkpointing mode (all-in-memory, periodic, binomial)
    #[arg(short, long)]
    mode: Option<String>,

    /// Blocks per slow-tier snapshot (periodic)
    #[arg(long)]
    period: Option<usize>,

    /// Total number of blocks (binomial)
    #[arg(long)]
    total_blocks: Option<usize>,

    /// In-memory snapshot slots (binomial)
    #[arg(long)]
    fast: Option<usize>,

    /// On-disk snapshot slots (binomial)
    #[arg(long)]
    slow: Option<usize>,

    /// Directory for slow-tier snapshots
    #[arg(long, value_name = "DIR")]
    tier_path: Option<PathBuf>,

    /// Slow-tier format (binary, json)
    #[arg(long)]
    format: Option<String>,
}

impl CheckpointArgs {
    fn into_cli_args(self, verbose: bool) -> CliArgs {
        CliArgs {
            config_file: self.config,
            mode: self.mode,
            period: self.period,
            total_blocks: self.total_blocks,
            fast_capacity: self.fast,
            slow_capacity: self.slow,
            tier_path: self.tier_path,
            format: self.format,
            verbose,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate the binomial schedule
    Schedule {
        /// Number of blocks
        #[arg(short, long)]
        blocks: usize,

        /// In-memory snapshot slots
        #[arg(short, long)]
        fast: usize,

        /// On-disk snapshot slots
        #[arg(short, long, default_value = "0")]
        slow: usize,
    },

    /// Differentiate the time-stepping demo and verify the gradient
    Run {
        #[command(flatten)]
        checkpoint: CheckpointArgs,

        /// Number of time steps (fixed by --total-blocks in binomial mode)
        #[arg(long, default_value = "20")]
        steps: usize,

        /// State dimension
        #[arg(long, default_value = "4")]
        dim: usize,

        /// Time step
        #[arg(long, default_value = "0.05")]
        dt: f64,
    },

    /// Validate and print the resolved checkpointing configuration
    Check {
        #[command(flatten)]
        checkpoint: CheckpointArgs,
    },
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if cli.verbose {
        info!("Verbose mode enabled");
    }

    match cli.command {
        Commands::Schedule { blocks, fast, slow } => {
            commands::schedule::run(blocks, fast, slow, cli.json)?
        }
        Commands::Run {
            checkpoint,
            steps,
            dim,
            dt,
        } => {
            let config = build_config(&checkpoint.into_cli_args(cli.verbose))
                .context("failed to resolve the checkpointing configuration")?;
            commands::run::run(config, DemoParams { steps, dim, dt }, cli.json)
                .context("demo run failed")?
        }
        Commands::Check { checkpoint } => {
            let config = build_config(&checkpoint.into_cli_args(cli.verbose))
                .context("failed to resolve the checkpointing configuration")?;
            commands::check::run(&config, cli.json)?
        }
    }
    Ok(())
}
