//! Command line interface definition

use clap::{Parser, Subcommand};
use prm_types::OutputFormat;
use std::path::PathBuf;

/// prm - Priority-aware exclusive resource arbiter
#[derive(Parser)]
#[command(name = "prm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Priority-aware exclusive resource arbiter")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Global arguments available for all commands
#[derive(Parser)]
pub struct GlobalArgs {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Output format (overrides config)
    #[arg(long, global = true, value_enum)]
    pub output: Option<OutputFormat>,

    /// Use alternate config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of priority levels (overrides config)
    #[arg(long, global = true, value_name = "N")]
    pub levels: Option<usize>,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Walk through a fixed four-level handoff on real threads
    Scenario,

    /// Run worker threads against one arbiter and report the handoffs
    #[command(alias = "sim")]
    Simulate {
        /// Number of worker threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// Requests issued by each worker
        #[arg(short, long)]
        rounds: Option<usize>,

        /// Milliseconds each grant is held
        #[arg(long, value_name = "MS")]
        hold_ms: Option<u64>,

        /// Abandon requests that wait longer than this many milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Stop granting after this many uses in total
        #[arg(long, value_name = "N")]
        max_uses: Option<u64>,
    },

    /// Show the effective configuration
    Config,
}
