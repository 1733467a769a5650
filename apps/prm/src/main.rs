//! prm - Priority-aware exclusive resource arbiter
//!
//! Command line front end for exercising the arbiter: a scripted handoff
//! walk-through, a multi-threaded load simulation, and configuration display.

mod cli;
mod display;
mod error;
mod logging;
mod simulation;

use crate::cli::{Cli, Commands};
use crate::display::OutputRenderer;
use crate::error::CliError;
use crate::simulation::SimulationParams;
use clap::Parser;
use prm_config::Config;
use prm_types::OutputFormat;
use std::process;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json_mode = cli.global.json;

    logging::init_tracing(json_mode, cli.global.debug);

    if let Err(e) = run(cli).await {
        error!("Application error: {}", e);
        if !json_mode {
            eprintln!("Error: {e}");
        }
        process::exit(1);
    }
}

/// Main application logic
async fn run(cli: Cli) -> Result<(), CliError> {
    info!("Starting prm v{}", env!("CARGO_PKG_VERSION"));

    // 1. Start with file config (or defaults)
    let mut config = Config::load_or_default(cli.global.config.as_deref()).await?;

    // 2. Merge environment variables
    config.merge_env()?;

    // 3. Apply CLI flags (highest precedence)
    if let Some(levels) = cli.global.levels {
        config.manager.priority_levels = levels;
    }
    if let Some(output) = cli.global.output {
        config.general.default_output = output;
    }
    if cli.global.json {
        config.general.default_output = OutputFormat::Json;
    }
    if let Commands::Simulate {
        workers,
        rounds,
        hold_ms,
        timeout_ms,
        max_uses,
    } = &cli.command
    {
        if let Some(workers) = workers {
            config.simulation.workers = *workers;
        }
        if let Some(rounds) = rounds {
            config.simulation.rounds = *rounds;
        }
        if let Some(hold_ms) = hold_ms {
            config.simulation.hold_ms = *hold_ms;
        }
        if timeout_ms.is_some() {
            config.manager.wait_timeout_ms = *timeout_ms;
        }
        if max_uses.is_some() {
            config.manager.max_uses = *max_uses;
        }
    }

    config.validate()?;
    let renderer = OutputRenderer::new(config.general.default_output);

    match cli.command {
        Commands::Scenario => {
            let report = tokio::task::spawn_blocking(simulation::run_scenario).await??;
            renderer.render_scenario(&report)?;
        }
        Commands::Simulate { .. } => {
            let params = SimulationParams {
                levels: config.manager.levels()?,
                workers: config.simulation.workers,
                rounds: config.simulation.rounds,
                hold: config.simulation.hold(),
                timeout: config.manager.wait_timeout(),
                max_uses: config.manager.max_uses,
            };
            let report =
                tokio::task::spawn_blocking(move || simulation::run_simulation(&params)).await??;
            renderer.render_simulation(&report)?;
        }
        Commands::Config => {
            renderer.render_text(&config.to_toml()?);
        }
    }

    Ok(())
}
