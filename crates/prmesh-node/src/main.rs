//! prnode - Poisson-reverse routing simulator
//!
//! Builds a topology from configuration, runs the routing protocol on every
//! node and prints the resulting routing tables.

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use prmesh_node::config::{Config, LoggingConfig, SimulationMode};
use prmesh_node::Simulation;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "prnode", version)]
#[command(about = "Run the Poisson-reverse routing protocol over a simulated network")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, env = "PRNODE_CONFIG")]
    config: Option<PathBuf>,

    /// Write a default configuration file and exit
    #[arg(long)]
    init: bool,

    /// Simulation duration in seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Seconds between routing updates
    #[arg(long)]
    update_interval: Option<f64>,

    /// Cost parameter (Poisson mean)
    #[arg(long)]
    cost_parameter: Option<f64>,

    /// Deployment RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Clock to run on
    #[arg(long, value_enum)]
    mode: Option<SimulationMode>,

    /// Log filter, e.g. "info" or "prmesh_routing=debug"
    #[arg(long, env = "PRNODE_LOG")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.init {
        let config = Config::create_default(cli.config)?;
        println!("Created configuration at {}", config.config_path().display());
        return Ok(());
    }

    let (mut config, loaded) = match cli.config.clone() {
        Some(path) => (Config::load(Some(path))?, true),
        None if Config::default_config_path().exists() => (Config::load(None)?, true),
        None => (Config::default(), false),
    };
    apply_overrides(&mut config, &cli);

    init_logging(&config.logging)?;
    if loaded {
        info!("Loaded configuration from {}", config.config_path().display());
    } else {
        info!("No configuration file found, using built-in defaults");
    }

    let simulation = Simulation::new(config)?;
    let report = simulation.run().await?;

    println!("{}", report.tables());
    for node in &report.nodes {
        info!(
            "Node {}: {} cycles, {} routes installed, {} withdrawn, {} skipped",
            node.node,
            node.stats.cycles_run,
            node.stats.routes_installed,
            node.stats.routes_withdrawn,
            node.stats.candidates_skipped
        );
    }
    info!("Simulation finished after {:.1}s", report.elapsed.as_secs_f64());

    if !report.start_failures.is_empty() {
        for (node, e) in &report.start_failures {
            error!("Node {}: {}", node, e);
        }
        bail!(
            "routing failed to start on {} of {} nodes",
            report.start_failures.len(),
            simulation.topology().nodes().len()
        );
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(duration) = cli.duration {
        config.simulation.duration_secs = duration;
    }
    if let Some(interval) = cli.update_interval {
        config.routing.update_interval_secs = interval;
    }
    if let Some(cost_parameter) = cli.cost_parameter {
        config.routing.cost_parameter = cost_parameter;
    }
    if let Some(seed) = cli.seed {
        config.routing.seed = Some(seed);
    }
    if let Some(mode) = cli.mode {
        config.simulation.mode = mode;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| anyhow!("invalid log level {:?}: {}", config.level, e))?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("failed to initialize logging: {}", e))
}
