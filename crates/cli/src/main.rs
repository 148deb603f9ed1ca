//! Autothrottle orchestrator CLI
//!
//! Drives closed-loop benchmark runs against the node daemons: single runs,
//! whole evaluation campaigns, and inspection of stored tower samples.

mod benchmark;
mod campaign;
mod client;
mod config;
mod deploy;
mod history;
mod loadgen;
mod output;
mod series;
mod trace;

use agent_lib::models::{ScalerKind, TowerSample};
use agent_lib::tower::{build_tower, TowerConfig};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Autothrottle orchestrator
#[derive(Parser)]
#[command(name = "autothrottle")]
#[command(author, version, about = "Closed-loop CPU autoscaling benchmark orchestrator", long_about = None)]
pub struct Cli {
    /// Experiment configuration file (TOML, JSON or YAML)
    #[arg(long, short, env = "AUTOTHROTTLE_CONFIG", default_value = "experiment.toml")]
    pub config: PathBuf,

    /// Seed for the towers' random choices
    #[arg(long)]
    pub seed: Option<u64>,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TowerArg {
    /// Keep targets fixed
    Dummy,
    /// Cycle through the target grid
    Explore,
    /// Contextual bandit
    Vw,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScalerArg {
    Const,
    K8sCpu,
    K8sCpuFast,
    Captain,
}

impl From<ScalerArg> for ScalerKind {
    fn from(arg: ScalerArg) -> Self {
        match arg {
            ScalerArg::Const => ScalerKind::Const,
            ScalerArg::K8sCpu => ScalerKind::K8sCpu,
            ScalerArg::K8sCpuFast => ScalerKind::K8sCpuFast,
            ScalerArg::Captain => ScalerKind::Captain,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one benchmark into an output directory
    Run {
        /// Output directory; the run is skipped if it exists
        output_dir: PathBuf,

        #[arg(long, value_enum, default_value = "vw")]
        tower: TowerArg,

        #[arg(long, value_enum, default_value = "captain")]
        scaler: ScalerArg,

        /// Initial target of every scaler
        #[arg(long, default_value_t = 0.0)]
        target: f64,

        /// Override the configured exploration rate
        #[arg(long)]
        explore: Option<f64>,

        /// Warm-start the tower with samples from stored runs
        #[arg(long = "samples-from")]
        samples_from: Vec<PathBuf>,
    },

    /// Run the full warm-up and evaluation campaign
    Campaign,

    /// Print the tower samples stored in run directories
    Samples {
        #[arg(required = true)]
        runs: Vec<PathBuf>,

        /// Print every sample as a JSON line
        #[arg(long)]
        json: bool,
    },
}

async fn collect_samples(runs: &[PathBuf]) -> Result<Vec<TowerSample>> {
    let mut samples = Vec::new();
    for run in runs {
        samples.extend(
            history::load_samples(run)
                .await
                .with_context(|| format!("Failed to load samples from {}", run.display()))?,
        );
    }
    Ok(samples)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            output_dir,
            tower,
            scaler,
            target,
            explore,
            samples_from,
        } => {
            let config = config::ExperimentConfig::load(&cli.config)?;
            let tower_config = match tower {
                TowerArg::Dummy => TowerConfig::Dummy,
                TowerArg::Explore => TowerConfig::Explore {
                    warmup: config.warmup_minutes,
                },
                TowerArg::Vw => TowerConfig::Vw {
                    slo: config.slo,
                    explore: explore.unwrap_or(config.explore),
                    drop_samples: config.warmup_minutes,
                    aggregate_samples: config.aggregate_samples,
                },
            };
            let samples = collect_samples(&samples_from).await?;
            let scalers = config.uniform_scalers(scaler.into(), target);
            let grid = config.action_grid(scaler.into())?;
            let mut tower = build_tower(&tower_config, grid, samples, cli.seed)?;

            match benchmark::run_benchmark(&config, &output_dir, &scalers, tower.as_mut()).await {
                Ok(Some(summary)) => {
                    output::print_summary(&output_dir, &summary, config.slo);
                    if !summary.slo_met {
                        output::print_warning("SLO not met");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    output::print_error(&format!("{:#}", e));
                    return Err(e);
                }
            }
        }
        Commands::Campaign => {
            let config = config::ExperimentConfig::load(&cli.config)?;
            let mut campaign = campaign::Campaign::new(&config, cli.seed)?;
            campaign.run_all().await?;
            output::print_success("campaign finished");
        }
        Commands::Samples { runs, json } => {
            let samples = collect_samples(&runs).await?;
            if samples.is_empty() {
                bail!("no tower samples found");
            }
            if json {
                for sample in &samples {
                    println!("{}", serde_json::to_string(sample)?);
                }
            } else {
                let measured = samples.iter().filter(|s| s.latency > 0.0).count();
                output::print_info(&format!(
                    "{} samples from {} runs ({} with latency data)",
                    samples.len(),
                    runs.len(),
                    measured
                ));
                for sample in &samples {
                    println!(
                        "  rps {:>8.1}  action {:>3}  p {:.3}  p99 {:>8}  allocation {}",
                        sample.rps,
                        sample.action,
                        sample.action_p,
                        output::format_latency(sample.latency),
                        output::format_cores(sample.allocation)
                    );
                }
            }
        }
    }

    Ok(())
}
