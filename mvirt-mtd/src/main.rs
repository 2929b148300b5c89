//! mvirt-mtd: moving-target-defense controller daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mvirt_mtd::config::MtdConfig;
use mvirt_mtd::controller::Controller;
use mvirt_mtd::scheduler::RotationScheduler;
use mvirt_mtd::telemetry::log_notices;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// mvirt moving-target-defense controller
#[derive(Parser, Debug)]
#[command(name = "mvirt-mtd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller until SIGINT/SIGTERM
    Run {
        /// Path to the JSON configuration
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the mappings a number of rotations would produce
    Plan {
        /// Path to the JSON configuration
        #[arg(long)]
        config: PathBuf,

        /// Number of rotations to simulate
        #[arg(long, default_value = "1")]
        rotations: u32,

        /// RNG seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_mtd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run { config } => run(MtdConfig::load(&config)?).await,
        Command::Plan {
            config,
            rotations,
            seed,
        } => plan(&MtdConfig::load(&config)?, rotations, seed),
    }
}

async fn run(config: MtdConfig) -> Result<()> {
    let (min, max) = config.rotation_interval.bounds()?;
    info!(
        hosts = config.real_hosts.len(),
        pool = config.virtual_pool.size(),
        min_secs = min.as_secs_f64(),
        max_secs = max.as_secs_f64(),
        "Starting mvirt-mtd"
    );

    let handle = Controller::new(&config).spawn();
    let notice_log = log_notices(handle.subscribe());
    let scheduler = RotationScheduler::new(min, max).spawn(handle.rotation_ticks());

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }

    scheduler.abort();
    handle.shutdown().await;
    notice_log.abort();
    Ok(())
}

fn plan(config: &MtdConfig, rotations: u32, seed: Option<u64>) -> Result<()> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut state = config.address_state();

    for _ in 0..rotations {
        let mapping = state
            .rotate(&mut rng)
            .with_context(|| format!("Rotation {} failed", state.generation() + 1))?;
        let line = json!({
            "generation": state.generation(),
            "mapping": mapping.entries(),
        });
        println!("{}", line);
    }
    Ok(())
}
