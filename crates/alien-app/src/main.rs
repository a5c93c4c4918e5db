use alien_app::{RunOptions, load_settings, random_particles, run_headless};
use alien_core::SimulationEngine;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "alien",
    version,
    about = "Run the particle/cell simulation headless and print monitor data"
)]
struct Cli {
    /// JSON settings bundle; defaults apply when omitted.
    #[arg(long, env = "ALIEN_SETTINGS")]
    settings: Option<PathBuf>,

    /// Number of timesteps to advance.
    #[arg(long, env = "ALIEN_STEPS", default_value_t = 1_000)]
    steps: u64,

    /// Particles scattered over the world before the first step.
    #[arg(long, env = "ALIEN_PARTICLES", default_value_t = 20_000)]
    particles: usize,

    /// Mean energy of the seeded particles.
    #[arg(long, env = "ALIEN_PARTICLE_ENERGY", default_value_t = 40.0)]
    particle_energy: f32,

    /// Seed for world generation and per-step draws.
    #[arg(long, env = "ALIEN_SEED")]
    seed: Option<u64>,

    /// Worker threads (0 = one per core).
    #[arg(long, env = "ALIEN_WORKERS")]
    workers: Option<usize>,

    /// Log monitor data every N steps (0 disables).
    #[arg(long, env = "ALIEN_REPORT_EVERY", default_value_t = 100)]
    report_every: u64,

    /// Cap on timesteps per second.
    #[arg(long, env = "ALIEN_MAX_TPS")]
    max_tps: Option<f64>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut settings = load_settings(cli.settings.as_deref())?;
    if let Some(seed) = cli.seed {
        settings.execution.rng_seed = seed;
    }
    if let Some(workers) = cli.workers {
        settings.execution.workers = workers;
    }

    let world = random_particles(
        cli.particles,
        cli.particle_energy,
        settings.execution.rng_seed,
        settings.world_size,
    );
    let mut engine = SimulationEngine::new(0, settings).context("failed to start simulation engine")?;
    engine.set_data(&world).context("failed to seed world")?;
    info!(
        particles = cli.particles,
        steps = cli.steps,
        "Starting headless simulation"
    );

    let report = run_headless(
        &mut engine,
        &RunOptions {
            steps: cli.steps,
            report_every: cli.report_every,
            max_tps: cli.max_tps,
        },
    )?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to encode monitor data")?
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
