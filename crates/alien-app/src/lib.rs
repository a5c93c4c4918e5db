//! Shared plumbing for the headless runner: settings loading, world seeding and the step loop.

use alien_core::{DataTransfer, Float2, MonitorData, NUM_COLORS, Settings, SimulationEngine, WorldSize};
use anyhow::{Context, Result};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Read a JSON settings bundle; missing fields take their defaults.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings from {}", path.display()))?;
    let settings: Settings = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse settings in {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings in {}", path.display()))?;
    Ok(settings)
}

/// Uniformly scattered particles with small random velocities.
#[must_use]
pub fn random_particles(count: usize, energy: f32, seed: u64, world: WorldSize) -> DataTransfer {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut data = DataTransfer::default();
    let (width, height) = (world.width as f32, world.height as f32);
    for _ in 0..count {
        let pos = Float2::new(rng.gen_range(0.0..width), rng.gen_range(0.0..height));
        let vel = Float2::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5));
        let offset = data.add_particle(pos, vel, rng.gen_range(0.5f32..1.5) * energy);
        data.particles[offset].color = rng.gen_range(0..NUM_COLORS as u8);
    }
    data
}

/// Options for [`run_headless`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub steps: u64,
    pub report_every: u64,
    /// Upper bound on timesteps per second; `None` runs flat out.
    pub max_tps: Option<f64>,
}

/// Advance `engine` for `options.steps` steps, logging monitor data as it goes.
pub fn run_headless(engine: &mut SimulationEngine, options: &RunOptions) -> Result<MonitorData> {
    let min_step_time = options
        .max_tps
        .filter(|tps| *tps > 0.0)
        .map(|tps| Duration::from_secs_f64(1.0 / tps));
    let started = Instant::now();

    for step in 1..=options.steps {
        let step_started = Instant::now();
        engine
            .calc_timestep()
            .with_context(|| format!("timestep {} failed", engine.current_timestep() + 1))?;

        if options.report_every > 0 && step % options.report_every == 0 {
            let data = engine.monitor_data().context("monitor pass failed")?;
            info!(
                timestep = data.timestep,
                cells = data.num_cells,
                particles = data.num_particles,
                connections = data.num_connections,
                energy = data.total_energy,
                created = data.processes.created_cells,
                merges = data.processes.successful_merges,
                "Simulation progress",
            );
        }

        if let Some(budget) = min_step_time {
            if let Some(remaining) = budget.checked_sub(step_started.elapsed()) {
                thread::sleep(remaining);
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    if options.steps > 0 && elapsed > 0.0 {
        info!(
            steps = options.steps,
            tps = options.steps as f64 / elapsed,
            growths = engine.capacity_growths(),
            "Run complete"
        );
    } else {
        warn!("Run finished without advancing the simulation");
    }
    engine.monitor_data().context("final monitor pass failed")
}
