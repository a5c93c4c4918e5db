use super::{DeviceState, PassContext};
use crate::entities::{Cell, Particle};
use rand::Rng;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct TransformationSummary {
    pub created_cells: u64,
    pub decays: u64,
}

/// Decay starving cells into particles, then turn energetic particles into cells.
pub(super) fn run(state: &mut DeviceState, ctx: &PassContext<'_>) -> TransformationSummary {
    let decays = decay_cells(state, ctx);
    let created_cells = particles_to_cells(state, ctx);
    TransformationSummary {
        created_cells,
        decays,
    }
}

fn decay_cells(state: &mut DeviceState, ctx: &PassContext<'_>) -> u64 {
    let min_energy = ctx.params().cell_min_energy;
    let spawned: Vec<(usize, Particle)> = {
        let particles = state.particles.current();
        state
            .cells
            .current()
            .as_slice()
            .par_iter()
            .with_min_len(ctx.min_len())
            .filter_map(|cell| {
                if !cell.is_alive() || cell.barrier || cell.energy.load() >= min_energy {
                    return None;
                }
                // No slot: the cell survives and retries after the arena grows.
                let slot = particles.allocate(1)?.start;
                cell.kill();
                let mut particle = Particle::new(0, cell.pos, cell.vel, cell.energy.load());
                particle.color = cell.color;
                Some((slot, particle))
            })
            .collect()
    };

    let count = spawned.len() as u64;
    for (slot, mut particle) in spawned {
        particle.id = state.allocate_id();
        state.particles.current_mut().put(slot, particle);
    }
    count
}

fn particles_to_cells(state: &mut DeviceState, ctx: &PassContext<'_>) -> u64 {
    let params = ctx.params();
    let created: Vec<(usize, Cell)> = {
        let cells = state.cells.current();
        state
            .particles
            .current()
            .as_slice()
            .par_iter()
            .with_min_len(ctx.min_len())
            .filter_map(|particle| {
                if !particle.is_alive()
                    || particle.inner_energy() <= params.particle_transformation_min_energy
                {
                    return None;
                }
                let probability = ctx.local(particle.pos).particle_transformation_probability;
                if ctx.rng_for(particle.id).gen_range(0.0f32..1.0) >= probability {
                    return None;
                }
                let slot = cells.allocate(1)?.start;
                particle.kill();
                let mut cell = Cell::new(
                    0,
                    particle.pos,
                    particle.vel.load(),
                    particle.energy.load(),
                    params.cell_max_connections,
                );
                cell.color = particle.color;
                Some((slot, cell))
            })
            .collect()
    };

    let count = created.len() as u64;
    for (slot, mut cell) in created {
        cell.id = state.allocate_id();
        state.cells.current_mut().put(slot, cell);
    }
    count
}
