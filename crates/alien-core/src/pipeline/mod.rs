//! Per-timestep physics pipeline.
//!
//! Phases run in a fixed order; each is a full rayon pass submitted through
//! [`Device::run`], so the return of one phase is the synchronisation point
//! before the next.

mod absorption;
pub mod clusters;
mod collision;
mod compaction;
mod movement;
mod transformation;

pub use clusters::{ClusterIndex, ClusterMotion};
pub use compaction::CompactionSummary;

use crate::arena::Generations;
use crate::config::{LocalParameters, Settings, SimulationParameters, WorldSize};
use crate::device::Device;
use crate::entities::{Cell, EntityId, Float2, Particle, Token};
use crate::error::EngineError;
use crate::monitor::ProcessCounters;
use alien_index::SpatialMap;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// All device-resident state owned by the engine.
#[derive(Debug)]
pub struct DeviceState {
    pub particles: Generations<Particle>,
    pub cells: Generations<Cell>,
    pub tokens: Generations<Token>,
    pub particle_map: SpatialMap,
    pub cell_map: SpatialMap,
    pub counters: ProcessCounters,
    next_id: AtomicU64,
    maps_fresh: bool,
}

impl DeviceState {
    pub fn new(settings: &Settings) -> Result<Self, EngineError> {
        let world = settings.world_size;
        let layers = settings.parameters.map_layers;
        let capacity = settings.capacity;
        Ok(Self {
            particles: Generations::with_capacity(capacity.particles),
            cells: Generations::with_capacity(capacity.cells),
            tokens: Generations::with_capacity(capacity.tokens),
            particle_map: SpatialMap::new(world.width, world.height, layers)?,
            cell_map: SpatialMap::new(world.width, world.height, layers)?,
            counters: ProcessCounters::default(),
            next_id: AtomicU64::new(1),
            maps_fresh: false,
        })
    }

    /// Hand out a fresh engine-wide id.
    pub fn allocate_id(&self) -> EntityId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure future ids never collide with `id`.
    pub fn reserve_id(&mut self, id: EntityId) {
        let next = self.next_id.get_mut();
        *next = (*next).max(id.saturating_add(1));
    }

    /// Clear and repopulate both spatial maps from the current generation.
    pub fn rebuild_maps(&mut self) {
        self.particle_map.rebuild(self.particles.current().as_slice());
        self.cell_map.rebuild(self.cells.current().as_slice());
        self.maps_fresh = true;
    }

    /// Rebuild the maps if any pass invalidated them.
    pub fn ensure_maps(&mut self) {
        if !self.maps_fresh {
            self.rebuild_maps();
        }
    }

    /// Mark the maps stale after positions or indices changed.
    pub fn invalidate_maps(&mut self) {
        self.maps_fresh = false;
    }

    /// Swap in fresh maps when the world or layer count changed.
    pub fn reshape_maps(&mut self, world: WorldSize, layers: u32) -> Result<(), EngineError> {
        self.particle_map = SpatialMap::new(world.width, world.height, layers)?;
        self.cell_map = SpatialMap::new(world.width, world.height, layers)?;
        self.maps_fresh = false;
        Ok(())
    }

    /// Drop every entity and the process counters that described them.
    pub fn clear(&mut self) {
        self.particles.clear();
        self.cells.clear();
        self.tokens.clear();
        self.counters.reset();
        self.maps_fresh = false;
    }

    /// Any arena ran out of room since the last inspection.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.particles.overflowed() || self.cells.overflowed() || self.tokens.overflowed()
    }
}

/// Read-only per-step context passed into every pass.
#[derive(Debug, Clone, Copy)]
pub struct PassContext<'a> {
    pub settings: &'a Settings,
    pub timestep: u64,
}

impl<'a> PassContext<'a> {
    #[must_use]
    pub const fn new(settings: &'a Settings, timestep: u64) -> Self {
        Self { settings, timestep }
    }

    #[must_use]
    pub const fn world(&self) -> &WorldSize {
        &self.settings.world_size
    }

    #[must_use]
    pub const fn params(&self) -> &SimulationParameters {
        &self.settings.parameters
    }

    #[must_use]
    pub fn local(&self, pos: Float2) -> LocalParameters {
        self.settings.local_parameters(pos)
    }

    /// Minimum items per rayon task.
    #[must_use]
    pub fn min_len(&self) -> usize {
        self.settings.execution.work_group_size.max(1)
    }

    /// Random stream for one entity in this step, independent of scheduling.
    #[must_use]
    pub fn rng_for(&self, id: EntityId) -> SmallRng {
        let mut seed = self.settings.execution.rng_seed;
        for word in [self.timestep, id] {
            seed = splitmix64(seed ^ word);
        }
        SmallRng::seed_from_u64(seed)
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// What happened during one timestep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepEvents {
    pub timestep: u64,
    pub merges: u64,
    pub failed_merges: u64,
    pub fusions: u64,
    pub created_cells: u64,
    pub decays: u64,
    pub absorptions: u64,
    pub compaction: CompactionSummary,
}

/// Advance the device state by one timestep.
pub fn run_timestep(
    device: &Device,
    state: &mut DeviceState,
    ctx: &PassContext<'_>,
) -> Result<StepEvents, EngineError> {
    let clusters = device.run("clusters", || {
        ClusterIndex::build(state.cells.current().as_slice())
    })?;
    device.run("movement", || movement::run(state, &clusters, ctx))?;
    device.run("map_rebuild", || state.rebuild_maps())?;
    let collisions = device.run("collision", || collision::run(state, &clusters, ctx))?;
    let transformed = device.run("transformation", || transformation::run(state, ctx))?;
    let absorptions = device.run("absorption", || absorption::run(state, ctx))?;
    let compaction = device.run("compaction", || compaction::run(state))?;

    let events = StepEvents {
        timestep: ctx.timestep,
        merges: collisions.merges,
        failed_merges: collisions.failed_merges,
        fusions: collisions.fusions,
        created_cells: transformed.created_cells,
        decays: transformed.decays,
        absorptions,
        compaction,
    };
    state.counters.record(&events);
    debug!(
        timestep = events.timestep,
        particles = state.particles.current().count(),
        cells = state.cells.current().count(),
        merges = events.merges,
        created = events.created_cells,
        absorbed = events.absorptions,
        "timestep complete"
    );
    Ok(events)
}

/// Stand-alone compaction, used after editing passes.
pub fn compact(state: &mut DeviceState) -> CompactionSummary {
    compaction::run(state)
}

/// Release every collision lock set during a pass.
pub(crate) fn reset_particle_locks(particles: &mut Generations<Particle>, min_len: usize) {
    particles
        .current_mut()
        .as_mut_slice()
        .par_iter_mut()
        .with_min_len(min_len)
        .for_each(|particle| particle.lock.reset());
}

pub(crate) fn reset_cell_locks(cells: &mut Generations<Cell>, min_len: usize) {
    cells
        .current_mut()
        .as_mut_slice()
        .par_iter_mut()
        .with_min_len(min_len)
        .for_each(|cell| cell.lock.reset());
}
