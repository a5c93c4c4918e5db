//! Population and process statistics.

use crate::entities::NUM_COLORS;
use crate::pipeline::{DeviceState, StepEvents};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative process counters since engine start.
#[derive(Debug, Default)]
pub struct ProcessCounters {
    created_cells: AtomicU64,
    successful_merges: AtomicU64,
    failed_merges: AtomicU64,
    absorptions: AtomicU64,
    decays: AtomicU64,
    fusions: AtomicU64,
}

impl ProcessCounters {
    pub fn record(&self, events: &StepEvents) {
        self.created_cells
            .fetch_add(events.created_cells, Ordering::Relaxed);
        self.successful_merges
            .fetch_add(events.merges, Ordering::Relaxed);
        self.failed_merges
            .fetch_add(events.failed_merges, Ordering::Relaxed);
        self.absorptions
            .fetch_add(events.absorptions, Ordering::Relaxed);
        self.decays.fetch_add(events.decays, Ordering::Relaxed);
        self.fusions.fetch_add(events.fusions, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ProcessStatistics {
        ProcessStatistics {
            created_cells: self.created_cells.load(Ordering::Relaxed),
            successful_merges: self.successful_merges.load(Ordering::Relaxed),
            failed_merges: self.failed_merges.load(Ordering::Relaxed),
            absorptions: self.absorptions.load(Ordering::Relaxed),
            decays: self.decays.load(Ordering::Relaxed),
            fusions: self.fusions.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Snapshot of [`ProcessCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatistics {
    pub created_cells: u64,
    pub successful_merges: u64,
    pub failed_merges: u64,
    pub absorptions: u64,
    pub decays: u64,
    pub fusions: u64,
}

/// Live counts and cumulative counters reported to collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorData {
    pub timestep: u64,
    pub num_cells: u64,
    pub num_cells_by_color: [u64; NUM_COLORS],
    pub num_particles: u64,
    pub num_tokens: u64,
    /// Undirected cell-cell connections.
    pub num_connections: u64,
    /// Energy held by live cells and particles.
    pub total_energy: f64,
    pub processes: ProcessStatistics,
}

#[derive(Debug, Clone, Copy, Default)]
struct CellTally {
    count: u64,
    by_color: [u64; NUM_COLORS],
    connection_ends: u64,
    energy: f64,
}

impl CellTally {
    fn merge(mut self, other: Self) -> Self {
        self.count += other.count;
        for (mine, theirs) in self.by_color.iter_mut().zip(other.by_color) {
            *mine += theirs;
        }
        self.connection_ends += other.connection_ends;
        self.energy += other.energy;
        self
    }
}

/// Reduction pass over the current generation.
#[must_use]
pub fn collect(state: &DeviceState, timestep: u64) -> MonitorData {
    let cells = state
        .cells
        .current()
        .as_slice()
        .par_iter()
        .filter(|cell| cell.is_alive())
        .fold(CellTally::default, |mut tally, cell| {
            tally.count += 1;
            tally.by_color[usize::from(cell.color) % NUM_COLORS] += 1;
            tally.connection_ends += u64::from(cell.num_connections);
            tally.energy += f64::from(cell.energy.load());
            tally
        })
        .reduce(CellTally::default, CellTally::merge);

    let (num_particles, particle_energy) = state
        .particles
        .current()
        .as_slice()
        .par_iter()
        .filter(|particle| particle.is_alive())
        .map(|particle| (1u64, f64::from(particle.energy.load())))
        .reduce(|| (0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

    let num_tokens = state
        .tokens
        .current()
        .as_slice()
        .par_iter()
        .filter(|token| token.alive)
        .count() as u64;

    MonitorData {
        timestep,
        num_cells: cells.count,
        num_cells_by_color: cells.by_color,
        num_particles,
        num_tokens,
        num_connections: cells.connection_ends / 2,
        total_energy: cells.energy + particle_energy,
        processes: state.counters.snapshot(),
    }
}
