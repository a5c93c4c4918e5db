//! Pairwise particle merges and sticky-cell fusion.
//!
//! Both halves are best effort: a lane that cannot take both locks of a pair
//! skips it for this step. Locks of merged or fused pairs stay set until the
//! reset pass at the end of the phase, so an entity joins at most one pair.

use super::{ClusterIndex, DeviceState, PassContext, reset_cell_locks, reset_particle_locks};
use crate::entities::{Cell, Particle};
use crate::pipeline::clusters::connect_cells;
use crate::sync::try_lock_pair;
use alien_index::{NeighborhoodIndex, SpatialMap};
use ordered_float::OrderedFloat;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct CollisionSummary {
    pub merges: u64,
    pub failed_merges: u64,
    pub fusions: u64,
}

pub(super) fn run(
    state: &mut DeviceState,
    clusters: &ClusterIndex,
    ctx: &PassContext<'_>,
) -> CollisionSummary {
    let min_len = ctx.min_len();
    let (merges, failed_merges) = merge_particles(
        state.particles.current().as_slice(),
        &state.particle_map,
        min_len,
    );
    reset_particle_locks(&mut state.particles, min_len);

    let fusions = fuse_sticky_cells(state, clusters, ctx);
    reset_cell_locks(&mut state.cells, min_len);

    CollisionSummary {
        merges,
        failed_merges,
        fusions,
    }
}

/// One lane per particle; a lane only pairs with higher indices in its grid cell.
/// Returns `(merges, skipped pairs)`.
pub(super) fn merge_particles(
    particles: &[Particle],
    map: &SpatialMap,
    min_len: usize,
) -> (u64, u64) {
    particles
        .par_iter()
        .enumerate()
        .with_min_len(min_len)
        .map(|(index, particle)| {
            if !particle.is_alive() {
                return (0, 0);
            }
            let mut partners = Vec::new();
            map.for_each_in_cell(map.cell_of(particle.pos.to_array()), &mut |other| {
                if other > index {
                    partners.push(other);
                }
            });
            let mut skipped = 0;
            for other in partners {
                let Some(partner) = particles.get(other) else {
                    continue;
                };
                let Some(pair) =
                    try_lock_pair((particle.id, &particle.lock), (partner.id, &partner.lock))
                else {
                    if !particle.is_alive() {
                        break;
                    }
                    // A dead partner was merged away by another lane, not contended.
                    if partner.is_alive() {
                        skipped += 1;
                    }
                    continue;
                };
                if !particle.is_alive() || !partner.is_alive() {
                    continue;
                }
                merge(particle, partner);
                pair.keep_locked();
                return (1, skipped);
            }
            (0, skipped)
        })
        .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1))
}

/// Fold the less energetic particle into the other. The caller holds both locks.
pub(crate) fn merge(a: &Particle, b: &Particle) {
    let (energy_a, energy_b) = (a.energy.load(), b.energy.load());
    let (survivor, absorbed) = if energy_b > energy_a { (b, a) } else { (a, b) };
    let total = energy_a + energy_b;
    let (vel_a, vel_b) = (a.vel.load(), b.vel.load());
    let velocity = if total > 0.0 {
        vel_a * (energy_a / total) + vel_b * (energy_b / total)
    } else {
        (vel_a + vel_b) * 0.5
    };
    survivor.vel.store(velocity);
    let transferred = absorbed.energy.load();
    absorbed.energy.store(0.0);
    survivor.energy.fetch_add(transferred);
    absorbed.kill();
}

#[derive(Debug, Clone, Copy)]
struct Fusion {
    a: usize,
    b: usize,
    distance: f32,
}

fn fuse_sticky_cells(state: &mut DeviceState, clusters: &ClusterIndex, ctx: &PassContext<'_>) -> u64 {
    let radius = ctx.params().cell_fusion_distance;
    let fusions: Vec<Fusion> = {
        let cells = state.cells.current().as_slice();
        let map = &state.cell_map;
        cells
            .par_iter()
            .enumerate()
            .with_min_len(ctx.min_len())
            .filter_map(|(index, cell)| find_fusion(cells, map, clusters, index, cell, radius))
            .collect()
    };

    let cells = state.cells.current_mut().as_mut_slice();
    fusions
        .into_iter()
        .filter(|fusion| connect_cells(cells, fusion.a, fusion.b, fusion.distance))
        .count() as u64
}

fn find_fusion(
    cells: &[Cell],
    map: &SpatialMap,
    clusters: &ClusterIndex,
    index: usize,
    cell: &Cell,
    radius: f32,
) -> Option<Fusion> {
    if !cell.sticky || !cell.is_alive() || !cell.has_free_slot() {
        return None;
    }
    let own = clusters.cluster_of(index)?;
    let mut candidates: Vec<(OrderedFloat<f32>, usize)> = Vec::new();
    map.neighbors_within(cell.pos.to_array(), radius, cells, &mut |other, dist_sq| {
        if other != index {
            candidates.push((dist_sq, other));
        }
    });
    candidates.sort_unstable();
    for (dist_sq, other) in candidates {
        let partner = &cells[other];
        if !partner.is_alive()
            || !partner.has_free_slot()
            || clusters.cluster_of(other) == Some(own)
        {
            continue;
        }
        let Some(pair) = try_lock_pair((cell.id, &cell.lock), (partner.id, &partner.lock)) else {
            continue;
        };
        pair.keep_locked();
        return Some(Fusion {
            a: index,
            b: other,
            distance: dist_sq.into_inner().sqrt(),
        });
    }
    None
}
