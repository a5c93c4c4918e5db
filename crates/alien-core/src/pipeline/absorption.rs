use super::{DeviceState, PassContext};
use alien_index::NeighborhoodIndex;
use rayon::prelude::*;

/// Move the energy of particles sitting on a live cell into that cell.
/// Returns the number of absorbed particles.
pub(super) fn run(state: &mut DeviceState, ctx: &PassContext<'_>) -> u64 {
    // Transformation may have added cells since the last rebuild.
    state.cell_map.rebuild(state.cells.current().as_slice());

    let cap = ctx.params().cell_max_energy;
    let cells = state.cells.current().as_slice();
    let map = &state.cell_map;
    state
        .particles
        .current()
        .as_slice()
        .par_iter()
        .with_min_len(ctx.min_len())
        .filter(|particle| {
            if !particle.is_alive() {
                return false;
            }
            let energy = particle.energy.load();
            let mut absorbed = false;
            map.for_each_in_cell(map.cell_of(particle.pos.to_array()), &mut |index| {
                if absorbed {
                    return;
                }
                let Some(cell) = cells.get(index) else {
                    return;
                };
                if cell.is_alive() && !cell.barrier && cell.energy.try_add_within(energy, cap) {
                    absorbed = true;
                }
            });
            if absorbed {
                particle.kill();
            }
            absorbed
        })
        .count() as u64
}
