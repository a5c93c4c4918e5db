use super::DeviceState;
use rayon::prelude::*;

/// Entities dropped by one compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    pub particles: usize,
    pub cells: usize,
    pub tokens: usize,
}

/// Copy live entities into the next generation and swap. Cell connections and
/// token hosts are rewritten to the new indices; edges to dropped cells and
/// tokens on dropped cells disappear.
pub(super) fn run(state: &mut DeviceState) -> CompactionSummary {
    let particles = state.particles.compact();
    let cells = state.cells.compact();
    state
        .cells
        .current_mut()
        .as_mut_slice()
        .par_iter_mut()
        .for_each(|cell| cell.remap_connections(|old| cells.get(old)));

    let tokens = state
        .tokens
        .compact_with(|token| cells.get(token.cell).is_some());
    state
        .tokens
        .current_mut()
        .as_mut_slice()
        .par_iter_mut()
        .for_each(|token| {
            if let Some(index) = cells.get(token.cell) {
                token.cell = index;
            }
        });

    state.invalidate_maps();
    CompactionSummary {
        particles: particles.dropped(),
        cells: cells.dropped(),
        tokens: tokens.dropped(),
    }
}
