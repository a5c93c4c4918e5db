use super::{ClusterIndex, ClusterMotion, DeviceState, PassContext};
use rayon::prelude::*;

/// Integrate particle velocities and move every cluster as a rigid body.
pub(super) fn run(state: &mut DeviceState, clusters: &ClusterIndex, ctx: &PassContext<'_>) {
    let world = *ctx.world();
    let min_len = ctx.min_len();
    let max_velocity = ctx.params().max_velocity;
    let flow = &ctx.settings.flow_field;

    state
        .particles
        .current_mut()
        .as_mut_slice()
        .par_iter_mut()
        .with_min_len(min_len)
        .for_each(|particle| {
            if !particle.is_alive() {
                return;
            }
            let damping = 1.0 - ctx.local(particle.pos).friction;
            let velocity = ((particle.vel.load() + flow.acceleration(&world, particle.pos))
                * damping)
                .clamp_length(max_velocity);
            particle.vel.set(velocity);
            particle.pos = world.wrap(particle.pos + velocity);
        });

    // One lane per cluster computes the shared motion; members read it after the pass.
    let motions: Vec<ClusterMotion> = {
        let cells = state.cells.current().as_slice();
        clusters
            .par_members()
            .map(|members| ClusterMotion::compute(cells, members, ctx))
            .collect()
    };

    state
        .cells
        .current_mut()
        .as_mut_slice()
        .par_iter_mut()
        .enumerate()
        .with_min_len(min_len)
        .for_each(|(index, cell)| {
            let Some(cluster) = clusters.cluster_of(index) else {
                return;
            };
            let motion = &motions[cluster as usize];
            let (pos, vel) = motion.apply(&world, cell.pos);
            cell.pos = pos;
            cell.vel = vel;
            cell.angular_velocity = motion.angular_velocity;
        });
}
