//! Cluster reconstruction and rigid-body motion.
//!
//! Clusters are not stored. Each step the connected components of the cell
//! graph are rebuilt, then one lane per cluster derives the shared motion
//! (centre, velocity, angular velocity and rotation matrix) that every member
//! cell reads in the following pass.

use super::PassContext;
use crate::config::WorldSize;
use crate::entities::{Cell, Float2};
use rayon::prelude::*;

const NO_CLUSTER: u32 = u32::MAX;

/// Connected components of the live cell graph of one generation.
#[derive(Debug, Clone, Default)]
pub struct ClusterIndex {
    cluster_of: Vec<u32>,
    members: Vec<Vec<u32>>,
}

impl ClusterIndex {
    /// Union-find over the connection lists. Cluster ids follow the index of
    /// their first member, so the numbering is deterministic.
    #[must_use]
    pub fn build(cells: &[Cell]) -> Self {
        let len = cells.len();
        let mut parent: Vec<u32> = (0..len as u32).collect();
        for (index, cell) in cells.iter().enumerate() {
            if !cell.is_alive() {
                continue;
            }
            for connection in cell.connections() {
                let other = connection.index as usize;
                if other < len && cells[other].is_alive() {
                    let a = find_root(&mut parent, index as u32);
                    let b = find_root(&mut parent, other as u32);
                    if a != b {
                        parent[a.max(b) as usize] = a.min(b);
                    }
                }
            }
        }

        let mut root_cluster = vec![NO_CLUSTER; len];
        let mut cluster_of = vec![NO_CLUSTER; len];
        let mut members: Vec<Vec<u32>> = Vec::new();
        for (index, cell) in cells.iter().enumerate() {
            if !cell.is_alive() {
                continue;
            }
            let root = find_root(&mut parent, index as u32) as usize;
            if root_cluster[root] == NO_CLUSTER {
                root_cluster[root] = members.len() as u32;
                members.push(Vec::new());
            }
            let cluster = root_cluster[root];
            cluster_of[index] = cluster;
            members[cluster as usize].push(index as u32);
        }
        Self {
            cluster_of,
            members,
        }
    }

    /// Cluster of the cell at `index`; `None` for dead or unknown cells.
    #[must_use]
    pub fn cluster_of(&self, index: usize) -> Option<u32> {
        match self.cluster_of.get(index) {
            Some(&NO_CLUSTER) | None => None,
            Some(&cluster) => Some(cluster),
        }
    }

    #[must_use]
    pub fn members(&self, cluster: u32) -> &[u32] {
        self.members
            .get(cluster as usize)
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn par_members(&self) -> impl IndexedParallelIterator<Item = &[u32]> {
        self.members.par_iter().map(Vec::as_slice)
    }

    /// Members of every cluster touched by `seeds`, sorted and deduplicated.
    #[must_use]
    pub fn expand(&self, seeds: impl IntoIterator<Item = usize>) -> Vec<u32> {
        let mut clusters: Vec<u32> = seeds
            .into_iter()
            .filter_map(|index| self.cluster_of(index))
            .collect();
        clusters.sort_unstable();
        clusters.dedup();
        let mut cells: Vec<u32> = clusters
            .into_iter()
            .flat_map(|cluster| self.members(cluster).iter().copied())
            .collect();
        cells.sort_unstable();
        cells
    }
}

fn find_root(parent: &mut [u32], mut node: u32) -> u32 {
    while parent[node as usize] != node {
        let grand = parent[parent[node as usize] as usize];
        parent[node as usize] = grand;
        node = grand;
    }
    node
}

/// Shared rigid-body update of one cluster for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterMotion {
    pub center: Float2,
    pub next_center: Float2,
    pub velocity: Float2,
    pub angular_velocity: f32,
    cos: f32,
    sin: f32,
}

impl ClusterMotion {
    /// Derive the cluster's motion from its member cells.
    #[must_use]
    pub fn compute(cells: &[Cell], members: &[u32], ctx: &PassContext<'_>) -> Self {
        let world = ctx.world();
        let Some(&first) = members.first() else {
            return Self::at_rest(Float2::ZERO);
        };
        let anchor = cells[first as usize].pos;
        let count = members.len() as f32;

        let mut offset_sum = Float2::ZERO;
        let mut velocity_sum = Float2::ZERO;
        let mut spin_sum = 0.0;
        let mut barrier = false;
        for &member in members {
            let cell = &cells[member as usize];
            offset_sum += world.delta(anchor, cell.pos);
            velocity_sum += cell.vel;
            spin_sum += cell.angular_velocity;
            barrier |= cell.barrier;
        }
        let mean_offset = offset_sum * (1.0 / count);
        let center = world.wrap(anchor + mean_offset);
        if barrier {
            return Self::at_rest(center);
        }

        let mut velocity = velocity_sum * (1.0 / count);
        let mut momentum = 0.0;
        let mut inertia = 0.0;
        for &member in members {
            let cell = &cells[member as usize];
            let arm = world.delta(anchor, cell.pos) - mean_offset;
            momentum += arm.cross(cell.vel - velocity);
            inertia += arm.length_squared();
        }
        let mut angular_velocity = if inertia > 1e-6 {
            momentum / inertia
        } else {
            spin_sum / count
        };

        let local = ctx.local(center);
        let damping = 1.0 - local.friction;
        velocity = (velocity + ctx.settings.flow_field.acceleration(world, center)) * damping;
        velocity = velocity.clamp_length(ctx.params().max_velocity);
        angular_velocity *= damping;

        let (sin, cos) = angular_velocity.sin_cos();
        Self {
            center,
            next_center: world.wrap(center + velocity),
            velocity,
            angular_velocity,
            cos,
            sin,
        }
    }

    fn at_rest(center: Float2) -> Self {
        Self {
            center,
            next_center: center,
            velocity: Float2::ZERO,
            angular_velocity: 0.0,
            cos: 1.0,
            sin: 0.0,
        }
    }

    #[must_use]
    pub fn rotate(&self, arm: Float2) -> Float2 {
        Float2::new(
            arm.x * self.cos - arm.y * self.sin,
            arm.x * self.sin + arm.y * self.cos,
        )
    }

    /// New position and velocity of a member currently at `pos`.
    #[must_use]
    pub fn apply(&self, world: &WorldSize, pos: Float2) -> (Float2, Float2) {
        let arm = self.rotate(world.delta(self.center, pos));
        (
            world.wrap(self.next_center + arm),
            self.velocity + arm.perp() * self.angular_velocity,
        )
    }
}

/// Add a symmetric edge between two cells. Fails without side effects when
/// either side has no free slot or the edge already exists.
pub fn connect_cells(cells: &mut [Cell], a: usize, b: usize, distance: f32) -> bool {
    if a == b || a >= cells.len() || b >= cells.len() {
        return false;
    }
    let (first, second) = (&cells[a], &cells[b]);
    if !first.has_free_slot() || !second.has_free_slot() || first.is_connected_to(b as u32) {
        return false;
    }
    cells[a].add_connection(b as u32, distance);
    cells[b].add_connection(a as u32, distance);
    true
}

/// Remove the edge between two cells on both sides.
pub fn disconnect_cells(cells: &mut [Cell], a: usize, b: usize) {
    if let Some(cell) = cells.get_mut(a) {
        cell.remove_connection(b as u32);
    }
    if let Some(cell) = cells.get_mut(b) {
        cell.remove_connection(a as u32);
    }
}
