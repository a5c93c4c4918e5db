//! Device-resident entity types.
//!
//! Fields that lanes of one pass mutate through a shared slice are atomics
//! (energy, liveness, particle velocity, collision locks). Everything else is
//! only written by passes that hold the arena exclusively.

use crate::arena::ArenaEntity;
use crate::sync::{AtomicF32, SpinLock};
use alien_index::Locatable;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Neg, Sub};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Engine-wide stable identifier. Survives compaction, unlike arena indices.
pub type EntityId = u64;

/// Upper bound on connections per cell.
pub const MAX_CONNECTIONS: usize = 6;
/// Number of distinct cell colours tracked by the monitor.
pub const NUM_COLORS: usize = 7;
/// Bytes of token memory.
pub const TOKEN_MEMORY: usize = 8;

/// Two-component vector used for positions and velocities.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Float2 {
    pub x: f32,
    pub y: f32,
}

impl Float2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn length_squared(self) -> f32 {
        self.x * self.x + self.y * self.y
    }

    #[must_use]
    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }

    /// z-component of the 3D cross product.
    #[must_use]
    pub fn cross(self, other: Self) -> f32 {
        self.x * other.y - self.y * other.x
    }

    /// Counter-clockwise perpendicular.
    #[must_use]
    pub fn perp(self) -> Self {
        Self::new(-self.y, self.x)
    }

    /// Rescale to at most `max` length.
    #[must_use]
    pub fn clamp_length(self, max: f32) -> Self {
        let len = self.length();
        if len > max && len > 0.0 {
            self * (max / len)
        } else {
            self
        }
    }

    #[must_use]
    pub const fn to_array(self) -> [f32; 2] {
        [self.x, self.y]
    }
}

impl From<[f32; 2]> for Float2 {
    fn from(value: [f32; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl Add for Float2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Float2 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Float2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Float2 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl Neg for Float2 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

/// Velocity pair written by collision lanes holding both entity locks.
#[derive(Debug, Clone, Default)]
pub struct AtomicFloat2 {
    x: AtomicF32,
    y: AtomicF32,
}

impl AtomicFloat2 {
    #[must_use]
    pub fn new(value: Float2) -> Self {
        Self {
            x: AtomicF32::new(value.x),
            y: AtomicF32::new(value.y),
        }
    }

    #[must_use]
    pub fn load(&self) -> Float2 {
        Float2::new(self.x.load(), self.y.load())
    }

    pub fn store(&self, value: Float2) {
        self.x.store(value.x);
        self.y.store(value.y);
    }

    pub fn set(&mut self, value: Float2) {
        self.x.set(value.x);
        self.y.set(value.y);
    }
}

/// Selection marker carried by cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SelectionState {
    #[default]
    Unselected,
    /// Picked directly.
    Selected,
    /// Picked because another member of the cluster was.
    ClusterSelected,
}

impl SelectionState {
    #[must_use]
    pub const fn is_selected(self) -> bool {
        !matches!(self, Self::Unselected)
    }
}

/// Point energy packet.
#[derive(Debug, Default)]
pub struct Particle {
    pub id: EntityId,
    pub pos: Float2,
    pub vel: AtomicFloat2,
    pub energy: AtomicF32,
    pub color: u8,
    pub selected: bool,
    pub alive: AtomicBool,
    pub lock: SpinLock,
}

impl Particle {
    #[must_use]
    pub fn new(id: EntityId, pos: Float2, vel: Float2, energy: f32) -> Self {
        Self {
            id,
            pos,
            vel: AtomicFloat2::new(vel),
            energy: AtomicF32::new(energy),
            color: 0,
            selected: false,
            alive: AtomicBool::new(true),
            lock: SpinLock::new(),
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark dead. Returns whether this call performed the transition.
    pub fn kill(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Energy left after subtracting the kinetic share (unit mass).
    #[must_use]
    pub fn inner_energy(&self) -> f32 {
        self.energy.load() - 0.5 * self.vel.load().length_squared()
    }
}

impl Clone for Particle {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            pos: self.pos,
            vel: self.vel.clone(),
            energy: self.energy.clone(),
            color: self.color,
            selected: self.selected,
            alive: AtomicBool::new(self.is_alive()),
            lock: SpinLock::new(),
        }
    }
}

impl ArenaEntity for Particle {
    fn is_alive(&self) -> bool {
        Particle::is_alive(self)
    }
}

impl Locatable for Particle {
    fn location(&self) -> [f32; 2] {
        self.pos.to_array()
    }

    fn is_indexed(&self) -> bool {
        self.is_alive()
    }
}

/// Edge from a cell to a neighbour in the same arena generation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Connection {
    pub index: u32,
    /// Rest distance between the two cells.
    pub distance: f32,
}

/// Node of a cluster.
#[derive(Debug, Default)]
pub struct Cell {
    pub id: EntityId,
    pub pos: Float2,
    pub vel: Float2,
    pub energy: AtomicF32,
    pub max_connections: u8,
    pub num_connections: u8,
    pub connections: [Connection; MAX_CONNECTIONS],
    pub color: u8,
    pub barrier: bool,
    pub sticky: bool,
    pub selected: SelectionState,
    /// Angular velocity of the owning cluster, radians per step.
    pub angular_velocity: f32,
    pub name: Option<Arc<str>>,
    pub alive: AtomicBool,
    pub lock: SpinLock,
}

impl Cell {
    #[must_use]
    pub fn new(id: EntityId, pos: Float2, vel: Float2, energy: f32, max_connections: u8) -> Self {
        Self {
            id,
            pos,
            vel,
            energy: AtomicF32::new(energy),
            max_connections: max_connections.min(MAX_CONNECTIONS as u8),
            alive: AtomicBool::new(true),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn kill(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn connections(&self) -> &[Connection] {
        &self.connections[..usize::from(self.num_connections)]
    }

    #[must_use]
    pub fn is_connected_to(&self, index: u32) -> bool {
        self.connections().iter().any(|c| c.index == index)
    }

    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.num_connections < self.max_connections.min(MAX_CONNECTIONS as u8)
    }

    /// Append an edge; refuses duplicates and full lists.
    pub fn add_connection(&mut self, index: u32, distance: f32) -> bool {
        if !self.has_free_slot() || self.is_connected_to(index) {
            return false;
        }
        self.connections[usize::from(self.num_connections)] = Connection { index, distance };
        self.num_connections += 1;
        true
    }

    pub fn remove_connection(&mut self, index: u32) -> bool {
        let count = usize::from(self.num_connections);
        let Some(pos) = self.connections[..count].iter().position(|c| c.index == index) else {
            return false;
        };
        self.connections.copy_within(pos + 1..count, pos);
        self.connections[count - 1] = Connection::default();
        self.num_connections -= 1;
        true
    }

    pub fn clear_connections(&mut self) {
        self.connections = [Connection::default(); MAX_CONNECTIONS];
        self.num_connections = 0;
    }

    /// Rewrite neighbour indices; edges mapped to `None` are dropped.
    pub fn remap_connections(&mut self, mut map: impl FnMut(u32) -> Option<u32>) {
        let mut kept = [Connection::default(); MAX_CONNECTIONS];
        let mut count = 0;
        for connection in self.connections() {
            if let Some(index) = map(connection.index) {
                kept[count] = Connection {
                    index,
                    distance: connection.distance,
                };
                count += 1;
            }
        }
        self.connections = kept;
        self.num_connections = count as u8;
    }
}

impl Clone for Cell {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            pos: self.pos,
            vel: self.vel,
            energy: self.energy.clone(),
            max_connections: self.max_connections,
            num_connections: self.num_connections,
            connections: self.connections,
            color: self.color,
            barrier: self.barrier,
            sticky: self.sticky,
            selected: self.selected,
            angular_velocity: self.angular_velocity,
            name: self.name.clone(),
            alive: AtomicBool::new(self.is_alive()),
            lock: SpinLock::new(),
        }
    }
}

impl ArenaEntity for Cell {
    fn is_alive(&self) -> bool {
        Cell::is_alive(self)
    }
}

impl Locatable for Cell {
    fn location(&self) -> [f32; 2] {
        self.pos.to_array()
    }

    fn is_indexed(&self) -> bool {
        self.is_alive()
    }
}

/// Execution state riding on a cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Token {
    pub id: EntityId,
    /// Index of the host cell in the current cell generation.
    pub cell: u32,
    pub energy: f32,
    pub memory: [u8; TOKEN_MEMORY],
    pub alive: bool,
}

impl ArenaEntity for Token {
    fn is_alive(&self) -> bool {
        self.alive
    }
}
