//! Toroidal spatial map used for neighbourhood queries and collision detection.
//!
//! The map discretises the world into unit grid cells. Every grid cell owns a
//! fixed number of layered slots, each holding one entity reference. Slots are
//! atomics so a rebuild can run with one rayon lane per entity.

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use thiserror::Error;

/// Slot value marking a free layer. Occupied slots store `entity + 1`.
const EMPTY: u32 = 0;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., zero-sized grid).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Fold `value` onto `[0, size)`.
///
/// Negative and overflowing coordinates wrap around the torus. Non-finite input
/// and non-positive sizes collapse to zero.
#[must_use]
pub fn wrap(value: f32, size: f32) -> f32 {
    if !value.is_finite() || size.is_nan() || size <= 0.0 {
        return 0.0;
    }
    let mut folded = value % size;
    if folded < 0.0 {
        folded += size;
    }
    // `folded + size` may round up to exactly `size` for tiny negative remainders.
    if folded >= size { 0.0 } else { folded }
}

/// Shortest signed offset from `from` to `to` on a ring of circumference `size`.
#[must_use]
pub fn wrapped_delta(from: f32, to: f32, size: f32) -> f32 {
    let half = size * 0.5;
    wrap(to - from + half, size) - half
}

/// Integer coordinates of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCell {
    pub x: u32,
    pub y: u32,
}

/// Anything that can be written into a spatial map.
pub trait Locatable {
    /// World-space position (wrapped by the map on insert).
    fn location(&self) -> [f32; 2];

    /// Entities returning `false` are skipped during bulk inserts (e.g., dead entries).
    fn is_indexed(&self) -> bool {
        true
    }
}

impl Locatable for [f32; 2] {
    fn location(&self) -> [f32; 2] {
        *self
    }
}

/// Common behaviour exposed by neighbourhood indices.
pub trait NeighborhoodIndex: Sync {
    /// Grid cell containing `position` after wraparound.
    fn cell_of(&self, position: [f32; 2]) -> GridCell;

    /// Visit every entity indexed in `cell`, scanning all layers.
    fn for_each_in_cell(&self, cell: GridCell, visitor: &mut dyn FnMut(usize));

    /// Visit every entity in the `(2 * radius + 1)^2` block of cells around `position`.
    fn for_each_near(&self, position: [f32; 2], radius: u32, visitor: &mut dyn FnMut(usize));
}

/// Layered toroidal grid mapping discretised positions to entity indices.
#[derive(Debug)]
pub struct SpatialMap {
    width: u32,
    height: u32,
    layers: u32,
    slots: Vec<AtomicU32>,
    dropped: AtomicUsize,
}

impl SpatialMap {
    /// Create an empty map covering a `width x height` world with `layers` slots per cell.
    pub fn new(width: u32, height: u32, layers: u32) -> Result<Self, IndexError> {
        if width == 0 || height == 0 {
            return Err(IndexError::InvalidConfig("map dimensions must be non-zero"));
        }
        if layers == 0 {
            return Err(IndexError::InvalidConfig("map needs at least one layer"));
        }
        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|cells| cells.checked_mul(layers as usize))
            .ok_or(IndexError::InvalidConfig("map dimensions overflow"))?;
        Ok(Self {
            width,
            height,
            layers,
            slots: (0..len).map(|_| AtomicU32::new(EMPTY)).collect(),
            dropped: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn layers(&self) -> u32 {
        self.layers
    }

    /// Number of inserts since the last clear that found every layer occupied.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Empty every layer of every cell.
    pub fn clear(&mut self) {
        self.slots
            .par_iter_mut()
            .for_each(|slot| *slot.get_mut() = EMPTY);
        *self.dropped.get_mut() = 0;
    }

    /// Insert a single entity reference. Returns `false` when all layers are taken.
    pub fn insert(&self, position: [f32; 2], entity: usize) -> bool {
        let Some(value) = entity
            .checked_add(1)
            .and_then(|raw| u32::try_from(raw).ok())
        else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        for slot in self.layer_slots(self.cell_of(position)) {
            if slot
                .compare_exchange(EMPTY, value, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Bulk insert with one lane per entity; the entity's slice index is stored.
    pub fn set<T: Locatable + Sync>(&self, entities: &[T]) {
        entities
            .par_iter()
            .enumerate()
            .for_each(|(index, entity)| {
                if entity.is_indexed() {
                    self.insert(entity.location(), index);
                }
            });
    }

    /// Clear the map and repopulate it from `entities`.
    pub fn rebuild<T: Locatable + Sync>(&mut self, entities: &[T]) {
        self.clear();
        self.set(entities);
    }

    /// First entity found at the grid cell containing `position`.
    #[must_use]
    pub fn get(&self, position: [f32; 2]) -> Option<usize> {
        self.layer_slots(self.cell_of(position))
            .iter()
            .find_map(Self::occupant)
    }

    /// Entity at the grid cell of `position` closest to `position`.
    #[must_use]
    pub fn nearest<T: Locatable>(&self, position: [f32; 2], entities: &[T]) -> Option<usize> {
        self.layer_slots(self.cell_of(position))
            .iter()
            .filter_map(Self::occupant)
            .filter_map(|index| {
                let entity = entities.get(index)?;
                Some((index, self.distance_squared(position, entity.location())))
            })
            .min_by_key(|(_, dist_sq)| OrderedFloat(*dist_sq))
            .map(|(index, _)| index)
    }

    /// Visit indexed entities within `radius` (world units, toroidal metric) of `position`.
    pub fn neighbors_within<T: Locatable>(
        &self,
        position: [f32; 2],
        radius: f32,
        entities: &[T],
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if radius.is_nan() || radius < 0.0 {
            return;
        }
        let radius_sq = radius * radius;
        let cells = radius.ceil() as u32;
        self.for_each_near(position, cells, &mut |index| {
            if let Some(entity) = entities.get(index) {
                let dist_sq = self.distance_squared(position, entity.location());
                if dist_sq <= radius_sq {
                    visitor(index, OrderedFloat(dist_sq));
                }
            }
        });
    }

    /// Squared toroidal distance between two positions in this map's world.
    #[must_use]
    pub fn distance_squared(&self, a: [f32; 2], b: [f32; 2]) -> f32 {
        let dx = wrapped_delta(a[0], b[0], self.width as f32);
        let dy = wrapped_delta(a[1], b[1], self.height as f32);
        dx * dx + dy * dy
    }

    fn layer_slots(&self, cell: GridCell) -> &[AtomicU32] {
        let layers = self.layers as usize;
        let base = ((cell.y as usize) * (self.width as usize) + cell.x as usize) * layers;
        &self.slots[base..base + layers]
    }

    fn occupant(slot: &AtomicU32) -> Option<usize> {
        match slot.load(Ordering::Acquire) {
            EMPTY => None,
            value => Some((value - 1) as usize),
        }
    }
}

impl NeighborhoodIndex for SpatialMap {
    fn cell_of(&self, position: [f32; 2]) -> GridCell {
        let x = wrap(position[0], self.width as f32) as u32;
        let y = wrap(position[1], self.height as f32) as u32;
        GridCell {
            x: x.min(self.width - 1),
            y: y.min(self.height - 1),
        }
    }

    fn for_each_in_cell(&self, cell: GridCell, visitor: &mut dyn FnMut(usize)) {
        for slot in self.layer_slots(cell) {
            if let Some(index) = Self::occupant(slot) {
                visitor(index);
            }
        }
    }

    fn for_each_near(&self, position: [f32; 2], radius: u32, visitor: &mut dyn FnMut(usize)) {
        let center = self.cell_of(position);
        // Clamp so a neighbourhood never laps the torus and visits a cell twice.
        let reach_x = i64::from(radius.min((self.width - 1) / 2));
        let reach_y = i64::from(radius.min((self.height - 1) / 2));
        let width = i64::from(self.width);
        let height = i64::from(self.height);
        for dy in -reach_y..=reach_y {
            for dx in -reach_x..=reach_x {
                let cell = GridCell {
                    x: (i64::from(center.x) + dx).rem_euclid(width) as u32,
                    y: (i64::from(center.y) + dy).rem_euclid(height) as u32,
                };
                self.for_each_in_cell(cell, visitor);
            }
        }
    }
}
