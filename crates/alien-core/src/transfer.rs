//! Flat, by-value records exchanged with collaborators.
//!
//! Collaborators never hold references into device storage. Cells refer to
//! each other through offsets into [`DataTransfer::cells`]; names live in one
//! shared byte buffer addressed by offset and length.

use crate::entities::{
    Cell, Connection, EntityId, Float2, MAX_CONNECTIONS, Particle, SelectionState, TOKEN_MEMORY,
    Token,
};
use crate::error::EngineError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Axis-aligned region in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min: Float2,
    pub max: Float2,
}

impl Rect {
    /// Build from any two opposite corners.
    #[must_use]
    pub fn new(a: Float2, b: Float2) -> Self {
        Self {
            min: Float2::new(a.x.min(b.x), a.y.min(b.y)),
            max: Float2::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    #[must_use]
    pub fn contains(&self, pos: Float2) -> bool {
        pos.x >= self.min.x && pos.x <= self.max.x && pos.y >= self.min.y && pos.y <= self.max.y
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticleRecord {
    /// `0` asks the engine to assign an id.
    pub id: EntityId,
    pub pos: Float2,
    pub vel: Float2,
    pub energy: f32,
    pub color: u8,
    pub selected: bool,
}

/// Connection expressed as an offset into the transfer's cell array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub cell: u32,
    pub distance: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    /// `0` asks the engine to assign an id.
    pub id: EntityId,
    pub pos: Float2,
    pub vel: Float2,
    pub energy: f32,
    pub max_connections: u8,
    pub num_connections: u8,
    pub connections: [ConnectionRecord; MAX_CONNECTIONS],
    pub color: u8,
    pub barrier: bool,
    pub sticky: bool,
    pub selected: SelectionState,
    pub angular_velocity: f32,
    pub name_offset: u32,
    pub name_len: u32,
}

impl CellRecord {
    #[must_use]
    pub fn connections(&self) -> &[ConnectionRecord] {
        let count = usize::from(self.num_connections).min(MAX_CONNECTIONS);
        &self.connections[..count]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: EntityId,
    /// Offset of the host cell in the transfer's cell array.
    pub cell: u32,
    pub energy: f32,
    pub memory: [u8; TOKEN_MEMORY],
}

/// Entity counts carried by a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCounts {
    pub cells: usize,
    pub particles: usize,
    pub tokens: usize,
    pub string_bytes: usize,
}

/// Bulk import/export structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTransfer {
    pub cells: Vec<CellRecord>,
    pub particles: Vec<ParticleRecord>,
    pub tokens: Vec<TokenRecord>,
    pub string_bytes: Vec<u8>,
}

impl DataTransfer {
    #[must_use]
    pub fn counts(&self) -> TransferCounts {
        TransferCounts {
            cells: self.cells.len(),
            particles: self.particles.len(),
            tokens: self.tokens.len(),
            string_bytes: self.string_bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.particles.is_empty() && self.tokens.is_empty()
    }

    /// Append a particle and return its offset.
    pub fn add_particle(&mut self, pos: Float2, vel: Float2, energy: f32) -> usize {
        self.particles.push(ParticleRecord {
            pos,
            vel,
            energy,
            ..ParticleRecord::default()
        });
        self.particles.len() - 1
    }

    /// Append an unconnected cell with all connection slots available.
    pub fn add_cell(&mut self, pos: Float2, vel: Float2, energy: f32) -> usize {
        self.cells.push(CellRecord {
            pos,
            vel,
            energy,
            max_connections: MAX_CONNECTIONS as u8,
            ..CellRecord::default()
        });
        self.cells.len() - 1
    }

    /// Connect two cells symmetrically, using their current distance as rest length.
    pub fn connect(&mut self, a: usize, b: usize) -> bool {
        if a == b || a >= self.cells.len() || b >= self.cells.len() {
            return false;
        }
        let has_room = |record: &CellRecord| {
            record.num_connections < record.max_connections.min(MAX_CONNECTIONS as u8)
        };
        if !has_room(&self.cells[a])
            || !has_room(&self.cells[b])
            || self.cells[a].connections().iter().any(|c| c.cell as usize == b)
        {
            return false;
        }
        let distance = (self.cells[a].pos - self.cells[b].pos).length();
        for (from, to) in [(a, b), (b, a)] {
            let record = &mut self.cells[from];
            record.connections[usize::from(record.num_connections)] = ConnectionRecord {
                cell: to as u32,
                distance,
            };
            record.num_connections += 1;
        }
        true
    }

    /// Store `name` in the string buffer and point the cell at it.
    pub fn set_cell_name(&mut self, cell: usize, name: &str) -> bool {
        let Some(record) = self.cells.get_mut(cell) else {
            return false;
        };
        record.name_offset = self.string_bytes.len() as u32;
        record.name_len = name.len() as u32;
        self.string_bytes.extend_from_slice(name.as_bytes());
        true
    }

    #[must_use]
    pub fn cell_name(&self, record: &CellRecord) -> Option<&str> {
        if record.name_len == 0 {
            return None;
        }
        let start = record.name_offset as usize;
        let bytes = self
            .string_bytes
            .get(start..start.checked_add(record.name_len as usize)?)?;
        std::str::from_utf8(bytes).ok()
    }

    /// Attach a token to the cell at offset `cell`.
    pub fn add_token(&mut self, cell: usize, energy: f32) -> usize {
        self.tokens.push(TokenRecord {
            cell: cell as u32,
            energy,
            ..TokenRecord::default()
        });
        self.tokens.len() - 1
    }

    /// Check offsets, connection symmetry, string spans and id uniqueness.
    pub fn validate(&self) -> Result<(), EngineError> {
        let cells = self.cells.len();
        for (offset, record) in self.cells.iter().enumerate() {
            if usize::from(record.num_connections) > usize::from(record.max_connections)
                || usize::from(record.max_connections) > MAX_CONNECTIONS
            {
                return Err(EngineError::InvalidData(format!(
                    "cell {offset} exceeds its connection limit"
                )));
            }
            for connection in record.connections() {
                let other = connection.cell as usize;
                if other >= cells || other == offset {
                    return Err(EngineError::InvalidData(format!(
                        "cell {offset} connects to invalid offset {other}"
                    )));
                }
                let symmetric = self.cells[other]
                    .connections()
                    .iter()
                    .any(|back| back.cell as usize == offset);
                if !symmetric {
                    return Err(EngineError::InvalidData(format!(
                        "connection {offset} -> {other} is not mirrored"
                    )));
                }
            }
            if record.name_len > 0 && self.cell_name(record).is_none() {
                return Err(EngineError::InvalidData(format!(
                    "cell {offset} has an invalid name span"
                )));
            }
        }
        if let Some(token) = self.tokens.iter().find(|t| t.cell as usize >= cells) {
            return Err(EngineError::InvalidData(format!(
                "token {} references missing cell offset {}",
                token.id, token.cell
            )));
        }
        let mut seen = HashSet::new();
        let ids = self
            .cells
            .iter()
            .map(|c| c.id)
            .chain(self.particles.iter().map(|p| p.id))
            .chain(self.tokens.iter().map(|t| t.id));
        for id in ids.filter(|&id| id != 0) {
            if !seen.insert(id) {
                return Err(EngineError::InvalidData(format!("entity id {id} appears twice")));
            }
        }
        Ok(())
    }
}

/// Lightweight element for rendering overlays.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayElement {
    pub id: EntityId,
    pub pos: Float2,
    pub kind: OverlayKind,
    pub color: u8,
    pub selected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayKind {
    Cell,
    Particle,
}

/// Edits addressed to existing entities by id. Unset fields stay unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataChange {
    pub cells: Vec<CellChange>,
    pub particles: Vec<ParticleChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellChange {
    pub id: EntityId,
    pub pos: Option<Float2>,
    pub vel: Option<Float2>,
    pub energy: Option<f32>,
    pub color: Option<u8>,
    pub barrier: Option<bool>,
    pub sticky: Option<bool>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticleChange {
    pub id: EntityId,
    pub pos: Option<Float2>,
    pub vel: Option<Float2>,
    pub energy: Option<f32>,
    pub color: Option<u8>,
}

/// Summary of the current selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionShallowData {
    /// Cells picked directly.
    pub num_cells: u64,
    /// Cells picked through their cluster.
    pub num_cluster_cells: u64,
    pub num_particles: u64,
    pub center_position: Float2,
    pub center_velocity: Float2,
}

/// Shift applied to every selected entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ShallowUpdate {
    pub position_delta: Float2,
    pub velocity_delta: Float2,
    /// Rotation about the selection centre, radians.
    pub angle_delta: f32,
    pub include_clusters: bool,
}

/// Capacity-bounded index buffer filled by an extraction pass.
#[derive(Debug)]
pub(crate) struct ExtractionBuffer {
    slots: Vec<AtomicU32>,
    requested: AtomicUsize,
}

impl ExtractionBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            requested: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&self, index: u32) {
        let slot = self.requested.fetch_add(1, Ordering::AcqRel);
        if let Some(target) = self.slots.get(slot) {
            target.store(index, Ordering::Release);
        }
    }

    /// Run one extraction pass. `Err(needed)` reports the entries that did not fit.
    pub(crate) fn extract<T: Sync>(
        &self,
        items: &[T],
        min_len: usize,
        select: impl Fn(&T) -> bool + Sync,
    ) -> Result<Vec<u32>, usize> {
        self.requested.store(0, Ordering::Release);
        items
            .par_iter()
            .enumerate()
            .with_min_len(min_len)
            .for_each(|(index, item)| {
                if select(item) {
                    self.push(index as u32);
                }
            });
        let requested = self.requested.load(Ordering::Acquire);
        if requested > self.slots.len() {
            return Err(requested);
        }
        let mut indices: Vec<u32> = self.slots[..requested]
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }
}

/// Assemble records for the given cell and particle indices. Connections to
/// cells outside the export are dropped; tokens follow their exported hosts.
pub(crate) fn build_transfer(
    cells: &[Cell],
    cell_indices: &[u32],
    particles: &[Particle],
    particle_indices: &[u32],
    tokens: &[Token],
) -> DataTransfer {
    let mut offsets = vec![u32::MAX; cells.len()];
    for (offset, &index) in cell_indices.iter().enumerate() {
        offsets[index as usize] = offset as u32;
    }
    let exported = |index: u32| match offsets.get(index as usize) {
        Some(&u32::MAX) | None => None,
        Some(&offset) => Some(offset),
    };

    let mut transfer = DataTransfer {
        particles: particle_indices
            .par_iter()
            .map(|&index| particle_record(&particles[index as usize]))
            .collect(),
        ..DataTransfer::default()
    };

    transfer.cells.reserve(cell_indices.len());
    for &index in cell_indices {
        let cell = &cells[index as usize];
        let mut record = cell_record(cell, &exported);
        if let Some(name) = &cell.name {
            record.name_offset = transfer.string_bytes.len() as u32;
            record.name_len = name.len() as u32;
            transfer.string_bytes.extend_from_slice(name.as_bytes());
        }
        transfer.cells.push(record);
    }

    transfer.tokens = tokens
        .iter()
        .filter(|token| token.alive)
        .filter_map(|token| {
            Some(TokenRecord {
                id: token.id,
                cell: exported(token.cell)?,
                energy: token.energy,
                memory: token.memory,
            })
        })
        .collect();
    transfer
}

pub(crate) fn particle_record(particle: &Particle) -> ParticleRecord {
    ParticleRecord {
        id: particle.id,
        pos: particle.pos,
        vel: particle.vel.load(),
        energy: particle.energy.load(),
        color: particle.color,
        selected: particle.selected,
    }
}

fn cell_record(cell: &Cell, exported: &impl Fn(u32) -> Option<u32>) -> CellRecord {
    let mut record = CellRecord {
        id: cell.id,
        pos: cell.pos,
        vel: cell.vel,
        energy: cell.energy.load(),
        max_connections: cell.max_connections,
        color: cell.color,
        barrier: cell.barrier,
        sticky: cell.sticky,
        selected: cell.selected,
        angular_velocity: cell.angular_velocity,
        ..CellRecord::default()
    };
    for connection in cell.connections() {
        if let Some(offset) = exported(connection.index) {
            record.connections[usize::from(record.num_connections)] = ConnectionRecord {
                cell: offset,
                distance: connection.distance,
            };
            record.num_connections += 1;
        }
    }
    record
}

/// Device cell for a record whose connections point at `base + offset`.
pub(crate) fn cell_from_record(
    record: &CellRecord,
    id: EntityId,
    base: u32,
    name: Option<Arc<str>>,
) -> Cell {
    let mut cell = Cell::new(id, record.pos, record.vel, record.energy, record.max_connections);
    for connection in record.connections() {
        cell.connections[usize::from(cell.num_connections)] = Connection {
            index: base + connection.cell,
            distance: connection.distance,
        };
        cell.num_connections += 1;
    }
    cell.color = record.color;
    cell.barrier = record.barrier;
    cell.sticky = record.sticky;
    cell.selected = record.selected;
    cell.angular_velocity = record.angular_velocity;
    cell.name = name;
    cell
}

pub(crate) fn particle_from_record(record: &ParticleRecord, id: EntityId) -> Particle {
    let mut particle = Particle::new(id, record.pos, record.vel, record.energy);
    particle.color = record.color;
    particle.selected = record.selected;
    particle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_connections_symmetric() {
        let mut transfer = DataTransfer::default();
        let a = transfer.add_cell(Float2::new(1.0, 1.0), Float2::ZERO, 100.0);
        let b = transfer.add_cell(Float2::new(2.0, 1.0), Float2::ZERO, 100.0);
        assert!(transfer.connect(a, b));
        assert!(!transfer.connect(a, b), "duplicate edge");
        assert!(transfer.set_cell_name(b, "hub"));
        transfer.add_token(b, 3.0);
        transfer.validate().expect("valid transfer");
        assert_eq!(transfer.cell_name(&transfer.cells[b]), Some("hub"));
        assert_eq!(
            transfer.counts(),
            TransferCounts {
                cells: 2,
                particles: 0,
                tokens: 1,
                string_bytes: 3,
            }
        );
    }

    #[test]
    fn validation_rejects_one_sided_and_dangling_references() {
        let mut transfer = DataTransfer::default();
        transfer.add_cell(Float2::ZERO, Float2::ZERO, 1.0);
        transfer.add_cell(Float2::ZERO, Float2::ZERO, 1.0);
        transfer.cells[0].connections[0] = ConnectionRecord {
            cell: 1,
            distance: 1.0,
        };
        transfer.cells[0].num_connections = 1;
        assert!(matches!(transfer.validate(), Err(EngineError::InvalidData(_))));

        let mut dangling = DataTransfer::default();
        dangling.add_token(4, 1.0);
        assert!(dangling.validate().is_err());
    }

    #[test]
    fn validation_rejects_repeated_ids_but_not_fresh_ones() {
        let mut transfer = DataTransfer::default();
        let a = transfer.add_particle(Float2::ZERO, Float2::ZERO, 1.0);
        let b = transfer.add_particle(Float2::new(1.0, 0.0), Float2::ZERO, 1.0);
        transfer.validate().expect("unassigned ids never clash");

        transfer.particles[a].id = 9;
        transfer.particles[b].id = 9;
        assert!(matches!(transfer.validate(), Err(EngineError::InvalidData(_))));

        transfer.particles[b].id = 10;
        let cell = transfer.add_cell(Float2::ZERO, Float2::ZERO, 1.0);
        transfer.cells[cell].id = 9;
        assert!(transfer.validate().is_err(), "cells and particles share one id space");
    }

    #[test]
    fn extraction_reports_overflow_then_fits_after_growth() {
        let items: Vec<u32> = (0..100).collect();
        let small = ExtractionBuffer::with_capacity(10);
        assert_eq!(small.extract(&items, 8, |v| v % 4 == 0), Err(25));
        let large = ExtractionBuffer::with_capacity(25);
        let indices = large.extract(&items, 8, |v| v % 4 == 0).expect("fits");
        assert_eq!(indices.len(), 25);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(indices[3], 12);
    }

    #[test]
    fn export_drops_edges_leaving_the_region() {
        let mut cells = vec![
            Cell::new(1, Float2::new(1.0, 1.0), Float2::ZERO, 10.0, 6),
            Cell::new(2, Float2::new(2.0, 1.0), Float2::ZERO, 10.0, 6),
            Cell::new(3, Float2::new(9.0, 9.0), Float2::ZERO, 10.0, 6),
        ];
        crate::pipeline::clusters::connect_cells(&mut cells, 0, 1, 1.0);
        crate::pipeline::clusters::connect_cells(&mut cells, 1, 2, 1.0);
        cells[1].name = Some(Arc::from("mid"));
        let tokens = vec![
            Token {
                id: 5,
                cell: 1,
                alive: true,
                ..Token::default()
            },
            Token {
                id: 6,
                cell: 2,
                alive: true,
                ..Token::default()
            },
        ];
        let transfer = build_transfer(&cells, &[0, 1], &[], &[], &tokens);
        transfer.validate().expect("export is self-consistent");
        assert_eq!(transfer.cells.len(), 2);
        assert_eq!(transfer.cells[1].num_connections, 1);
        assert_eq!(transfer.cell_name(&transfer.cells[1]), Some("mid"));
        assert_eq!(transfer.tokens.len(), 1);
        assert_eq!(transfer.tokens[0].cell, 1);
    }
}
