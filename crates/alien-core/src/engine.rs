//! Host-side facade owning every device-resident structure.

use crate::config::{
    ExecutionSettings, FlowFieldSettings, ParameterSpot, Settings, SimulationParameters,
    validate_execution, validate_flow_field, validate_parameters, validate_spots,
};
use crate::device::Device;
use crate::entities::{Cell, EntityId, Float2, MAX_CONNECTIONS, Particle, SelectionState, Token};
use crate::error::EngineError;
use crate::hashmap::{ConcurrentHashMap, MapError};
use crate::monitor::{self, MonitorData};
use crate::pipeline::clusters::{connect_cells, disconnect_cells};
use crate::pipeline::{self, ClusterIndex, DeviceState, PassContext, StepEvents};
use crate::transfer::{
    CellRecord, DataChange, DataTransfer, ExtractionBuffer, OverlayElement, OverlayKind,
    ParticleRecord, Rect, SelectionShallowData, ShallowUpdate, build_transfer, cell_from_record,
    particle_from_record, particle_record,
};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Live entity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Population {
    pub cells: usize,
    pub particles: usize,
    pub tokens: usize,
}

/// Current backing sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacities {
    pub particles: usize,
    pub cells: usize,
    pub tokens: usize,
    pub transfer: usize,
}

/// The simulation engine facade.
///
/// Every public operation is synchronous: it submits one or more passes to the
/// device and returns once they have completed.
#[derive(Debug)]
pub struct SimulationEngine {
    settings: Settings,
    device: Device,
    state: DeviceState,
    extraction: ExtractionBuffer,
    timestep: u64,
    halted: bool,
    capacity_growths: u64,
}

impl SimulationEngine {
    /// Validate `settings`, bring up the device and allocate the arenas.
    pub fn new(timestep: u64, settings: Settings) -> Result<Self, EngineError> {
        settings.validate()?;
        let device = Device::new(&settings.execution)?;
        let state = DeviceState::new(&settings)?;
        let extraction = ExtractionBuffer::with_capacity(settings.capacity.transfer);
        info!(
            timestep,
            width = settings.world_size.width,
            height = settings.world_size.height,
            particles = settings.capacity.particles,
            cells = settings.capacity.cells,
            "simulation engine ready"
        );
        Ok(Self {
            settings,
            device,
            state,
            extraction,
            timestep,
            halted: false,
            capacity_growths: 0,
        })
    }

    // ----- lifecycle ---------------------------------------------------------

    /// Advance exactly one timestep.
    pub fn calc_timestep(&mut self) -> Result<StepEvents, EngineError> {
        if self.halted {
            return Err(EngineError::Halted);
        }
        let next = self.timestep + 1;
        let ctx = PassContext::new(&self.settings, next);
        match pipeline::run_timestep(&self.device, &mut self.state, &ctx) {
            Ok(events) => {
                self.timestep = next;
                let interval = self.settings.execution.overflow_check_interval;
                if interval > 0 && next % interval == 0 {
                    self.grow_overflowed_arenas();
                }
                Ok(events)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.halted = true;
                    error!(timestep = self.timestep, error = %err, "timestep aborted; engine halted");
                }
                Err(err)
            }
        }
    }

    /// Advance `steps` timesteps.
    pub fn calc_timesteps(&mut self, steps: u64) -> Result<(), EngineError> {
        for _ in 0..steps {
            self.calc_timestep()?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn current_timestep(&self) -> u64 {
        self.timestep
    }

    /// Restore the step counter, e.g. after loading a snapshot.
    pub fn set_current_timestep(&mut self, timestep: u64) {
        self.timestep = timestep;
    }

    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted
    }

    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn set_simulation_parameters(
        &mut self,
        parameters: SimulationParameters,
    ) -> Result<(), EngineError> {
        validate_parameters(&parameters)?;
        if parameters.map_layers != self.settings.parameters.map_layers {
            self.state
                .reshape_maps(self.settings.world_size, parameters.map_layers)?;
        }
        self.settings.parameters = parameters;
        Ok(())
    }

    pub fn set_parameter_spots(&mut self, spots: Vec<ParameterSpot>) -> Result<(), EngineError> {
        validate_spots(&spots)?;
        self.settings.spots = spots;
        Ok(())
    }

    pub fn set_flow_field(&mut self, flow_field: FlowFieldSettings) -> Result<(), EngineError> {
        validate_flow_field(&flow_field)?;
        self.settings.flow_field = flow_field;
        Ok(())
    }

    /// Swap the device for one built from `execution`. Entity state is kept;
    /// on failure the running device stays in place.
    pub fn set_execution_settings(&mut self, execution: ExecutionSettings) -> Result<(), EngineError> {
        validate_execution(&execution)?;
        let device = Device::new(&execution)?;
        debug!(
            from = ?self.device.kind(),
            to = ?device.kind(),
            lanes = device.lanes(),
            "device replaced"
        );
        self.device = device;
        self.settings.execution = execution;
        Ok(())
    }

    #[must_use]
    pub fn capacities(&self) -> Capacities {
        Capacities {
            particles: self.state.particles.capacity(),
            cells: self.state.cells.capacity(),
            tokens: self.state.tokens.capacity(),
            transfer: self.extraction.capacity(),
        }
    }

    /// Number of automatic capacity increases so far.
    #[must_use]
    pub const fn capacity_growths(&self) -> u64 {
        self.capacity_growths
    }

    #[must_use]
    pub fn population(&self) -> Population {
        Population {
            cells: self.state.cells.current().count(),
            particles: self.state.particles.current().count(),
            tokens: self.state.tokens.current().count(),
        }
    }

    fn grow_overflowed_arenas(&mut self) {
        let factor = self.settings.execution.capacity_growth_factor;
        let timestep = self.timestep;
        let mut grown = 0;
        if self.state.particles.take_overflow() {
            let from = self.state.particles.capacity();
            let to = grown_capacity(from, factor, 0);
            self.state.particles.grow(to);
            info!(timestep, kind = "particles", from, to, "arena capacity increased");
            grown += 1;
        }
        if self.state.cells.take_overflow() {
            let from = self.state.cells.capacity();
            let to = grown_capacity(from, factor, 0);
            self.state.cells.grow(to);
            info!(timestep, kind = "cells", from, to, "arena capacity increased");
            grown += 1;
        }
        if self.state.tokens.take_overflow() {
            let from = self.state.tokens.capacity();
            let to = grown_capacity(from, factor, 0);
            self.state.tokens.grow(to);
            info!(timestep, kind = "tokens", from, to, "arena capacity increased");
            grown += 1;
        }
        self.capacity_growths += grown;
    }

    /// Grow arenas so the given totals fit, in a single resize per arena.
    fn reserve(&mut self, cells: usize, particles: usize, tokens: usize) {
        let factor = self.settings.execution.capacity_growth_factor;
        let mut grown = 0;
        if cells > self.state.cells.capacity() {
            self.state
                .cells
                .grow(grown_capacity(self.state.cells.capacity(), factor, cells));
            grown += 1;
        }
        if particles > self.state.particles.capacity() {
            self.state.particles.grow(grown_capacity(
                self.state.particles.capacity(),
                factor,
                particles,
            ));
            grown += 1;
        }
        if tokens > self.state.tokens.capacity() {
            self.state
                .tokens
                .grow(grown_capacity(self.state.tokens.capacity(), factor, tokens));
            grown += 1;
        }
        if grown > 0 {
            info!(cells, particles, tokens, "arena capacity increased for import");
            self.capacity_growths += grown;
        }
    }

    // ----- import ------------------------------------------------------------

    /// Replace the whole world with `data`. Non-zero record ids are kept.
    pub fn set_data(&mut self, data: &DataTransfer) -> Result<Population, EngineError> {
        data.validate()?;
        self.state.clear();
        self.import(data, true, false)?;
        info!(counts = ?data.counts(), "world replaced");
        Ok(self.population())
    }

    /// Append `data` with fresh ids, optionally making it the new selection.
    pub fn add_data(&mut self, data: &DataTransfer, select: bool) -> Result<Population, EngineError> {
        data.validate()?;
        if select {
            self.clear_selection()?;
        }
        self.import(data, false, select)?;
        debug!(counts = ?data.counts(), select, "data appended");
        Ok(self.population())
    }

    fn import(&mut self, data: &DataTransfer, keep_ids: bool, select: bool) -> Result<(), EngineError> {
        let base_cell = self.state.cells.current().count();
        self.reserve(
            base_cell + data.cells.len(),
            self.state.particles.current().count() + data.particles.len(),
            self.state.tokens.current().count() + data.tokens.len(),
        );
        let base = u32::try_from(base_cell)
            .map_err(|_| EngineError::InvalidData("cell arena exceeds u32 indices".to_string()))?;

        for record in &data.cells {
            let id = self.resolve_id(record.id, keep_ids);
            let name = data.cell_name(record).map(Arc::<str>::from);
            let mut cell = cell_from_record(record, id, base, name);
            if select {
                cell.selected = SelectionState::Selected;
            }
            self.state
                .cells
                .current_mut()
                .push(cell)
                .ok_or_else(|| import_overflow("cells"))?;
        }
        for record in &data.particles {
            let id = self.resolve_id(record.id, keep_ids);
            let mut particle = particle_from_record(record, id);
            particle.selected |= select;
            self.state
                .particles
                .current_mut()
                .push(particle)
                .ok_or_else(|| import_overflow("particles"))?;
        }
        for record in &data.tokens {
            let token = Token {
                id: self.resolve_id(record.id, keep_ids),
                cell: base + record.cell,
                energy: record.energy,
                memory: record.memory,
                alive: true,
            };
            self.state
                .tokens
                .current_mut()
                .push(token)
                .ok_or_else(|| import_overflow("tokens"))?;
        }
        self.state.invalidate_maps();
        Ok(())
    }

    fn resolve_id(&mut self, id: EntityId, keep: bool) -> EntityId {
        if keep && id != 0 {
            self.state.reserve_id(id);
            id
        } else {
            self.state.allocate_id()
        }
    }

    /// Apply field edits to entities addressed by id. Unknown ids are skipped.
    pub fn change_data(&mut self, change: &DataChange) -> Result<(), EngineError> {
        let cell_ids = self.id_table(self.state.cells.current().as_slice(), |c: &Cell| {
            c.is_alive().then_some(c.id)
        })?;
        let particle_ids = self.id_table(self.state.particles.current().as_slice(), |p: &Particle| {
            p.is_alive().then_some(p.id)
        })?;

        let world = self.settings.world_size;
        let cells = self.state.cells.current_mut().as_mut_slice();
        for edit in &change.cells {
            let Some(index) = lookup(&cell_ids, edit.id)? else {
                warn!(id = edit.id, "change_data: unknown cell id");
                continue;
            };
            let cell = &mut cells[index];
            if let Some(pos) = edit.pos {
                cell.pos = world.wrap(pos);
            }
            if let Some(vel) = edit.vel {
                cell.vel = vel;
            }
            if let Some(energy) = edit.energy {
                cell.energy.set(energy);
            }
            if let Some(color) = edit.color {
                cell.color = color;
            }
            if let Some(barrier) = edit.barrier {
                cell.barrier = barrier;
            }
            if let Some(sticky) = edit.sticky {
                cell.sticky = sticky;
            }
            if let Some(name) = &edit.name {
                cell.name = (!name.is_empty()).then(|| Arc::from(name.as_str()));
            }
        }

        let particles = self.state.particles.current_mut().as_mut_slice();
        for edit in &change.particles {
            let Some(index) = lookup(&particle_ids, edit.id)? else {
                warn!(id = edit.id, "change_data: unknown particle id");
                continue;
            };
            let particle = &mut particles[index];
            if let Some(pos) = edit.pos {
                particle.pos = world.wrap(pos);
            }
            if let Some(vel) = edit.vel {
                particle.vel.set(vel);
            }
            if let Some(energy) = edit.energy {
                particle.energy.set(energy);
            }
            if let Some(color) = edit.color {
                particle.color = color;
            }
        }
        self.state.invalidate_maps();
        Ok(())
    }

    /// Concurrent `id -> index` table over `items`, built in one pass.
    fn id_table<T: Sync>(
        &self,
        items: &[T],
        id_of: impl Fn(&T) -> Option<EntityId> + Sync,
    ) -> Result<ConcurrentHashMap<EntityId, u32>, EngineError> {
        let table = ConcurrentHashMap::with_capacity(
            items.len() * 2 + 1,
            self.settings.execution.lock_policy,
        );
        let min_len = self.device.work_group_size();
        self.device.run("id_table", || {
            items
                .par_iter()
                .enumerate()
                .with_min_len(min_len)
                .try_for_each(|(index, item)| match id_of(item) {
                    Some(id) => table.insert_or_assign(id, index as u32),
                    None => Ok(()),
                })
        })??;
        Ok(table)
    }

    // ----- export ------------------------------------------------------------

    /// Entities whose position lies inside `rect`.
    pub fn get_data(&mut self, rect: Rect) -> Result<DataTransfer, EngineError> {
        self.export(
            |cell| rect.contains(cell.pos),
            |particle| rect.contains(particle.pos),
        )
    }

    /// Selected entities; with `include_clusters` also cells selected through their cluster.
    pub fn get_selected_data(&mut self, include_clusters: bool) -> Result<DataTransfer, EngineError> {
        self.export(
            |cell| in_scope(cell.selected, include_clusters),
            |particle| particle.selected,
        )
    }

    /// Entities with the given ids, considering at most `max_ids` of them.
    pub fn get_inspected_data(
        &mut self,
        ids: &[EntityId],
        max_ids: usize,
    ) -> Result<DataTransfer, EngineError> {
        let ids = &ids[..ids.len().min(max_ids)];
        let wanted: ConcurrentHashMap<EntityId, ()> =
            ConcurrentHashMap::with_capacity(ids.len() * 2 + 1, self.settings.execution.lock_policy);
        self.device.run("inspect_ids", || {
            ids.par_iter()
                .try_for_each(|&id| wanted.insert_or_assign(id, ()))
        })??;
        let cells = self.state.cells.current().as_slice();
        let particles = self.state.particles.current().as_slice();
        let present: HashSet<EntityId> = self.device.run("inspect_match", || {
            cells
                .par_iter()
                .filter(|cell| cell.is_alive())
                .map(|cell| cell.id)
                .chain(
                    particles
                        .par_iter()
                        .filter(|particle| particle.is_alive())
                        .map(|particle| particle.id),
                )
                .filter_map(|id| match wanted.contains(id) {
                    Ok(true) => Some(Ok(id)),
                    Ok(false) => None,
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<HashSet<_>, MapError>>()
        })??;
        self.export(
            |cell| present.contains(&cell.id),
            |particle| present.contains(&particle.id),
        )
    }

    /// Minimal per-entity data for drawing the region `rect`.
    pub fn get_overlay_data(&mut self, rect: Rect) -> Result<Vec<OverlayElement>, EngineError> {
        let factor = self.settings.execution.capacity_growth_factor;
        let cells = self.state.cells.current().as_slice();
        let particles = self.state.particles.current().as_slice();
        let cell_indices = extract_with_retry(
            &self.device,
            &mut self.extraction,
            factor,
            cells,
            |cell: &Cell| cell.is_alive() && rect.contains(cell.pos),
        )?;
        let particle_indices = extract_with_retry(
            &self.device,
            &mut self.extraction,
            factor,
            particles,
            |particle: &Particle| particle.is_alive() && rect.contains(particle.pos),
        )?;
        let overlay = cell_indices
            .iter()
            .map(|&index| {
                let cell = &cells[index as usize];
                OverlayElement {
                    id: cell.id,
                    pos: cell.pos,
                    kind: OverlayKind::Cell,
                    color: cell.color,
                    selected: cell.selected.is_selected(),
                }
            })
            .chain(particle_indices.iter().map(|&index| {
                let particle = &particles[index as usize];
                OverlayElement {
                    id: particle.id,
                    pos: particle.pos,
                    kind: OverlayKind::Particle,
                    color: particle.color,
                    selected: particle.selected,
                }
            }))
            .collect();
        Ok(overlay)
    }

    fn export(
        &mut self,
        select_cell: impl Fn(&Cell) -> bool + Sync,
        select_particle: impl Fn(&Particle) -> bool + Sync,
    ) -> Result<DataTransfer, EngineError> {
        let factor = self.settings.execution.capacity_growth_factor;
        let cells = self.state.cells.current().as_slice();
        let particles = self.state.particles.current().as_slice();
        let cell_indices = extract_with_retry(
            &self.device,
            &mut self.extraction,
            factor,
            cells,
            |cell: &Cell| cell.is_alive() && select_cell(cell),
        )?;
        let particle_indices = extract_with_retry(
            &self.device,
            &mut self.extraction,
            factor,
            particles,
            |particle: &Particle| particle.is_alive() && select_particle(particle),
        )?;
        let tokens = self.state.tokens.current().as_slice();
        self.device.run("transfer", || {
            build_transfer(cells, &cell_indices, particles, &particle_indices, tokens)
        })
    }

    // ----- editing -----------------------------------------------------------

    /// Kill every selected entity.
    pub fn remove_selected(&mut self, include_clusters: bool) -> Result<(), EngineError> {
        self.edit_cells("remove_selected", include_clusters, |cell| {
            cell.kill();
        })?;
        self.edit_particles("remove_selected", |particle| {
            particle.kill();
        })?;
        self.resync()
    }

    /// Reset the rest length of every connection of the selection to its current length.
    pub fn relax_selected(&mut self, include_clusters: bool) -> Result<(), EngineError> {
        let world = self.settings.world_size;
        let cells = self.state.cells.current().as_slice();
        let updates: Vec<(usize, usize, f32)> = self.device.run("relax_selected", || {
            cells
                .par_iter()
                .enumerate()
                .filter(|(_, cell)| cell.is_alive() && in_scope(cell.selected, include_clusters))
                .flat_map_iter(|(index, cell)| {
                    cell.connections().iter().map(move |connection| {
                        let other = &cells[connection.index as usize];
                        (index, connection.index as usize, world.delta(cell.pos, other.pos).length())
                    })
                })
                .collect()
        })?;
        let cells = self.state.cells.current_mut().as_mut_slice();
        for (a, b, distance) in updates {
            set_rest_distance(&mut cells[a], b, distance);
            set_rest_distance(&mut cells[b], a, distance);
        }
        self.resync()
    }

    /// Give every selected entity the selection's mean velocity.
    pub fn uniform_velocity_selected(&mut self, include_clusters: bool) -> Result<(), EngineError> {
        let cells = self.state.cells.current().as_slice();
        let particles = self.state.particles.current().as_slice();
        let (sum, count) = self.device.run("uniform_velocity", || {
            let cell_part = cells
                .par_iter()
                .filter(|cell| cell.is_alive() && in_scope(cell.selected, include_clusters))
                .map(|cell| (cell.vel, 1u64))
                .reduce(|| (Float2::ZERO, 0), |a, b| (a.0 + b.0, a.1 + b.1));
            let particle_part = particles
                .par_iter()
                .filter(|particle| particle.is_alive() && particle.selected)
                .map(|particle| (particle.vel.load(), 1u64))
                .reduce(|| (Float2::ZERO, 0), |a, b| (a.0 + b.0, a.1 + b.1));
            (cell_part.0 + particle_part.0, cell_part.1 + particle_part.1)
        })?;
        if count == 0 {
            return Ok(());
        }
        let mean = sum * (1.0 / count as f32);
        self.edit_cells("uniform_velocity", include_clusters, move |cell| {
            cell.vel = mean;
            cell.angular_velocity = 0.0;
        })?;
        self.edit_particles("uniform_velocity", move |particle| particle.vel.set(mean))?;
        self.resync()
    }

    /// Add `force` to the velocity of every selected entity.
    pub fn apply_force_selected(
        &mut self,
        force: Float2,
        include_clusters: bool,
    ) -> Result<(), EngineError> {
        self.edit_cells("apply_force", include_clusters, move |cell| cell.vel += force)?;
        self.edit_particles("apply_force", move |particle| {
            let velocity = particle.vel.load() + force;
            particle.vel.set(velocity);
        })?;
        self.resync()
    }

    pub fn make_sticky(&mut self, include_clusters: bool) -> Result<(), EngineError> {
        self.edit_cells("make_sticky", include_clusters, |cell| cell.sticky = true)?;
        self.resync()
    }

    pub fn remove_sticky(&mut self, include_clusters: bool) -> Result<(), EngineError> {
        self.edit_cells("remove_sticky", include_clusters, |cell| cell.sticky = false)?;
        self.resync()
    }

    pub fn set_barrier(&mut self, barrier: bool, include_clusters: bool) -> Result<(), EngineError> {
        self.edit_cells("set_barrier", include_clusters, move |cell| {
            cell.barrier = barrier;
        })?;
        self.resync()
    }

    pub fn recolor_selected(&mut self, color: u8, include_clusters: bool) -> Result<(), EngineError> {
        self.edit_cells("recolor", include_clusters, move |cell| cell.color = color)?;
        self.edit_particles("recolor", move |particle| particle.color = color)?;
        self.resync()
    }

    /// Drop the selection's connections and reconnect selected cells that lie
    /// within the fusion distance of each other, closest pairs first.
    pub fn reconnect_selected(&mut self, include_clusters: bool) -> Result<(), EngineError> {
        let scope: Vec<bool> = self
            .state
            .cells
            .current()
            .as_slice()
            .iter()
            .map(|cell| cell.is_alive() && in_scope(cell.selected, include_clusters))
            .collect();

        let cells = self.state.cells.current_mut().as_mut_slice();
        for index in (0..cells.len()).filter(|&index| scope[index]) {
            let partners: Vec<u32> = cells[index].connections().iter().map(|c| c.index).collect();
            for partner in partners {
                disconnect_cells(cells, index, partner as usize);
            }
        }

        self.state.ensure_maps();
        let radius = self.settings.parameters.cell_fusion_distance;
        let cells = self.state.cells.current().as_slice();
        let map = &self.state.cell_map;
        let scope = &scope;
        let mut pairs: Vec<(OrderedFloat<f32>, usize, usize)> =
            self.device.run("reconnect_selected", || {
                cells
                    .par_iter()
                    .enumerate()
                    .filter(|(index, _)| scope[*index])
                    .flat_map_iter(|(index, cell)| {
                        let mut found = Vec::new();
                        map.neighbors_within(cell.pos.to_array(), radius, cells, &mut |other, dist_sq| {
                            if other > index && scope.get(other).copied().unwrap_or(false) {
                                found.push((dist_sq, index, other));
                            }
                        });
                        found
                    })
                    .collect()
            })?;
        pairs.sort_unstable();

        let cells = self.state.cells.current_mut().as_mut_slice();
        for (dist_sq, a, b) in pairs {
            connect_cells(cells, a, b, dist_sq.into_inner().sqrt());
        }
        self.resync()
    }

    fn edit_cells(
        &mut self,
        pass: &'static str,
        include_clusters: bool,
        edit: impl Fn(&mut Cell) + Sync + Send,
    ) -> Result<(), EngineError> {
        let min_len = self.device.work_group_size();
        let cells = self.state.cells.current_mut().as_mut_slice();
        self.device.run(pass, || {
            cells
                .par_iter_mut()
                .with_min_len(min_len)
                .filter(|cell| cell.is_alive() && in_scope(cell.selected, include_clusters))
                .for_each(|cell| edit(cell));
        })
    }

    fn edit_particles(
        &mut self,
        pass: &'static str,
        edit: impl Fn(&mut Particle) + Sync + Send,
    ) -> Result<(), EngineError> {
        let min_len = self.device.work_group_size();
        let particles = self.state.particles.current_mut().as_mut_slice();
        self.device.run(pass, || {
            particles
                .par_iter_mut()
                .with_min_len(min_len)
                .filter(|particle| particle.is_alive() && particle.selected)
                .for_each(|particle| edit(particle));
        })
    }

    /// Compact after an editing pass and mark the maps stale.
    fn resync(&mut self) -> Result<(), EngineError> {
        let summary = self
            .device
            .run("compaction", || pipeline::compact(&mut self.state))?;
        debug!(?summary, "resynchronised after edit");
        Ok(())
    }

    // ----- selection ---------------------------------------------------------

    /// Replace the selection with the entity closest to `pos` within `radius`.
    pub fn switch_selection(&mut self, pos: Float2, radius: f32) -> Result<(), EngineError> {
        self.clear_selection()?;
        self.toggle_nearest(pos, radius);
        Ok(())
    }

    /// Toggle the entity closest to `pos` within `radius`, keeping the rest of the selection.
    pub fn swap_selection(&mut self, pos: Float2, radius: f32) -> Result<(), EngineError> {
        self.toggle_nearest(pos, radius);
        Ok(())
    }

    /// Select every entity inside `rect`; clusters of selected cells join as cluster selections.
    pub fn set_selection(&mut self, rect: Rect) -> Result<(), EngineError> {
        self.clear_selection()?;
        let min_len = self.device.work_group_size();
        let cells = self.state.cells.current_mut().as_mut_slice();
        let particles = self.state.particles.current_mut().as_mut_slice();
        self.device.run("set_selection", || {
            cells
                .par_iter_mut()
                .with_min_len(min_len)
                .filter(|cell| cell.is_alive() && rect.contains(cell.pos))
                .for_each(|cell| cell.selected = SelectionState::Selected);
            particles
                .par_iter_mut()
                .with_min_len(min_len)
                .filter(|particle| particle.is_alive() && rect.contains(particle.pos))
                .for_each(|particle| particle.selected = true);
        })?;
        self.mark_cluster_selection();
        Ok(())
    }

    /// Deselect everything.
    pub fn remove_selection(&mut self) -> Result<(), EngineError> {
        self.clear_selection()
    }

    /// Counts plus mean position and velocity of the selection.
    pub fn selection_shallow_data(&self) -> Result<SelectionShallowData, EngineError> {
        let world = self.settings.world_size;
        let cells = self.state.cells.current().as_slice();
        let particles = self.state.particles.current().as_slice();
        self.device.run("selection_shallow_data", || {
            let mut data = SelectionShallowData::default();
            let mut anchor = None;
            let mut offset_sum = Float2::ZERO;
            let mut velocity_sum = Float2::ZERO;
            let mut count = 0u64;
            let mut visit = |pos: Float2, vel: Float2| {
                let origin = *anchor.get_or_insert(pos);
                offset_sum += world.delta(origin, pos);
                velocity_sum += vel;
                count += 1;
            };
            for cell in cells.iter().filter(|cell| cell.is_alive()) {
                match cell.selected {
                    SelectionState::Selected => data.num_cells += 1,
                    SelectionState::ClusterSelected => data.num_cluster_cells += 1,
                    SelectionState::Unselected => continue,
                }
                visit(cell.pos, cell.vel);
            }
            for particle in particles.iter().filter(|p| p.is_alive() && p.selected) {
                data.num_particles += 1;
                visit(particle.pos, particle.vel.load());
            }
            if let Some(origin) = anchor {
                let scale = 1.0 / count as f32;
                data.center_position = world.wrap(origin + offset_sum * scale);
                data.center_velocity = velocity_sum * scale;
            }
            data
        })
    }

    /// Move, rotate and accelerate the selection as one body.
    pub fn shallow_update_selected(&mut self, update: ShallowUpdate) -> Result<(), EngineError> {
        let center = self.selection_shallow_data()?.center_position;
        let world = self.settings.world_size;
        let (sin, cos) = update.angle_delta.sin_cos();
        let transform = move |pos: Float2| {
            let arm = world.delta(center, pos);
            let rotated = Float2::new(arm.x * cos - arm.y * sin, arm.x * sin + arm.y * cos);
            world.wrap(center + rotated + update.position_delta)
        };
        self.edit_cells("shallow_update", update.include_clusters, move |cell| {
            cell.pos = transform(cell.pos);
            cell.vel += update.velocity_delta;
        })?;
        self.edit_particles("shallow_update", move |particle| {
            particle.pos = transform(particle.pos);
            let velocity = particle.vel.load() + update.velocity_delta;
            particle.vel.set(velocity);
        })?;
        self.state.invalidate_maps();
        Ok(())
    }

    fn clear_selection(&mut self) -> Result<(), EngineError> {
        let min_len = self.device.work_group_size();
        let cells = self.state.cells.current_mut().as_mut_slice();
        let particles = self.state.particles.current_mut().as_mut_slice();
        self.device.run("clear_selection", || {
            cells
                .par_iter_mut()
                .with_min_len(min_len)
                .for_each(|cell| cell.selected = SelectionState::Unselected);
            particles
                .par_iter_mut()
                .with_min_len(min_len)
                .for_each(|particle| particle.selected = false);
        })
    }

    fn toggle_nearest(&mut self, pos: Float2, radius: f32) {
        self.state.ensure_maps();
        let cells = self.state.cells.current().as_slice();
        let particles = self.state.particles.current().as_slice();
        let nearest_cell = nearest_live(&self.state.cell_map, pos, radius, cells, Cell::is_alive);
        let nearest_particle = nearest_live(
            &self.state.particle_map,
            pos,
            radius,
            particles,
            Particle::is_alive,
        );

        match (nearest_cell, nearest_particle) {
            (Some((cell_dist, cell)), particle) if particle.is_none_or(|(d, _)| cell_dist <= d) => {
                let cells = self.state.cells.current_mut().as_mut_slice();
                if cells[cell].selected.is_selected() {
                    // Deselecting any member releases the whole cluster.
                    let clusters = ClusterIndex::build(cells);
                    for member in clusters.expand([cell]) {
                        cells[member as usize].selected = SelectionState::Unselected;
                    }
                } else {
                    cells[cell].selected = SelectionState::Selected;
                    self.mark_cluster_selection();
                }
            }
            (_, Some((_, particle))) => {
                let particle = &mut self.state.particles.current_mut().as_mut_slice()[particle];
                particle.selected = !particle.selected;
            }
            _ => {}
        }
    }

    /// Promote the unselected members of every cluster with a directly selected cell.
    fn mark_cluster_selection(&mut self) {
        let cells = self.state.cells.current_mut().as_mut_slice();
        let clusters = ClusterIndex::build(cells);
        let direct: Vec<usize> = cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.selected == SelectionState::Selected)
            .map(|(index, _)| index)
            .collect();
        for index in clusters.expand(direct) {
            let cell = &mut cells[index as usize];
            if cell.selected == SelectionState::Unselected {
                cell.selected = SelectionState::ClusterSelected;
            }
        }
    }

    // ----- queries -----------------------------------------------------------

    /// Reduction over the current generation plus the cumulative counters.
    pub fn monitor_data(&self) -> Result<MonitorData, EngineError> {
        self.device
            .run("monitor", || monitor::collect(&self.state, self.timestep))
    }

    /// Particle nearest to `pos` within its grid cell.
    pub fn particle_at(&mut self, pos: Float2) -> Option<ParticleRecord> {
        self.state.ensure_maps();
        let particles = self.state.particles.current().as_slice();
        let index = self.state.particle_map.nearest(pos.to_array(), particles)?;
        particles
            .get(index)
            .filter(|particle| particle.is_alive())
            .map(particle_record)
    }

    /// Cell nearest to `pos` within its grid cell (connections omitted).
    pub fn cell_at(&mut self, pos: Float2) -> Option<CellRecord> {
        self.state.ensure_maps();
        let cells = self.state.cells.current().as_slice();
        let index = self.state.cell_map.nearest(pos.to_array(), cells)?;
        if !cells.get(index)?.is_alive() {
            return None;
        }
        build_transfer(cells, &[index as u32], &[], &[], &[])
            .cells
            .pop()
    }
}

fn in_scope(selection: SelectionState, include_clusters: bool) -> bool {
    match selection {
        SelectionState::Selected => true,
        SelectionState::ClusterSelected => include_clusters,
        SelectionState::Unselected => false,
    }
}

fn lookup(table: &ConcurrentHashMap<EntityId, u32>, id: EntityId) -> Result<Option<usize>, EngineError> {
    match table.at(id) {
        Ok(index) => Ok(Some(index as usize)),
        Err(MapError::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn set_rest_distance(cell: &mut Cell, partner: usize, distance: f32) {
    let count = usize::from(cell.num_connections).min(MAX_CONNECTIONS);
    if let Some(connection) = cell.connections[..count]
        .iter_mut()
        .find(|connection| connection.index as usize == partner)
    {
        connection.distance = distance;
    }
}

fn nearest_live<T: alien_index::Locatable>(
    map: &alien_index::SpatialMap,
    pos: Float2,
    radius: f32,
    items: &[T],
    alive: fn(&T) -> bool,
) -> Option<(OrderedFloat<f32>, usize)> {
    let mut best: Option<(OrderedFloat<f32>, usize)> = None;
    map.neighbors_within(pos.to_array(), radius, items, &mut |index, dist_sq| {
        if items.get(index).is_some_and(alive) && best.is_none_or(|current| (dist_sq, index) < current) {
            best = Some((dist_sq, index));
        }
    });
    best
}

fn import_overflow(kind: &str) -> EngineError {
    EngineError::InvalidData(format!("{kind} arena full after resize"))
}

/// Next capacity after an overflow: scaled by `factor`, always growing, at least `needed`.
fn grown_capacity(current: usize, factor: f32, needed: usize) -> usize {
    let scaled = (current as f64 * f64::from(factor)).ceil() as usize;
    scaled.max(current + 1).max(needed)
}

/// Run an extraction pass; on overflow grow the buffer and rerun once.
fn extract_with_retry<T: Sync>(
    device: &Device,
    buffer: &mut ExtractionBuffer,
    factor: f32,
    items: &[T],
    select: impl Fn(&T) -> bool + Sync,
) -> Result<Vec<u32>, EngineError> {
    let min_len = device.work_group_size();
    let needed = match device.run("extraction", || buffer.extract(items, min_len, &select))? {
        Ok(indices) => return Ok(indices),
        Err(needed) => needed,
    };
    let from = buffer.capacity();
    let to = grown_capacity(from, factor, needed);
    info!(from, to, "transfer buffer capacity increased");
    *buffer = ExtractionBuffer::with_capacity(to);
    device
        .run("extraction", || buffer.extract(items, min_len, &select))?
        .map_err(|needed| EngineError::DeviceExecution {
            pass: "extraction",
            message: format!("transfer buffer short by {} after resize", needed.saturating_sub(to)),
        })
}
