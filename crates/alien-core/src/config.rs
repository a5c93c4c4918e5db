//! Settings bundle handed to the engine at construction.

use crate::device::DeviceKind;
use crate::entities::{Float2, MAX_CONNECTIONS};
use crate::sync::LockPolicy;
use alien_index::wrapped_delta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by [`Settings::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Dimensions of the toroidal world in world units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSize {
    pub width: u32,
    pub height: u32,
}

impl Default for WorldSize {
    fn default() -> Self {
        Self {
            width: 1_000,
            height: 1_000,
        }
    }
}

impl WorldSize {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Shortest offset from `from` to `to` across the wrap.
    #[must_use]
    pub fn delta(&self, from: Float2, to: Float2) -> Float2 {
        Float2::new(
            wrapped_delta(from.x, to.x, self.width as f32),
            wrapped_delta(from.y, to.y, self.height as f32),
        )
    }

    /// Fold a position onto the torus.
    #[must_use]
    pub fn wrap(&self, pos: Float2) -> Float2 {
        Float2::new(
            alien_index::wrap(pos.x, self.width as f32),
            alien_index::wrap(pos.y, self.height as f32),
        )
    }
}

/// Physics parameters broadcast to every pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParameters {
    /// Fraction of velocity removed per step.
    pub friction: f32,
    /// Speed cap applied after movement forces.
    pub max_velocity: f32,
    /// Inner energy a particle needs before it may become a cell.
    pub particle_transformation_min_energy: f32,
    /// Per-step chance that an eligible particle becomes a cell.
    pub particle_transformation_probability: f32,
    /// Cells below this energy decay into a particle.
    pub cell_min_energy: f32,
    /// Absorption never lifts a cell above this energy.
    pub cell_max_energy: f32,
    /// Connection slots granted to freshly created cells.
    pub cell_max_connections: u8,
    /// Sticky cells fuse with foreign cells closer than this.
    pub cell_fusion_distance: f32,
    /// Slots per grid cell in the spatial maps.
    pub map_layers: u32,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            friction: 0.0,
            max_velocity: 2.0,
            particle_transformation_min_energy: 80.0,
            particle_transformation_probability: 0.2,
            cell_min_energy: 50.0,
            cell_max_energy: 1_000.0,
            cell_max_connections: MAX_CONNECTIONS as u8,
            cell_fusion_distance: 1.0,
            map_layers: 2,
        }
    }
}

/// Circular region overriding a subset of parameters.
///
/// Inside `core_radius` the spot values apply fully; over the following
/// `fade_radius` units they blend linearly back into the surrounding values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpot {
    pub center: Float2,
    pub core_radius: f32,
    pub fade_radius: f32,
    pub friction: f32,
    pub particle_transformation_probability: f32,
}

impl ParameterSpot {
    /// Blend weight in `[0, 1]` at `distance` from the centre.
    #[must_use]
    pub fn weight(&self, distance: f32) -> f32 {
        if distance <= self.core_radius {
            1.0
        } else if self.fade_radius > 0.0 && distance < self.core_radius + self.fade_radius {
            1.0 - (distance - self.core_radius) / self.fade_radius
        } else {
            0.0
        }
    }
}

/// Parameters that vary over space, resolved for one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalParameters {
    pub friction: f32,
    pub particle_transformation_probability: f32,
}

/// Rotation sense of a flow centre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowOrientation {
    #[default]
    Clockwise,
    CounterClockwise,
}

/// Radial flow source pushing entities around its centre.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCenter {
    pub pos: Float2,
    pub radius: f32,
    /// Acceleration at the centre; fades to zero at `radius`.
    pub strength: f32,
    #[serde(default)]
    pub orientation: FlowOrientation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowFieldSettings {
    pub active: bool,
    pub centers: Vec<FlowCenter>,
}

impl FlowFieldSettings {
    /// Tangential acceleration at `pos`.
    #[must_use]
    pub fn acceleration(&self, world: &WorldSize, pos: Float2) -> Float2 {
        if !self.active {
            return Float2::ZERO;
        }
        self.centers.iter().fold(Float2::ZERO, |acc, center| {
            let offset = world.delta(center.pos, pos);
            let distance = offset.length();
            if distance <= f32::EPSILON || distance >= center.radius {
                return acc;
            }
            let falloff = center.strength * (1.0 - distance / center.radius);
            let tangent = offset.perp() * (1.0 / distance);
            let tangent = match center.orientation {
                FlowOrientation::CounterClockwise => tangent,
                FlowOrientation::Clockwise => -tangent,
            };
            acc + tangent * falloff
        })
    }
}

/// Execution-width settings for the parallel device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Worker threads; `0` picks one per available core.
    pub workers: usize,
    /// Minimum items handled by one rayon task.
    pub work_group_size: usize,
    pub device: DeviceKind,
    pub lock_policy: LockPolicy,
    /// Steps between overflow inspections.
    pub overflow_check_interval: u64,
    /// Multiplier applied to capacities on overflow.
    pub capacity_growth_factor: f32,
    /// Seed for per-step random draws.
    pub rng_seed: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            work_group_size: 64,
            device: DeviceKind::ThreadPool,
            lock_policy: LockPolicy::default(),
            overflow_check_interval: 10,
            capacity_growth_factor: 2.0,
            rng_seed: 0x5EED_A11E,
        }
    }
}

/// Arena and buffer sizes allocated at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialCapacity {
    pub particles: usize,
    pub cells: usize,
    pub tokens: usize,
    /// Entity slots in the export transfer buffer.
    pub transfer: usize,
}

impl Default for InitialCapacity {
    fn default() -> Self {
        Self {
            particles: 4_096,
            cells: 4_096,
            tokens: 1_024,
            transfer: 4_096,
        }
    }
}

/// Everything the engine needs to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub world_size: WorldSize,
    pub parameters: SimulationParameters,
    pub spots: Vec<ParameterSpot>,
    pub flow_field: FlowFieldSettings,
    pub execution: ExecutionSettings,
    pub capacity: InitialCapacity,
}

impl Settings {
    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.world_size.width == 0 || self.world_size.height == 0 {
            return Err(ConfigError::Invalid("world dimensions must be non-zero"));
        }
        validate_parameters(&self.parameters)?;
        validate_spots(&self.spots)?;
        validate_flow_field(&self.flow_field)?;
        validate_execution(&self.execution)
    }

    /// Resolve spot-dependent parameters at `pos`.
    #[must_use]
    pub fn local_parameters(&self, pos: Float2) -> LocalParameters {
        let mut local = LocalParameters {
            friction: self.parameters.friction,
            particle_transformation_probability: self
                .parameters
                .particle_transformation_probability,
        };
        for spot in &self.spots {
            let weight = spot.weight(self.world_size.delta(spot.center, pos).length());
            if weight <= 0.0 {
                continue;
            }
            local.friction += (spot.friction - local.friction) * weight;
            local.particle_transformation_probability += (spot
                .particle_transformation_probability
                - local.particle_transformation_probability)
                * weight;
        }
        local
    }
}

pub(crate) fn validate_parameters(params: &SimulationParameters) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&params.friction) {
        return Err(ConfigError::Invalid("friction must lie in [0, 1]"));
    }
    if !(params.max_velocity > 0.0) {
        return Err(ConfigError::Invalid("max_velocity must be positive"));
    }
    if !(0.0..=1.0).contains(&params.particle_transformation_probability) {
        return Err(ConfigError::Invalid(
            "particle_transformation_probability must lie in [0, 1]",
        ));
    }
    if !(params.cell_min_energy >= 0.0) {
        return Err(ConfigError::Invalid("cell_min_energy must be non-negative"));
    }
    if !(params.cell_max_energy > params.cell_min_energy) {
        return Err(ConfigError::Invalid(
            "cell_max_energy must exceed cell_min_energy",
        ));
    }
    if params.particle_transformation_min_energy < params.cell_min_energy {
        return Err(ConfigError::Invalid(
            "particle_transformation_min_energy must be at least cell_min_energy",
        ));
    }
    if usize::from(params.cell_max_connections) > MAX_CONNECTIONS {
        return Err(ConfigError::Invalid("cell_max_connections exceeds the hard limit"));
    }
    if !(params.cell_fusion_distance > 0.0) {
        return Err(ConfigError::Invalid("cell_fusion_distance must be positive"));
    }
    if params.map_layers == 0 {
        return Err(ConfigError::Invalid("map_layers must be non-zero"));
    }
    Ok(())
}

pub(crate) fn validate_spots(spots: &[ParameterSpot]) -> Result<(), ConfigError> {
    for spot in spots {
        if !(spot.core_radius >= 0.0) || !(spot.fade_radius >= 0.0) {
            return Err(ConfigError::Invalid("spot radii must be non-negative"));
        }
        if !(0.0..=1.0).contains(&spot.friction)
            || !(0.0..=1.0).contains(&spot.particle_transformation_probability)
        {
            return Err(ConfigError::Invalid("spot values must lie in [0, 1]"));
        }
    }
    Ok(())
}

pub(crate) fn validate_execution(exec: &ExecutionSettings) -> Result<(), ConfigError> {
    if exec.overflow_check_interval == 0 {
        return Err(ConfigError::Invalid("overflow_check_interval must be non-zero"));
    }
    if !(exec.capacity_growth_factor > 1.0) || !exec.capacity_growth_factor.is_finite() {
        return Err(ConfigError::Invalid("capacity_growth_factor must exceed 1.0"));
    }
    Ok(())
}

pub(crate) fn validate_flow_field(flow: &FlowFieldSettings) -> Result<(), ConfigError> {
    if flow
        .centers
        .iter()
        .any(|center| !(center.radius > 0.0) || !center.strength.is_finite())
    {
        return Err(ConfigError::Invalid("flow centres need a positive radius"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().expect("defaults are valid");
    }

    #[test]
    fn validation_rejects_inconsistent_energy_thresholds() {
        let settings = Settings {
            parameters: SimulationParameters {
                particle_transformation_min_energy: 10.0,
                cell_min_energy: 50.0,
                ..SimulationParameters::default()
            },
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let zero_world = Settings {
            world_size: WorldSize::new(0, 10),
            ..Settings::default()
        };
        assert!(zero_world.validate().is_err());

        let no_growth = Settings {
            execution: ExecutionSettings {
                capacity_growth_factor: 1.0,
                ..ExecutionSettings::default()
            },
            ..Settings::default()
        };
        assert!(no_growth.validate().is_err());
    }

    #[test]
    fn spots_blend_linearly_across_the_fade() {
        let settings = Settings {
            world_size: WorldSize::new(100, 100),
            spots: vec![ParameterSpot {
                center: Float2::new(50.0, 50.0),
                core_radius: 10.0,
                fade_radius: 10.0,
                friction: 0.5,
                particle_transformation_probability: 1.0,
            }],
            parameters: SimulationParameters {
                friction: 0.1,
                ..SimulationParameters::default()
            },
            ..Settings::default()
        };
        let core = settings.local_parameters(Float2::new(55.0, 50.0));
        assert!((core.friction - 0.5).abs() < 1e-6);
        let fade = settings.local_parameters(Float2::new(65.0, 50.0));
        assert!((fade.friction - 0.3).abs() < 1e-6);
        let outside = settings.local_parameters(Float2::new(90.0, 50.0));
        assert!((outside.friction - 0.1).abs() < 1e-6);
    }

    #[test]
    fn flow_field_is_tangential_and_fades() {
        let world = WorldSize::new(100, 100);
        let flow = FlowFieldSettings {
            active: true,
            centers: vec![FlowCenter {
                pos: Float2::new(50.0, 50.0),
                radius: 20.0,
                strength: 1.0,
                orientation: FlowOrientation::CounterClockwise,
            }],
        };
        let accel = flow.acceleration(&world, Float2::new(60.0, 50.0));
        assert!(accel.x.abs() < 1e-6);
        assert!((accel.y - 0.5).abs() < 1e-6);
        assert_eq!(flow.acceleration(&world, Float2::new(80.0, 50.0)), Float2::ZERO);
    }

    #[test]
    fn settings_round_trip_through_json_with_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"world_size":{"width":64,"height":32}}"#).expect("parse");
        assert_eq!(settings.world_size, WorldSize::new(64, 32));
        assert_eq!(settings.parameters, SimulationParameters::default());
    }
}
