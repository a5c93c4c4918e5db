//! Parallel artificial-life engine: particles and connected cells on a toroidal world.
//!
//! All simulation data lives in index arenas owned by [`SimulationEngine`]; each
//! timestep is a fixed sequence of data-parallel passes on a [`Device`].

pub mod arena;
pub mod config;
pub mod device;
pub mod engine;
pub mod entities;
pub mod error;
pub mod hashmap;
pub mod monitor;
pub mod pipeline;
pub mod sync;
pub mod transfer;

pub use arena::{Arena, ArenaEntity, Generations, Remap};
pub use config::{
    ConfigError, ExecutionSettings, FlowCenter, FlowFieldSettings, FlowOrientation,
    InitialCapacity, LocalParameters, ParameterSpot, Settings, SimulationParameters, WorldSize,
};
pub use device::{Device, DeviceKind};
pub use engine::{Capacities, Population, SimulationEngine};
pub use entities::{
    Cell, Connection, EntityId, Float2, MAX_CONNECTIONS, NUM_COLORS, Particle, SelectionState,
    TOKEN_MEMORY, Token,
};
pub use error::EngineError;
pub use hashmap::{ConcurrentHashMap, MapError};
pub use monitor::{MonitorData, ProcessStatistics};
pub use pipeline::{CompactionSummary, StepEvents};
pub use sync::{AtomicF32, LockPolicy, LockTimeout, SpinLock};
pub use transfer::{
    CellChange, CellRecord, ConnectionRecord, DataChange, DataTransfer, OverlayElement,
    OverlayKind, ParticleChange, ParticleRecord, Rect, SelectionShallowData, ShallowUpdate,
    TokenRecord, TransferCounts,
};
