use crate::config::ConfigError;
use crate::hashmap::MapError;
use alien_index::IndexError;
use thiserror::Error;

/// Errors surfaced by the simulation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No usable parallel device could be set up.
    #[error("parallel device unavailable: {0}")]
    EnvironmentUnavailable(String),
    /// A pass faulted; the run cannot continue.
    #[error("device pass `{pass}` failed: {message}")]
    DeviceExecution { pass: &'static str, message: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Imported records reference entities that do not exist.
    #[error("invalid transfer data: {0}")]
    InvalidData(String),
    /// A previous fatal error stopped the engine.
    #[error("engine halted after a fatal error")]
    Halted,
}

impl EngineError {
    /// Whether the engine must stop stepping after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EnvironmentUnavailable(_) | Self::DeviceExecution { .. } | Self::Map(_) | Self::Halted
        )
    }
}
