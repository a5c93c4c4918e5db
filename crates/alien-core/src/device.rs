//! The parallel device: a dedicated rayon pool that runs every pass.

use crate::config::ExecutionSettings;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, info};

/// Device variant, chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Multi-threaded pool, one worker per lane group.
    #[default]
    ThreadPool,
    /// Single worker; same pass code, deterministic scheduling.
    Serial,
}

#[derive(Debug)]
pub struct Device {
    kind: DeviceKind,
    pool: rayon::ThreadPool,
    work_group_size: usize,
}

impl Device {
    pub fn new(settings: &ExecutionSettings) -> Result<Self, EngineError> {
        if settings.work_group_size == 0 {
            return Err(EngineError::EnvironmentUnavailable(
                "work_group_size must be at least 1".to_string(),
            ));
        }
        let threads = match settings.device {
            DeviceKind::Serial => 1,
            DeviceKind::ThreadPool => settings.workers,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("alien-lane-{i}"))
            .build()
            .map_err(|e| EngineError::EnvironmentUnavailable(e.to_string()))?;
        info!(
            kind = ?settings.device,
            threads = pool.current_num_threads(),
            work_group_size = settings.work_group_size,
            "parallel device ready"
        );
        Ok(Self {
            kind: settings.device,
            pool,
            work_group_size: settings.work_group_size,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Worker threads backing the device.
    #[must_use]
    pub fn lanes(&self) -> usize {
        self.pool.current_num_threads()
    }

    #[must_use]
    pub const fn work_group_size(&self) -> usize {
        self.work_group_size
    }

    /// Run one pass on the device and wait for it. A panic inside the pass is
    /// reported as [`EngineError::DeviceExecution`].
    pub fn run<R, F>(&self, pass: &'static str, f: F) -> Result<R, EngineError>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool
            .install(|| panic::catch_unwind(AssertUnwindSafe(f)))
            .map_err(|payload| {
                let message = panic_message(payload.as_ref());
                error!(pass, %message, "device pass faulted");
                EngineError::DeviceExecution { pass, message }
            })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
