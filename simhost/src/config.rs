//! Kernel configuration.
//!
//! TOML files with environment overrides (`SIMHOST_` prefix) and documented
//! defaults. Time coordination is selected here, declaratively, before the
//! kernel initializes; changing it afterwards is an `InvalidState` error.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};
use crate::time::{
    MasterContinuousClock, MasterLockstepClock, SlaveContinuousClock, SlaveLockstepClock,
    StandaloneClock, TimeController,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeMode {
    Standalone,
    MasterContinuous,
    SlaveContinuous,
    MasterLockstep,
    SlaveLockstep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    pub mode: TimeMode,
    /// Frame delta for lockstep modes (default: 1/60 s).
    pub fixed_delta_seconds: f32,
    /// This node's id in distributed modes.
    pub node_id: u32,
    /// Peer node ids a lockstep master waits on.
    pub peers: Vec<u32>,
    pub time_scale: f32,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            mode: TimeMode::Standalone,
            fixed_delta_seconds: 1.0 / 60.0,
            node_id: 1,
            peers: Vec::new(),
            time_scale: 1.0,
        }
    }
}

impl TimeConfig {
    pub fn build_controller(&self) -> Box<dyn TimeController> {
        match self.mode {
            TimeMode::Standalone => Box::new(StandaloneClock::new(self.time_scale)),
            TimeMode::MasterContinuous => Box::new(MasterContinuousClock::new(self.time_scale)),
            TimeMode::SlaveContinuous => Box::new(SlaveContinuousClock::new()),
            TimeMode::MasterLockstep => Box::new(MasterLockstepClock::new(
                self.fixed_delta_seconds,
                self.peers.iter().copied(),
            )),
            TimeMode::SlaveLockstep => Box::new(SlaveLockstepClock::new(self.node_id)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Worker threads for frame-synced and asynchronous modules (default: 4).
    pub worker_threads: usize,
    /// Frames of event history kept for replicas that run slower than the
    /// frame rate (default: 120).
    pub max_event_history_frames: usize,
    /// Replicas pre-created per pooled provider (default: 2).
    pub snapshot_pool_size: usize,
    /// Frames before a pending lifecycle barrier is force-completed
    /// (default: 300).
    pub lifecycle_timeout_frames: u64,
    pub time: TimeConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_event_history_frames: 120,
            snapshot_pool_size: 2,
            lifecycle_timeout_frames: 300,
            time: TimeConfig::default(),
        }
    }
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| HostError::ConfigError(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| HostError::ConfigError(format!("Invalid TOML: {e}")))
    }

    /// Applies `SIMHOST_*` environment overrides.
    /// Example: `SIMHOST_WORKER_THREADS=8` overrides `worker_threads`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = env::var("SIMHOST_WORKER_THREADS") {
            self.worker_threads = val
                .parse()
                .map_err(|e| HostError::ConfigError(format!("SIMHOST_WORKER_THREADS: {e}")))?;
        }
        if let Ok(val) = env::var("SIMHOST_LIFECYCLE_TIMEOUT_FRAMES") {
            self.lifecycle_timeout_frames = val.parse().map_err(|e| {
                HostError::ConfigError(format!("SIMHOST_LIFECYCLE_TIMEOUT_FRAMES: {e}"))
            })?;
        }
        if let Ok(val) = env::var("SIMHOST_NODE_ID") {
            self.time.node_id = val
                .parse()
                .map_err(|e| HostError::ConfigError(format!("SIMHOST_NODE_ID: {e}")))?;
        }
        Ok(())
    }
}
