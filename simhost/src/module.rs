//! The module contract: execution policy, reactive watch lists, and the
//! per-module statistics the kernel accumulates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use simdb::{
    ComponentRegistry, ComponentTypeId, EventTypeId, EventTypeRegistry, Repository,
    SimulationView,
};

use crate::error::{HostError, Result};

/// Kernel-assigned module identity, stable for the kernel's lifetime and
/// carried by lifecycle ACK events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Runs inline on the scheduler thread against the live repository.
    Synchronous,
    /// Runs on a worker, barrier-joined before command playback.
    FrameSynced,
    /// Runs on a worker and may span multiple frames.
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotStrategy {
    /// The authoritative repository itself.
    Direct,
    /// A persistent double-buffered replica, synced once per frame.
    DoubleBuffer,
    /// A pooled replica acquired per dispatch. Modules grouped on the same
    /// cadence share one convoy snapshot instead.
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub mode: ExecutionMode,
    pub strategy: SnapshotStrategy,
    /// At most 60.
    pub target_frequency_hz: f32,
    pub max_expected_runtime_ms: u64,
    pub failure_threshold: u32,
    pub circuit_reset_timeout_ms: u64,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Synchronous,
            strategy: SnapshotStrategy::Direct,
            target_frequency_hz: 60.0,
            max_expected_runtime_ms: 100,
            failure_threshold: 3,
            circuit_reset_timeout_ms: 5000,
        }
    }
}

impl ExecutionPolicy {
    pub fn synchronous() -> Self {
        Self::default()
    }

    pub fn frame_synced(hz: f32) -> Self {
        Self {
            mode: ExecutionMode::FrameSynced,
            strategy: SnapshotStrategy::DoubleBuffer,
            target_frequency_hz: hz,
            ..Self::default()
        }
    }

    pub fn asynchronous(hz: f32) -> Self {
        Self {
            mode: ExecutionMode::Asynchronous,
            strategy: SnapshotStrategy::OnDemand,
            target_frequency_hz: hz,
            ..Self::default()
        }
    }

    /// Seconds between runs at the target frequency.
    pub fn period_seconds(&self) -> f32 {
        1.0 / self.target_frequency_hz
    }

    pub fn runtime_budget(&self) -> Duration {
        Duration::from_millis(self.max_expected_runtime_ms)
    }

    /// Rejects the mode/strategy pairs the kernel cannot honor.
    pub fn validate(&self, module: &str) -> Result<()> {
        let valid_pair = matches!(
            (self.mode, self.strategy),
            (ExecutionMode::Synchronous, SnapshotStrategy::Direct)
                | (ExecutionMode::FrameSynced, SnapshotStrategy::DoubleBuffer)
                | (ExecutionMode::Asynchronous, SnapshotStrategy::OnDemand)
        );
        if !valid_pair {
            return Err(HostError::PolicyViolation {
                module: module.to_string(),
                reason: format!("{:?} mode cannot use {:?} snapshots", self.mode, self.strategy),
            });
        }
        if !(self.target_frequency_hz > 0.0 && self.target_frequency_hz <= 60.0) {
            return Err(HostError::PolicyViolation {
                module: module.to_string(),
                reason: format!(
                    "target frequency {} Hz outside (0, 60]",
                    self.target_frequency_hz
                ),
            });
        }
        if self.failure_threshold == 0 {
            return Err(HostError::PolicyViolation {
                module: module.to_string(),
                reason: "failure threshold must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// A computational module hosted by the kernel.
pub trait Module: Send {
    fn name(&self) -> &str;

    fn policy(&self) -> ExecutionPolicy;

    /// Called once at registration with the kernel-assigned id.
    fn on_registered(&mut self, _id: ModuleId) {}

    /// Component types this module reads; drives mask optimization. Empty
    /// means "everything".
    fn required_components(&self, _registry: &ComponentRegistry) -> Vec<ComponentTypeId> {
        Vec::new()
    }

    /// Event types that gate execution: with a non-empty list the module
    /// only runs on frames where at least one watched type is active.
    fn watch_events(&self, _events: &EventTypeRegistry) -> Vec<EventTypeId> {
        Vec::new()
    }

    /// Component types that gate execution on change since the last run.
    fn watch_components(&self, _registry: &ComponentRegistry) -> Vec<ComponentTypeId> {
        Vec::new()
    }

    fn tick(&mut self, view: &mut SimulationView<'_>, dt: f32) -> Result<()>;

    /// Optional phase-1 sub-systems run on the live repository.
    fn register_systems(&mut self, _registry: &mut SystemRegistry) {}
}

/// Cumulative per-module execution counters; reads never reset them.
#[derive(Debug, Clone, Default)]
pub struct ModuleStats {
    pub runs: u64,
    pub failures: u64,
    pub timeouts: u64,
    /// Triggers skipped because the previous asynchronous run was still in
    /// flight; the delta carries over.
    pub skipped_busy: u64,
    pub last_runtime: Duration,
    pub total_runtime: Duration,
}

type SystemFn = Box<dyn FnMut(&mut Repository, f32) -> simdb::Result<()> + Send>;

/// Named synchronous sub-systems, run against the live repository in
/// registration order during phase 1.
#[derive(Default)]
pub struct SystemRegistry {
    systems: Vec<(String, SystemFn)>,
}

impl SystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        system: impl FnMut(&mut Repository, f32) -> simdb::Result<()> + Send + 'static,
    ) {
        self.systems.push((name.into(), Box::new(system)));
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub(crate) fn run_all(&mut self, repo: &mut Repository, dt: f32) {
        for (name, system) in &mut self.systems {
            if let Err(err) = system(repo, dt) {
                log::warn!("system {name} failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_mode_strategy_pairs() {
        let policy = ExecutionPolicy {
            mode: ExecutionMode::Asynchronous,
            strategy: SnapshotStrategy::Direct,
            ..ExecutionPolicy::default()
        };
        assert!(matches!(
            policy.validate("m"),
            Err(HostError::PolicyViolation { .. })
        ));
    }

    #[test]
    fn rejects_frequencies_above_sixty() {
        let policy = ExecutionPolicy {
            target_frequency_hz: 120.0,
            ..ExecutionPolicy::default()
        };
        assert!(policy.validate("m").is_err());
        assert!(ExecutionPolicy::asynchronous(10.0).validate("m").is_ok());
    }
}
