//! The module host kernel.
//!
//! One scheduler thread drives the frame pipeline; module execution fans
//! out to a small worker pool and rejoins through a completion channel.
//!
//! Per frame:
//! 1. advance time through the configured controller, play back externally
//!    queued commands, run phase-1 systems on the live repository
//! 2. snapshot current events into the history ring, swap the live bus
//! 3. update every provider (the one sync point; no concurrent writers)
//! 4. dispatch triggered modules (synchronous inline, frame-synced and
//!    asynchronous to workers)
//! 5. barrier-join the frame-synced units, with soft timeouts
//! 6. harvest finished asynchronous units, then play back command buffers
//!    in deterministic order: registration order first, completed async
//!    keyed by module id after
//! 7. tick the live repository
//!
//! Failures never leave phase 4-6: a module error or timeout is recorded
//! against its circuit breaker, its command buffer is discarded, and the
//! frame goes on.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use simdb::{
    BitMask256, CommandBuffer, ComponentTypeId, EventAccumulator, EventTypeId, GlobalTime,
    Repository, SimulationView,
};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::{KernelConfig, TimeConfig};
use crate::error::{HostError, Result};
use crate::module::{
    ExecutionMode, ExecutionPolicy, Module, ModuleId, ModuleStats, SnapshotStrategy,
    SystemRegistry,
};
use crate::pool::SnapshotPool;
use crate::provider::{
    DoubleBufferProvider, OnDemandProvider, ProviderKind, SharedProvider, SnapshotProvider,
    SnapshotRef,
};
use crate::time::TimeController;
use crate::worker::{Completion, Job, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderBinding {
    Direct,
    Provider(usize),
}

struct OutstandingRun {
    epoch: u64,
    view: SnapshotRef,
    deadline: Instant,
}

struct ModuleSlot {
    id: ModuleId,
    name: String,
    module: Arc<Mutex<dyn Module>>,
    policy: ExecutionPolicy,
    mask: BitMask256,
    watch_events: Vec<EventTypeId>,
    watch_components: Vec<ComponentTypeId>,
    binding: ProviderBinding,
    manual_provider: bool,
    breaker: CircuitBreaker,
    stats: ModuleStats,
    accumulated_delta: f32,
    last_run_tick: u64,
    epoch: u64,
    outstanding: Option<OutstandingRun>,
    commands: Arc<Mutex<CommandBuffer>>,
}

pub struct Kernel {
    live: Repository,
    config: KernelConfig,
    modules: Vec<ModuleSlot>,
    providers: Vec<Box<dyn SnapshotProvider>>,
    history: EventAccumulator,
    controller: Box<dyn TimeController>,
    systems: SystemRegistry,
    workers: Option<WorkerPool>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    input_commands: CommandBuffer,
    initialized: bool,
    frame_count: u64,
    last_frame_duration: Duration,
}

impl Kernel {
    pub fn new(live: Repository, config: KernelConfig) -> Self {
        let (completion_tx, completion_rx) = std::sync::mpsc::channel();
        let controller = config.time.build_controller();
        let history = EventAccumulator::new(config.max_event_history_frames);
        Self {
            live,
            config,
            modules: Vec::new(),
            providers: Vec::new(),
            history,
            controller,
            systems: SystemRegistry::new(),
            workers: None,
            completion_tx,
            completion_rx,
            input_commands: CommandBuffer::new(),
            initialized: false,
            frame_count: 0,
            last_frame_duration: Duration::ZERO,
        }
    }

    pub fn live(&self) -> &Repository {
        &self.live
    }

    /// Scheduler-thread access for world seeding and phase-1 style work.
    pub fn live_mut(&mut self) -> &mut Repository {
        &mut self.live
    }

    /// External command entry point, played back onto the live repository
    /// at the start of the next frame.
    pub fn input_commands(&mut self) -> &mut CommandBuffer {
        &mut self.input_commands
    }

    pub fn time(&self) -> GlobalTime {
        self.controller.time()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn last_frame_duration(&self) -> Duration {
        self.last_frame_duration
    }

    /// Replaces the time coordination mode. Only legal before `initialize`.
    pub fn configure_time(&mut self, time: TimeConfig) -> Result<()> {
        if self.initialized {
            return Err(HostError::InvalidState(
                "time controller cannot change after initialization".to_string(),
            ));
        }
        self.controller = time.build_controller();
        self.config.time = time;
        Ok(())
    }

    pub fn register_module(&mut self, module: impl Module + 'static) -> Result<ModuleId> {
        self.register_slot(module, None)
    }

    /// Registers a module with a manually built provider, bypassing
    /// auto-grouping.
    pub fn register_module_with_provider(
        &mut self,
        module: impl Module + 'static,
        provider: Box<dyn SnapshotProvider>,
    ) -> Result<ModuleId> {
        self.register_slot(module, Some(provider))
    }

    fn register_slot(
        &mut self,
        mut module: impl Module + 'static,
        provider: Option<Box<dyn SnapshotProvider>>,
    ) -> Result<ModuleId> {
        if self.initialized {
            return Err(HostError::InvalidState(format!(
                "cannot register {} after initialization",
                module.name()
            )));
        }
        let id = ModuleId(self.modules.len() as u16);
        module.on_registered(id);
        let policy = module.policy();
        let name = module.name().to_string();
        let (binding, manual_provider) = match provider {
            Some(provider) => {
                self.providers.push(provider);
                (ProviderBinding::Provider(self.providers.len() - 1), true)
            }
            None => (ProviderBinding::Direct, false),
        };
        self.modules.push(ModuleSlot {
            id,
            name,
            module: Arc::new(Mutex::new(module)),
            breaker: CircuitBreaker::new(
                policy.failure_threshold,
                Duration::from_millis(policy.circuit_reset_timeout_ms),
            ),
            policy,
            mask: BitMask256::FULL,
            watch_events: Vec::new(),
            watch_components: Vec::new(),
            binding,
            manual_provider,
            stats: ModuleStats::default(),
            accumulated_delta: 0.0,
            last_run_tick: 0,
            epoch: 0,
            outstanding: None,
            commands: Arc::new(Mutex::new(CommandBuffer::new())),
        });
        Ok(id)
    }

    /// Validates policies, resolves masks and watch lists, auto-assigns
    /// providers and spins up the worker pool. Must precede the first
    /// `update`.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Err(HostError::InvalidState("kernel already initialized".to_string()));
        }
        self.live.ensure_time_singleton()?;
        let registry = self.live.registry().clone();
        let event_registry = self.live.event_registry().clone();
        let time_id = registry
            .id_of::<GlobalTime>()
            .ok_or_else(|| HostError::InvalidState("GlobalTime not registered".to_string()))?;

        for slot in &mut self.modules {
            slot.policy.validate(&slot.name)?;
            let mut module = slot.module.lock();
            let required = module.required_components(&registry);
            slot.mask = if required.is_empty() {
                BitMask256::FULL
            } else {
                let mut mask = BitMask256::EMPTY;
                for id in required {
                    mask.set(id.bit());
                }
                // Every replica carries the clock.
                mask.set(time_id.bit());
                mask
            };
            slot.watch_events = module.watch_events(&event_registry);
            slot.watch_components = module.watch_components(&registry);
            module.register_systems(&mut self.systems);
        }

        self.assign_providers();
        self.workers = Some(WorkerPool::new(self.config.worker_threads)?);
        self.initialized = true;
        log::info!(
            "kernel initialized: {} modules, {} providers, {} workers",
            self.modules.len(),
            self.providers.len(),
            self.config.worker_threads
        );
        Ok(())
    }

    /// Groups modules on (mode, strategy, frequency) and builds one provider
    /// per group: a double buffer with the OR of member masks, an on-demand
    /// provider for a lone async module, a shared convoy for several.
    fn assign_providers(&mut self) {
        let mut groups: HashMap<(ExecutionMode, SnapshotStrategy, u32), Vec<usize>> =
            HashMap::new();
        for (index, slot) in self.modules.iter().enumerate() {
            if slot.manual_provider || slot.policy.strategy == SnapshotStrategy::Direct {
                continue;
            }
            groups
                .entry((
                    slot.policy.mode,
                    slot.policy.strategy,
                    slot.policy.target_frequency_hz.to_bits(),
                ))
                .or_default()
                .push(index);
        }
        let mut grouped: Vec<Vec<usize>> = groups.into_values().collect();
        grouped.sort_by_key(|members| members[0]);

        for members in grouped {
            let mut mask = BitMask256::EMPTY;
            for &member in &members {
                mask = mask.union(&self.modules[member].mask);
            }
            let strategy = self.modules[members[0]].policy.strategy;
            let provider: Box<dyn SnapshotProvider> = match strategy {
                SnapshotStrategy::DoubleBuffer => {
                    Box::new(DoubleBufferProvider::new(&self.live, mask))
                }
                SnapshotStrategy::OnDemand if members.len() == 1 => {
                    Box::new(OnDemandProvider::new(self.make_pool(), mask))
                }
                SnapshotStrategy::OnDemand => Box::new(SharedProvider::new(self.make_pool(), mask)),
                SnapshotStrategy::Direct => continue,
            };
            log::debug!(
                "provider {:?} serves modules {:?} with mask of {} types",
                provider.kind(),
                members,
                mask.count()
            );
            let provider_index = self.providers.len();
            self.providers.push(provider);
            for member in members {
                self.modules[member].binding = ProviderBinding::Provider(provider_index);
            }
        }
    }

    fn make_pool(&self) -> SnapshotPool {
        let registry = self.live.registry().clone();
        let events = self.live.event_registry().clone();
        let pool =
            SnapshotPool::new(move || Repository::with_registries(registry.clone(), events.clone()));
        pool.warmup(self.config.snapshot_pool_size, |_| {});
        pool
    }

    // -- frame pipeline -----------------------------------------------------

    pub fn update(&mut self, wall_delta: Duration) -> Result<()> {
        if !self.initialized {
            return Err(HostError::InvalidState(
                "update before initialize".to_string(),
            ));
        }
        let frame_started = Instant::now();

        // Phase 1: time, queued input, synchronous systems.
        let step = self
            .controller
            .update(wall_delta.as_secs_f32(), self.live.events_mut());
        self.live.set_time(step.time)?;
        self.input_commands.playback(&mut self.live);
        self.systems.run_all(&mut self.live, step.time.delta_seconds);

        // Phase 2: event history, buffer swap.
        let live_tick = self.live.global_version();
        self.history.record_frame(self.live.events(), live_tick);
        self.live.events_mut().swap_buffers();

        // Phase 3: provider sync.
        for provider in &mut self.providers {
            provider.update(&self.live, &self.history)?;
        }

        // Phase 4: dispatch.
        let now = Instant::now();
        let mut inline_ran: Vec<usize> = Vec::new();
        let mut fs_pending: Vec<usize> = Vec::new();
        for index in 0..self.modules.len() {
            self.modules[index].accumulated_delta += step.time.delta_seconds;

            if self.modules[index].outstanding.is_some() {
                // Previous async run still in flight: skip, keep the delta.
                if self.should_run(index) {
                    self.modules[index].stats.skipped_busy += 1;
                }
                continue;
            }
            if !self.should_run(index) {
                continue;
            }
            if !self.modules[index].breaker.can_run(now) {
                log::debug!(
                    "skipping: {}",
                    HostError::CircuitOpen(self.modules[index].name.clone())
                );
                continue;
            }
            self.dispatch(index, live_tick, now, &mut inline_ran, &mut fs_pending)?;
        }

        // Phase 5: frame-synced barrier with soft timeouts.
        let mut fs_done: Vec<usize> = Vec::new();
        let mut deferred: Vec<Completion> = Vec::new();
        while !fs_pending.is_empty() {
            let next_deadline = fs_pending
                .iter()
                .filter_map(|&i| self.modules[i].outstanding.as_ref().map(|o| o.deadline))
                .min()
                .unwrap_or_else(Instant::now);
            let wait = next_deadline.saturating_duration_since(Instant::now());
            match self.completion_rx.recv_timeout(wait) {
                Ok(completion) => {
                    let index = completion.module_index;
                    if fs_pending.contains(&index) && self.completion_is_current(&completion) {
                        fs_pending.retain(|&i| i != index);
                        if self.finish_run(completion)? {
                            fs_done.push(index);
                        }
                    } else {
                        deferred.push(completion);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let expired: Vec<usize> = fs_pending
                        .iter()
                        .copied()
                        .filter(|&i| {
                            self.modules[i]
                                .outstanding
                                .as_ref()
                                .map_or(true, |o| o.deadline <= now)
                        })
                        .collect();
                    for index in expired {
                        fs_pending.retain(|&i| i != index);
                        self.abandon_run(index, now)?;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(HostError::ChannelClosed),
            }
        }

        // Phase 6: harvest asynchronous completions and check their budgets.
        let mut async_done: Vec<usize> = Vec::new();
        for completion in deferred {
            self.harvest(completion, &mut async_done)?;
        }
        loop {
            match self.completion_rx.try_recv() {
                Ok(completion) => self.harvest(completion, &mut async_done)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(HostError::ChannelClosed),
            }
        }
        let now = Instant::now();
        for index in 0..self.modules.len() {
            if self.modules[index].policy.mode == ExecutionMode::Asynchronous {
                let timed_out = self.modules[index]
                    .outstanding
                    .as_ref()
                    .map_or(false, |o| o.deadline <= now);
                if timed_out {
                    self.abandon_run(index, now)?;
                }
            }
        }

        // Playback: registration order for synchronous and frame-synced,
        // then completed async keyed by module id.
        for index in 0..self.modules.len() {
            if inline_ran.contains(&index) || fs_done.contains(&index) {
                self.playback_module(index);
            }
        }
        async_done.sort_unstable();
        for index in async_done {
            self.playback_module(index);
        }

        // Phase 7: advance the authoritative world.
        self.live.tick();
        self.frame_count += 1;
        self.last_frame_duration = frame_started.elapsed();
        Ok(())
    }

    fn should_run(&self, index: usize) -> bool {
        let slot = &self.modules[index];
        if slot.accumulated_delta < slot.policy.period_seconds() {
            return false;
        }
        if !slot.watch_events.is_empty() && !self.live.events().any_active(&slot.watch_events) {
            return false;
        }
        if !slot.watch_components.is_empty() {
            let changed = slot
                .watch_components
                .iter()
                .any(|&id| self.live.has_component_changed_by_id(id, slot.last_run_tick));
            if !changed {
                return false;
            }
        }
        true
    }

    fn dispatch(
        &mut self,
        index: usize,
        live_tick: u64,
        now: Instant,
        inline_ran: &mut Vec<usize>,
        fs_pending: &mut Vec<usize>,
    ) -> Result<()> {
        let dt = self.modules[index].accumulated_delta;
        let view = match self.modules[index].binding {
            ProviderBinding::Direct => SnapshotRef::Live,
            ProviderBinding::Provider(p) => {
                self.providers[p].acquire_view(&self.live, &self.history)?
            }
        };
        {
            let slot = &mut self.modules[index];
            // Dispatch-time stamp: changes made while an async run is in
            // flight are caught on its next wake-up.
            slot.last_run_tick = live_tick;
            slot.accumulated_delta = 0.0;
            slot.stats.runs += 1;
        }

        match self.modules[index].policy.mode {
            ExecutionMode::Synchronous => {
                let started = Instant::now();
                let outcome = {
                    let slot = &self.modules[index];
                    let module = slot.module.clone();
                    let commands = slot.commands.clone();
                    let mut module = module.lock();
                    let mut commands = commands.lock();
                    let mut view = SimulationView::new(&self.live, &mut commands);
                    panic::catch_unwind(AssertUnwindSafe(|| module.tick(&mut view, dt)))
                };
                let outcome = match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err("module tick panicked".to_string()),
                };
                let ok = self.record_outcome(index, outcome, started.elapsed(), now);
                if ok {
                    inline_ran.push(index);
                }
            }
            ExecutionMode::FrameSynced | ExecutionMode::Asynchronous => {
                let slot = &mut self.modules[index];
                slot.epoch += 1;
                slot.outstanding = Some(OutstandingRun {
                    epoch: slot.epoch,
                    view: view.clone(),
                    deadline: now + slot.policy.runtime_budget(),
                });
                let job = make_job(
                    slot.module.clone(),
                    slot.commands.clone(),
                    view,
                    self.completion_tx.clone(),
                    index,
                    slot.epoch,
                    dt,
                );
                self.workers
                    .as_ref()
                    .ok_or(HostError::ChannelClosed)?
                    .execute(job)?;
                if self.modules[index].policy.mode == ExecutionMode::FrameSynced {
                    fs_pending.push(index);
                }
            }
        }
        Ok(())
    }

    fn completion_is_current(&self, completion: &Completion) -> bool {
        self.modules
            .get(completion.module_index)
            .and_then(|slot| slot.outstanding.as_ref())
            .map_or(false, |run| run.epoch == completion.epoch)
    }

    /// Routes one completion: current ones finish their run, stale ones
    /// (from abandoned epochs) are dropped.
    fn harvest(&mut self, completion: Completion, async_done: &mut Vec<usize>) -> Result<()> {
        if !self.completion_is_current(&completion) {
            log::debug!(
                "discarding stale completion from module {}",
                completion.module_index
            );
            return Ok(());
        }
        let index = completion.module_index;
        let mode = self.modules[index].policy.mode;
        let ok = self.finish_run(completion)?;
        if ok && mode == ExecutionMode::Asynchronous {
            async_done.push(index);
        }
        Ok(())
    }

    /// Releases the run's view and records its outcome. True on success.
    fn finish_run(&mut self, completion: Completion) -> Result<bool> {
        let index = completion.module_index;
        let Some(run) = self.modules[index].outstanding.take() else {
            return Ok(false);
        };
        if let ProviderBinding::Provider(p) = self.modules[index].binding {
            self.providers[p].release_view(run.view)?;
        }
        Ok(self.record_outcome(
            index,
            completion.outcome,
            completion.duration,
            Instant::now(),
        ))
    }

    fn record_outcome(
        &mut self,
        index: usize,
        outcome: std::result::Result<(), String>,
        duration: Duration,
        now: Instant,
    ) -> bool {
        let slot = &mut self.modules[index];
        slot.stats.last_runtime = duration;
        slot.stats.total_runtime += duration;
        match outcome {
            Ok(()) => {
                slot.breaker.record_success();
                true
            }
            Err(message) => {
                log::warn!("module {} failed: {message}", slot.name);
                slot.stats.failures += 1;
                slot.breaker.record_failure(now);
                // A failed tick's partial recording must not reach the world.
                slot.commands.lock().clear();
                false
            }
        }
    }

    /// Soft timeout: stop waiting, quarantine via the breaker, and swap the
    /// command slot so the zombie's eventual writes land nowhere.
    fn abandon_run(&mut self, index: usize, now: Instant) -> Result<()> {
        let Some(run) = self.modules[index].outstanding.take() else {
            return Ok(());
        };
        let binding = {
            let slot = &mut self.modules[index];
            let err = HostError::Timeout {
                module: slot.name.clone(),
                budget_ms: slot.policy.max_expected_runtime_ms,
            };
            log::warn!("{err}; abandoning the unit");
            slot.stats.timeouts += 1;
            slot.stats.failures += 1;
            slot.breaker.record_failure(now);
            slot.commands = Arc::new(Mutex::new(CommandBuffer::new()));
            slot.binding
        };
        if let ProviderBinding::Provider(p) = binding {
            // The provider will refuse to repool a replica the zombie still
            // holds; our reference just goes away.
            self.providers[p].release_view(run.view)?;
        }
        Ok(())
    }

    fn playback_module(&mut self, index: usize) {
        let commands = self.modules[index].commands.clone();
        let mut commands = commands.lock();
        if commands.is_empty() {
            return;
        }
        let report = commands.playback(&mut self.live);
        if report.failed > 0 {
            log::debug!(
                "module {}: {} of {} commands failed during playback",
                self.modules[index].name,
                report.failed,
                report.applied + report.failed
            );
        }
    }

    // -- introspection ------------------------------------------------------

    fn slot_by_name(&self, name: &str) -> Option<&ModuleSlot> {
        self.modules.iter().find(|slot| slot.name == name)
    }

    pub fn module_id(&self, name: &str) -> Option<ModuleId> {
        self.slot_by_name(name).map(|slot| slot.id)
    }

    /// Like [`Self::module_id`] but an error for wiring code that must not
    /// silently miss a participant.
    pub fn module_id_required(&self, name: &str) -> Result<ModuleId> {
        self.module_id(name)
            .ok_or_else(|| HostError::UnknownModule(name.to_string()))
    }

    /// Cumulative execution counters; reading never resets them.
    pub fn module_stats(&self, name: &str) -> Option<ModuleStats> {
        self.slot_by_name(name).map(|slot| slot.stats.clone())
    }

    pub fn breaker_state(&self, name: &str) -> Option<CircuitState> {
        self.slot_by_name(name).map(|slot| slot.breaker.state())
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Which provider a module ended up bound to, with its kind.
    pub fn module_provider(&self, name: &str) -> Option<(usize, ProviderKind)> {
        let slot = self.slot_by_name(name)?;
        match slot.binding {
            ProviderBinding::Direct => None,
            ProviderBinding::Provider(p) => Some((p, self.providers[p].kind())),
        }
    }
}

fn make_job(
    module: Arc<Mutex<dyn Module>>,
    commands: Arc<Mutex<CommandBuffer>>,
    view: SnapshotRef,
    tx: Sender<Completion>,
    module_index: usize,
    epoch: u64,
    dt: f32,
) -> Job {
    Box::new(move || {
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(
            || -> std::result::Result<(), String> {
                let mut module = module.lock();
                let mut commands = commands.lock();
                match &view {
                    SnapshotRef::Live => {
                        Err("worker module dispatched without a snapshot".to_string())
                    }
                    SnapshotRef::Replica(handle) => {
                        let replica = handle.read();
                        let mut view = SimulationView::new(&replica, &mut commands);
                        module.tick(&mut view, dt).map_err(|err| err.to_string())
                    }
                }
            },
        ));
        let outcome = match result {
            Ok(inner) => inner,
            Err(_) => Err("module tick panicked".to_string()),
        };
        // The scheduler may already have abandoned this epoch; it will
        // recognize and drop the completion.
        let _ = tx.send(Completion {
            module_index,
            epoch,
            outcome,
            duration: started.elapsed(),
        });
    })
}
