//! Entity Lifecycle Module: an ACK barrier over multi-module entity
//! construction and destruction.
//!
//! A coordinated entity does not become `Active` the moment it is created;
//! it sits in `Constructing` until every participating module has
//! acknowledged the `ConstructionOrder`. Destruction mirrors this. A
//! participant that reports failure aborts the construction; a participant
//! that never answers is overridden by the frame timeout.
//!
//! All processing is idempotent: duplicate ACKs and ACKs for untracked
//! entities change nothing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use simdb::{CommandBuffer, Entity, Event, LifecycleState, SimulationView};

use crate::error::Result;
use crate::module::{ExecutionPolicy, Module, ModuleId};

/// Orders every participant to prepare `entity` for activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructionOrder {
    pub entity: Entity,
    pub type_id: u32,
    pub frame: u64,
}

impl Event for ConstructionOrder {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructionAck {
    pub entity: Entity,
    pub module_id: ModuleId,
    pub success: bool,
    pub error: Option<String>,
}

impl Event for ConstructionAck {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestructionOrder {
    pub entity: Entity,
    pub frame: u64,
    pub reason: Option<String>,
}

impl Event for DestructionOrder {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestructionAck {
    pub entity: Entity,
    pub module_id: ModuleId,
    pub success: bool,
}

impl Event for DestructionAck {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingState {
    Construction,
    Destruction,
}

#[derive(Debug)]
struct PendingEntity {
    state: PendingState,
    outstanding: HashSet<ModuleId>,
    start_frame: u64,
}

/// Barrier bookkeeping, shared between the module and its handle.
pub struct LifecycleTracker {
    participants: HashSet<ModuleId>,
    pending: HashMap<Entity, PendingEntity>,
    timeout_frames: u64,
    timeout_count: u64,
}

impl LifecycleTracker {
    pub fn new(timeout_frames: u64) -> Self {
        Self {
            participants: HashSet::new(),
            pending: HashMap::new(),
            timeout_frames,
            timeout_count: 0,
        }
    }

    pub fn set_participants(&mut self, participants: impl IntoIterator<Item = ModuleId>) {
        self.participants = participants.into_iter().collect();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeout_count
    }

    pub fn is_pending(&self, entity: Entity) -> bool {
        self.pending.contains_key(&entity)
    }

    /// Starts the construction barrier for `entity` and broadcasts the
    /// order. With no participants the entity activates immediately.
    pub fn begin_construction(
        &mut self,
        entity: Entity,
        type_id: u32,
        frame: u64,
        cmd: &mut CommandBuffer,
    ) {
        if self.pending.contains_key(&entity) {
            log::debug!("construction of {entity} already pending");
            return;
        }
        cmd.set_lifecycle(entity, LifecycleState::Constructing);
        cmd.publish_event(ConstructionOrder {
            entity,
            type_id,
            frame,
        });
        if self.participants.is_empty() {
            cmd.set_lifecycle(entity, LifecycleState::Active);
            return;
        }
        self.pending.insert(
            entity,
            PendingEntity {
                state: PendingState::Construction,
                outstanding: self.participants.clone(),
                start_frame: frame,
            },
        );
    }

    pub fn process_construction_ack(
        &mut self,
        ack: &ConstructionAck,
        frame: u64,
        cmd: &mut CommandBuffer,
    ) {
        let Some(pending) = self.pending.get_mut(&ack.entity) else {
            log::debug!("construction ack for untracked entity {}", ack.entity);
            return;
        };
        if pending.state != PendingState::Construction {
            return;
        }
        if !ack.success {
            log::warn!(
                "module {:?} failed to construct {}: {:?}; aborting",
                ack.module_id,
                ack.entity,
                ack.error
            );
            cmd.publish_event(DestructionOrder {
                entity: ack.entity,
                frame,
                reason: ack.error.clone().or_else(|| Some("construction failed".to_string())),
            });
            cmd.destroy_entity(ack.entity);
            self.pending.remove(&ack.entity);
            return;
        }
        if !pending.outstanding.remove(&ack.module_id) {
            // Duplicate ack.
            return;
        }
        if pending.outstanding.is_empty() {
            cmd.set_lifecycle(ack.entity, LifecycleState::Active);
            self.pending.remove(&ack.entity);
        }
    }

    /// Starts the destruction barrier and broadcasts the order.
    pub fn begin_destruction(
        &mut self,
        entity: Entity,
        frame: u64,
        reason: Option<String>,
        cmd: &mut CommandBuffer,
    ) {
        if self.pending.contains_key(&entity) {
            log::debug!("destruction of {entity} already pending");
            return;
        }
        cmd.set_lifecycle(entity, LifecycleState::Destructing);
        cmd.publish_event(DestructionOrder {
            entity,
            frame,
            reason,
        });
        if self.participants.is_empty() {
            cmd.destroy_entity(entity);
            return;
        }
        self.pending.insert(
            entity,
            PendingEntity {
                state: PendingState::Destruction,
                outstanding: self.participants.clone(),
                start_frame: frame,
            },
        );
    }

    pub fn process_destruction_ack(&mut self, ack: &DestructionAck, cmd: &mut CommandBuffer) {
        let Some(pending) = self.pending.get_mut(&ack.entity) else {
            log::debug!("destruction ack for untracked entity {}", ack.entity);
            return;
        };
        if pending.state != PendingState::Destruction {
            return;
        }
        if !pending.outstanding.remove(&ack.module_id) {
            return;
        }
        if pending.outstanding.is_empty() {
            cmd.destroy_entity(ack.entity);
            self.pending.remove(&ack.entity);
        }
    }

    /// Force-completes barriers older than the timeout window: stuck
    /// constructions activate, stuck destructions destroy.
    pub fn check_timeouts(&mut self, frame: u64, cmd: &mut CommandBuffer) {
        let timeout = self.timeout_frames;
        let expired: Vec<(Entity, PendingState)> = self
            .pending
            .iter()
            .filter(|(_, p)| frame.saturating_sub(p.start_frame) > timeout)
            .map(|(e, p)| (*e, p.state))
            .collect();
        for (entity, state) in expired {
            log::warn!("lifecycle barrier for {entity} timed out in {state:?}");
            match state {
                PendingState::Construction => cmd.set_lifecycle(entity, LifecycleState::Active),
                PendingState::Destruction => cmd.destroy_entity(entity),
            }
            self.pending.remove(&entity);
            self.timeout_count += 1;
        }
    }
}

/// Shared control surface over the tracker, usable from outside the module.
#[derive(Clone)]
pub struct LifecycleHandle {
    tracker: Arc<Mutex<LifecycleTracker>>,
}

impl LifecycleHandle {
    pub fn set_participants(&self, participants: impl IntoIterator<Item = ModuleId>) {
        self.tracker.lock().set_participants(participants);
    }

    pub fn begin_construction(
        &self,
        entity: Entity,
        type_id: u32,
        frame: u64,
        cmd: &mut CommandBuffer,
    ) {
        self.tracker
            .lock()
            .begin_construction(entity, type_id, frame, cmd);
    }

    pub fn begin_destruction(
        &self,
        entity: Entity,
        frame: u64,
        reason: Option<String>,
        cmd: &mut CommandBuffer,
    ) {
        self.tracker
            .lock()
            .begin_destruction(entity, frame, reason, cmd);
    }

    pub fn pending_count(&self) -> usize {
        self.tracker.lock().pending_count()
    }

    pub fn timeout_count(&self) -> u64 {
        self.tracker.lock().timeout_count()
    }

    pub fn is_pending(&self, entity: Entity) -> bool {
        self.tracker.lock().is_pending(entity)
    }
}

/// The module that drives the tracker from consumed ACK events.
pub struct EntityLifecycleModule {
    tracker: Arc<Mutex<LifecycleTracker>>,
}

impl EntityLifecycleModule {
    pub fn new(timeout_frames: u64) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(LifecycleTracker::new(timeout_frames))),
        }
    }

    pub fn handle(&self) -> LifecycleHandle {
        LifecycleHandle {
            tracker: self.tracker.clone(),
        }
    }
}

impl Module for EntityLifecycleModule {
    fn name(&self) -> &str {
        "entity_lifecycle"
    }

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::synchronous()
    }

    fn tick(&mut self, view: &mut SimulationView<'_>, _dt: f32) -> Result<()> {
        let frame = view.time().frame_number;
        let construction_acks = view.consume_events::<ConstructionAck>().to_vec();
        let destruction_acks = view.consume_events::<DestructionAck>().to_vec();

        let mut tracker = self.tracker.lock();
        let cmd = view.commands();
        for ack in &construction_acks {
            tracker.process_construction_ack(ack, frame, cmd);
        }
        for ack in &destruction_acks {
            tracker.process_destruction_ack(ack, cmd);
        }
        tracker.check_timeouts(frame, cmd);
        Ok(())
    }
}
