//! Deferred-write command buffers.
//!
//! Modules observing a snapshot cannot touch the authoritative repository;
//! they record structural and state changes here and the kernel plays the
//! buffer back on the live world in a deterministic per-frame order.
//!
//! Entities created inside a buffer are identified by a buffer-local id, so
//! a component can be attached to an entity created earlier in the same
//! tick; playback resolves local ids to freshly allocated handles.

use std::collections::HashMap;

use crate::component::Component;
use crate::entity::{Entity, LifecycleState};
use crate::error::Result;
use crate::event::Event;
use crate::repository::Repository;

/// Identity of an entity created earlier in the same buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalEntity(pub u32);

/// Target of a recorded operation: a live handle or a buffer-local one.
#[derive(Debug, Clone, Copy)]
pub enum EntityRef {
    Existing(Entity),
    Local(LocalEntity),
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        Self::Existing(entity)
    }
}

impl From<LocalEntity> for EntityRef {
    fn from(local: LocalEntity) -> Self {
        Self::Local(local)
    }
}

type ApplyFn = Box<dyn FnOnce(&mut Repository, Entity) -> Result<()> + Send>;
type PublishFn = Box<dyn FnOnce(&mut Repository) + Send>;

enum Command {
    CreateEntity {
        local: LocalEntity,
    },
    DestroyEntity {
        entity: EntityRef,
    },
    AddComponent {
        entity: EntityRef,
        component: &'static str,
        apply: ApplyFn,
    },
    SetComponent {
        entity: EntityRef,
        component: &'static str,
        apply: ApplyFn,
    },
    RemoveComponent {
        entity: EntityRef,
        component: &'static str,
        apply: ApplyFn,
    },
    SetLifecycle {
        entity: EntityRef,
        state: LifecycleState,
    },
    PublishEvent {
        publish: PublishFn,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    pub applied: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    next_local: u32,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_entity(&mut self) -> LocalEntity {
        let local = LocalEntity(self.next_local);
        self.next_local += 1;
        self.commands.push(Command::CreateEntity { local });
        local
    }

    pub fn destroy_entity(&mut self, entity: impl Into<EntityRef>) {
        self.commands.push(Command::DestroyEntity {
            entity: entity.into(),
        });
    }

    pub fn add_component<T: Component>(&mut self, entity: impl Into<EntityRef>, value: T) {
        self.commands.push(Command::AddComponent {
            entity: entity.into(),
            component: T::type_name(),
            apply: Box::new(move |repo, e| repo.add_component(e, value)),
        });
    }

    pub fn set_component<T: Component>(&mut self, entity: impl Into<EntityRef>, value: T) {
        self.commands.push(Command::SetComponent {
            entity: entity.into(),
            component: T::type_name(),
            apply: Box::new(move |repo, e| repo.set_component(e, value)),
        });
    }

    pub fn remove_component<T: Component>(&mut self, entity: impl Into<EntityRef>) {
        self.commands.push(Command::RemoveComponent {
            entity: entity.into(),
            component: T::type_name(),
            apply: Box::new(move |repo, e| repo.remove_component::<T>(e)),
        });
    }

    pub fn set_lifecycle(&mut self, entity: impl Into<EntityRef>, state: LifecycleState) {
        self.commands.push(Command::SetLifecycle {
            entity: entity.into(),
            state,
        });
    }

    pub fn publish_event<E: Event>(&mut self, event: E) {
        self.commands.push(Command::PublishEvent {
            publish: Box::new(move |repo| repo.events_mut().publish(event)),
        });
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.next_local = 0;
    }

    /// Applies recorded operations in order. Individual failures are logged
    /// and skipped; the batch never aborts.
    pub fn playback(&mut self, repo: &mut Repository) -> PlaybackReport {
        let mut report = PlaybackReport::default();
        let mut locals: HashMap<LocalEntity, Entity> = HashMap::new();

        let resolve = |locals: &HashMap<LocalEntity, Entity>, entity: EntityRef| match entity {
            EntityRef::Existing(e) => Some(e),
            EntityRef::Local(local) => locals.get(&local).copied(),
        };

        for command in self.commands.drain(..) {
            match command {
                Command::CreateEntity { local } => {
                    let entity = repo.create_entity();
                    locals.insert(local, entity);
                    report.applied += 1;
                }
                Command::DestroyEntity { entity } => match resolve(&locals, entity) {
                    Some(e) => match repo.destroy_entity(e) {
                        Ok(()) => report.applied += 1,
                        Err(err) => {
                            log::warn!("command playback: destroy {e}: {err}");
                            report.failed += 1;
                        }
                    },
                    None => {
                        log::warn!("command playback: destroy of unresolved local entity");
                        report.failed += 1;
                    }
                },
                Command::AddComponent {
                    entity,
                    component,
                    apply,
                }
                | Command::SetComponent {
                    entity,
                    component,
                    apply,
                }
                | Command::RemoveComponent {
                    entity,
                    component,
                    apply,
                } => match resolve(&locals, entity) {
                    Some(e) => match apply(repo, e) {
                        Ok(()) => report.applied += 1,
                        Err(err) => {
                            log::warn!("command playback: {component} on {e}: {err}");
                            report.failed += 1;
                        }
                    },
                    None => {
                        log::warn!("command playback: {component} on unresolved local entity");
                        report.failed += 1;
                    }
                },
                Command::SetLifecycle { entity, state } => match resolve(&locals, entity) {
                    Some(e) => match repo.set_lifecycle(e, state) {
                        Ok(()) => report.applied += 1,
                        Err(err) => {
                            log::warn!("command playback: lifecycle of {e}: {err}");
                            report.failed += 1;
                        }
                    },
                    None => {
                        log::warn!("command playback: lifecycle of unresolved local entity");
                        report.failed += 1;
                    }
                },
                Command::PublishEvent { publish } => {
                    publish(repo);
                    report.applied += 1;
                }
            }
        }
        self.next_local = 0;
        report
    }
}
