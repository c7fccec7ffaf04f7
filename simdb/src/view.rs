//! The read-and-record surface handed to modules.
//!
//! A view borrows a repository (live or replica) read-only, plus a command
//! buffer for deferred writes. Module code never mutates a world directly.

use crate::command::CommandBuffer;
use crate::component::Component;
use crate::entity::Entity;
use crate::error::Result;
use crate::event::Event;
use crate::query::QueryBuilder;
use crate::repository::Repository;
use crate::time::GlobalTime;

pub struct SimulationView<'a> {
    repo: &'a Repository,
    commands: &'a mut CommandBuffer,
}

impl<'a> SimulationView<'a> {
    pub fn new(repo: &'a Repository, commands: &'a mut CommandBuffer) -> Self {
        Self { repo, commands }
    }

    /// The global version of the observed world.
    pub fn tick(&self) -> u64 {
        self.repo.global_version()
    }

    pub fn time(&self) -> GlobalTime {
        self.repo.time()
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.repo.is_alive(entity)
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        self.repo.has_component::<T>(entity)
    }

    pub fn get_component_ro<T: Component>(&self, entity: Entity) -> Result<&T> {
        self.repo.get_component_ro::<T>(entity)
    }

    pub fn has_component_changed<T: Component>(&self, since_version: u64) -> bool {
        self.repo.has_component_changed::<T>(since_version)
    }

    pub fn query(&self) -> QueryBuilder<'_> {
        self.repo.query()
    }

    pub fn consume_events<E: Event>(&self) -> &[E] {
        self.repo.events().consume::<E>()
    }

    /// The deferred-write buffer the kernel plays back after dispatch.
    pub fn commands(&mut self) -> &mut CommandBuffer {
        self.commands
    }

    pub fn repository(&self) -> &Repository {
        self.repo
    }
}
