//! The entity-component repository.
//!
//! Composes the entity index, the per-type chunked columns, the component
//! registry and the event bus; owns the global version counter that stamps
//! every versioned write; and implements masked bulk synchronization, which
//! is how snapshot replicas are kept current.
//!
//! A repository and the replicas synced from it form a *family* sharing one
//! component registry and one event-type registry, so numeric ids agree on
//! both sides of every `sync_from`.

use std::any::Any;
use std::sync::Arc;

use crate::command::CommandBuffer;
use crate::component::{Component, ComponentPolicy, ComponentTypeId};
use crate::entity::{Entity, EntityIndex, LifecycleState};
use crate::error::{Result, SimDbError};
use crate::event::{EventBus, EventTypeRegistry};
use crate::mask::BitMask256;
use crate::query::QueryBuilder;
use crate::registry::ComponentRegistry;
use crate::storage::column::{ColumnMeta, ColumnOps, PlainColumn, TypedColumn};
use crate::time::GlobalTime;
use crate::view::SimulationView;

/// Parameters of a masked synchronization.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Component filter; `None` means everything the policy admits.
    pub mask: Option<BitMask256>,
    /// Pull in transient types the policy would otherwise exclude.
    pub include_transient: bool,
    /// Types to drop even when the mask admits them.
    pub exclude: BitMask256,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mask: None,
            include_transient: false,
            exclude: BitMask256::EMPTY,
        }
    }
}

impl SyncOptions {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn masked(mask: BitMask256) -> Self {
        Self {
            mask: Some(mask),
            ..Self::default()
        }
    }
}

fn typed_col<'a, T: Component>(
    columns: &'a [Option<Box<dyn ColumnOps>>],
    id: ComponentTypeId,
) -> Result<&'a T::Storage> {
    let slot = columns
        .get(id.index())
        .and_then(|s| s.as_deref())
        .ok_or(SimDbError::UnregisteredComponent(T::type_name()))?;
    slot.as_any()
        .downcast_ref::<T::Storage>()
        .ok_or_else(|| SimDbError::SyncMaskMismatch(T::type_name().to_string()))
}

fn typed_col_mut<'a, T: Component>(
    columns: &'a mut [Option<Box<dyn ColumnOps>>],
    id: ComponentTypeId,
) -> Result<&'a mut T::Storage> {
    let slot = columns
        .get_mut(id.index())
        .and_then(|s| s.as_deref_mut())
        .ok_or(SimDbError::UnregisteredComponent(T::type_name()))?;
    slot.as_any_mut()
        .downcast_mut::<T::Storage>()
        .ok_or_else(|| SimDbError::SyncMaskMismatch(T::type_name().to_string()))
}

pub struct Repository {
    registry: Arc<ComponentRegistry>,
    event_registry: Arc<EventTypeRegistry>,
    entities: EntityIndex,
    columns: Vec<Option<Box<dyn ColumnOps>>>,
    events: EventBus,
    global_version: u64,
    last_sync_version: u64,
    last_filter_mask: Option<BitMask256>,
    time_entity: Option<Entity>,
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    pub fn new() -> Self {
        Self::with_registries(
            Arc::new(ComponentRegistry::new()),
            Arc::new(EventTypeRegistry::new()),
        )
    }

    /// Builds a repository joined to an existing registry family.
    pub fn with_registries(
        registry: Arc<ComponentRegistry>,
        event_registry: Arc<EventTypeRegistry>,
    ) -> Self {
        let events = EventBus::new(event_registry.clone());
        let mut repo = Self {
            registry,
            event_registry,
            entities: EntityIndex::new(),
            columns: Vec::new(),
            events,
            global_version: 1,
            last_sync_version: 0,
            last_filter_mask: None,
            time_entity: None,
        };
        // The clock is part of every schema.
        if let Err(err) = repo.register_component::<GlobalTime>() {
            log::error!("failed to register GlobalTime: {err}");
        }
        repo
    }

    /// An empty repository of the same family, suitable as a sync target.
    pub fn replica(&self) -> Self {
        Self::with_registries(self.registry.clone(), self.event_registry.clone())
    }

    // -- registration -------------------------------------------------------

    pub fn register_component<T: Component>(&mut self) -> Result<ComponentTypeId> {
        self.register_component_with::<T>(None)
    }

    /// Registers `T` with an explicit policy, superseding defaults.
    pub fn register_component_with<T: Component>(
        &mut self,
        policy: Option<ComponentPolicy>,
    ) -> Result<ComponentTypeId> {
        let id = self.registry.register::<T>(policy)?;
        if self
            .columns
            .get(id.index())
            .map_or(true, |slot| slot.is_none())
        {
            let info = self
                .registry
                .info(id)
                .ok_or(SimDbError::UnregisteredComponent(T::type_name()))?;
            let meta = ColumnMeta {
                id,
                name: info.name,
                policy: info.policy,
                kind: info.kind,
            };
            if self.columns.len() <= id.index() {
                self.columns.resize_with(id.index() + 1, || None);
            }
            self.columns[id.index()] = Some(Box::new(T::Storage::new_column(meta)));
        }
        Ok(id)
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn event_registry(&self) -> &Arc<EventTypeRegistry> {
        &self.event_registry
    }

    // -- entities -----------------------------------------------------------

    pub fn create_entity(&mut self) -> Entity {
        self.create_entity_with(LifecycleState::Active)
    }

    pub fn create_entity_with(&mut self, lifecycle: LifecycleState) -> Entity {
        let entity = self.entities.allocate(lifecycle);
        self.global_version += 1;
        entity
    }

    /// Pre-construction placeholder used by the network path.
    pub fn create_ghost(&mut self) -> Entity {
        self.create_entity_with(LifecycleState::Ghost)
    }

    /// Promotes a ghost to the regular construction path, keeping whatever
    /// components the ghost already accumulated.
    pub fn promote_ghost(&mut self, entity: Entity) -> Result<()> {
        let header = self.entities.header_checked_mut(entity)?;
        if header.lifecycle != LifecycleState::Ghost {
            return Err(SimDbError::InvalidState(format!(
                "entity {entity} is not a ghost"
            )));
        }
        header.lifecycle = LifecycleState::Constructing;
        Ok(())
    }

    pub fn destroy_entity(&mut self, entity: Entity) -> Result<()> {
        let mask = self.entities.header(entity)?.component_mask;
        let version = self.global_version;
        for bit in mask.iter() {
            if let Some(column) = self
                .columns
                .get_mut(bit as usize)
                .and_then(|s| s.as_deref_mut())
            {
                column.clear_slot(entity.index, version);
            }
        }
        self.entities.release(entity)?;
        if self.time_entity == Some(entity) {
            self.time_entity = None;
        }
        self.global_version += 1;
        Ok(())
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.live_count()
    }

    pub fn lifecycle(&self, entity: Entity) -> Result<LifecycleState> {
        Ok(self.entities.header(entity)?.lifecycle)
    }

    pub fn set_lifecycle(&mut self, entity: Entity, state: LifecycleState) -> Result<()> {
        self.entities.header_checked_mut(entity)?.lifecycle = state;
        Ok(())
    }

    pub fn entity_index(&self) -> &EntityIndex {
        &self.entities
    }

    // -- components ---------------------------------------------------------

    fn id_of<T: Component>(&self) -> Result<ComponentTypeId> {
        self.registry
            .id_of::<T>()
            .ok_or(SimDbError::UnregisteredComponent(T::type_name()))
    }

    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        let id = self.id_of::<T>()?;
        let version = self.global_version;
        let column = typed_col_mut::<T>(&mut self.columns, id)?;
        let header = self.entities.header_checked_mut(entity)?;
        let present = header.component_mask.test(id.bit());
        header.component_mask.set(id.bit());
        if present {
            column.write(entity.index, value, version);
        } else {
            column.insert(entity.index, value, version);
        }
        Ok(())
    }

    /// Upsert: identical to [`Self::add_component`], kept as a separate name
    /// so call sites read as intent.
    pub fn set_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        self.add_component(entity, value)
    }

    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<()> {
        let id = self.id_of::<T>()?;
        let version = self.global_version;
        let column = typed_col_mut::<T>(&mut self.columns, id)?;
        let header = self.entities.header_checked_mut(entity)?;
        if !header.component_mask.test(id.bit()) {
            return Err(SimDbError::ComponentNotFound {
                entity_index: entity.index,
                component_type: T::type_name(),
            });
        }
        header.component_mask.clear(id.bit());
        column.remove(entity.index, version);
        Ok(())
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        let Some(id) = self.registry.id_of::<T>() else {
            return false;
        };
        self.entities
            .header(entity)
            .map_or(false, |h| h.component_mask.test(id.bit()))
    }

    pub fn get_component_ro<T: Component>(&self, entity: Entity) -> Result<&T> {
        let id = self.id_of::<T>()?;
        let header = self.entities.header(entity)?;
        if !header.component_mask.test(id.bit()) {
            return Err(SimDbError::ComponentNotFound {
                entity_index: entity.index,
                component_type: T::type_name(),
            });
        }
        typed_col::<T>(&self.columns, id)?
            .get(entity.index)
            .ok_or(SimDbError::ComponentNotFound {
                entity_index: entity.index,
                component_type: T::type_name(),
            })
    }

    /// Mutable access that stamps the chunk with the current global version,
    /// making the write visible to change detection.
    pub fn get_component_rw<T: Component>(&mut self, entity: Entity) -> Result<&mut T> {
        let version = self.global_version;
        self.get_component_rw_versioned(entity, version)
    }

    /// The indexer path: trusted mutation that must not mark anything dirty.
    pub fn get_component_rw_silent<T: Component>(&mut self, entity: Entity) -> Result<&mut T> {
        self.get_component_rw_versioned(entity, 0)
    }

    fn get_component_rw_versioned<T: Component>(
        &mut self,
        entity: Entity,
        write_version: u64,
    ) -> Result<&mut T> {
        let id = self.id_of::<T>()?;
        let header = self.entities.header(entity)?;
        if !header.component_mask.test(id.bit()) {
            return Err(SimDbError::ComponentNotFound {
                entity_index: entity.index,
                component_type: T::type_name(),
            });
        }
        typed_col_mut::<T>(&mut self.columns, id)?
            .get_mut(entity.index, write_version)
            .ok_or(SimDbError::ComponentNotFound {
                entity_index: entity.index,
                component_type: T::type_name(),
            })
    }

    /// True iff some chunk of `T`'s column was written after `since_version`.
    pub fn has_component_changed<T: Component>(&self, since_version: u64) -> bool {
        self.registry
            .id_of::<T>()
            .and_then(|id| self.columns.get(id.index()))
            .and_then(|slot| slot.as_deref())
            .map_or(false, |col| col.has_changes(since_version))
    }

    pub fn has_component_changed_by_id(&self, id: ComponentTypeId, since_version: u64) -> bool {
        self.columns
            .get(id.index())
            .and_then(|slot| slot.as_deref())
            .map_or(false, |col| col.has_changes(since_version))
    }

    /// Zero-copy chunk iteration for plain columns.
    pub fn chunk_span<T>(&self, chunk_index: usize) -> Result<Option<&[T]>>
    where
        T: Component<Storage = PlainColumn<T>> + Copy + Default,
    {
        let id = self.id_of::<T>()?;
        Ok(typed_col::<T>(&self.columns, id)?.chunk_span(chunk_index))
    }

    // -- type-erased element access (save/restore layers) -------------------

    /// Table-level erased read; the caller owns header consistency.
    pub fn get_component_raw(
        &self,
        id: ComponentTypeId,
        entity: Entity,
    ) -> Option<Box<dyn Any + Send>> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        self.columns
            .get(id.index())
            .and_then(|slot| slot.as_deref())
            .and_then(|col| col.get_raw_object(entity.index))
    }

    /// Table-level erased write; the caller owns header consistency.
    pub fn set_component_raw(
        &mut self,
        id: ComponentTypeId,
        entity: Entity,
        value: Box<dyn Any + Send>,
    ) -> Result<()> {
        let version = self.global_version;
        let column = self
            .columns
            .get_mut(id.index())
            .and_then(|slot| slot.as_deref_mut())
            .ok_or(SimDbError::UnregisteredComponent("<raw>"))?;
        column.set_raw_object(entity.index, value, version)
    }

    /// Erased column access by id, for introspection and layered tooling.
    pub fn column(&self, id: ComponentTypeId) -> Option<&dyn ColumnOps> {
        self.columns.get(id.index()).and_then(|slot| slot.as_deref())
    }

    // -- queries and views --------------------------------------------------

    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    pub fn view<'a>(&'a self, commands: &'a mut CommandBuffer) -> SimulationView<'a> {
        SimulationView::new(self, commands)
    }

    // -- events -------------------------------------------------------------

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    // -- time and versions --------------------------------------------------

    pub fn global_version(&self) -> u64 {
        self.global_version
    }

    pub fn last_sync_version(&self) -> u64 {
        self.last_sync_version
    }

    pub fn time(&self) -> GlobalTime {
        self.time_entity
            .and_then(|e| self.get_component_ro::<GlobalTime>(e).ok())
            .copied()
            .unwrap_or_default()
    }

    pub fn time_entity(&self) -> Option<Entity> {
        self.time_entity
    }

    /// Creates the clock singleton if the repository does not have one yet.
    pub fn ensure_time_singleton(&mut self) -> Result<Entity> {
        if let Some(entity) = self.time_entity {
            if self.entities.is_alive(entity) {
                return Ok(entity);
            }
        }
        let entity = self.create_entity();
        self.add_component(entity, GlobalTime::default())?;
        self.time_entity = Some(entity);
        Ok(entity)
    }

    /// Versioned write of the clock, so replicas pick it up on sync.
    pub fn set_time(&mut self, time: GlobalTime) -> Result<()> {
        let entity = self.ensure_time_singleton()?;
        self.set_component(entity, time)
    }

    /// Advances the global version and the singleton frame counter.
    pub fn tick(&mut self) {
        self.global_version += 1;
        if let Some(entity) = self.time_entity {
            if let Ok(time) = self.get_component_rw_silent::<GlobalTime>(entity) {
                time.frame_number += 1;
            }
        }
    }

    // -- bulk synchronization -----------------------------------------------

    /// Masked bulk replication from `source`.
    ///
    /// Schema is propagated first (missing destination columns are created
    /// with the source's meta), then entity headers are copied and filtered,
    /// then every included column syncs its dirty chunks, and finally the
    /// destination adopts the source's global version.
    pub fn sync_from(&mut self, source: &Repository, opts: &SyncOptions) -> Result<()> {
        if !Arc::ptr_eq(&self.registry, &source.registry) {
            return Err(SimDbError::SyncMaskMismatch(
                "repositories do not share a registry family".to_string(),
            ));
        }

        // 1. Schema propagation.
        for (index, slot) in source.columns.iter().enumerate() {
            let Some(src_col) = slot.as_deref() else {
                continue;
            };
            if !(src_col.meta().policy.snapshotable || opts.include_transient) {
                continue;
            }
            if self
                .columns
                .get(index)
                .map_or(true, |slot| slot.is_none())
            {
                if self.columns.len() <= index {
                    self.columns.resize_with(index + 1, || None);
                }
                self.columns[index] = Some(src_col.new_empty());
            }
        }

        // 2. Effective mask.
        let allowed = if opts.include_transient {
            source.registry.registered_mask()
        } else {
            source.registry.snapshotable_mask()
        };
        let effective = opts
            .mask
            .unwrap_or(BitMask256::FULL)
            .intersect(&allowed)
            .difference(&opts.exclude);

        // 3. Headers, filtered to the effective mask. A mask change poisons
        // all destination stamps so the next pass re-copies in full.
        self.entities.copy_from(&source.entities);
        self.apply_component_filter(effective);

        // 4. Dirty-chunk sync per included column.
        let since = self.last_sync_version;
        for (index, slot) in source.columns.iter().enumerate() {
            let Some(src_col) = slot.as_deref() else {
                continue;
            };
            if !effective.test(index as u8) {
                continue;
            }
            if let Some(dst_col) = self.columns.get_mut(index).and_then(|s| s.as_deref_mut()) {
                dst_col.sync_dirty_chunks(src_col, since)?;
            }
        }

        // 5. Adopt the source's version.
        self.global_version = source.global_version;
        self.last_sync_version = source.global_version;
        self.time_entity = source.time_entity;
        Ok(())
    }

    fn apply_component_filter(&mut self, effective: BitMask256) {
        if self.last_filter_mask != Some(effective) {
            for column in self.columns.iter_mut().flatten() {
                column.invalidate_versions();
            }
            self.last_filter_mask = Some(effective);
        }
        for header in self.entities.headers_mut() {
            if header.alive {
                header.component_mask = header.component_mask.intersect(&effective);
            }
        }
    }

    // -- clearing -----------------------------------------------------------

    /// Empties the repository for reuse: entities gone, chunks reset, event
    /// bus cleared, version back to 1. Registration survives.
    pub fn soft_clear(&mut self) {
        self.entities.clear();
        for column in self.columns.iter_mut().flatten() {
            column.soft_clear();
        }
        self.events.clear_all();
        self.global_version = 1;
        self.last_sync_version = 0;
        self.last_filter_mask = None;
        self.time_entity = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::column::BoxedColumn;

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    impl Component for Pos {
        type Storage = PlainColumn<Self>;
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    impl Component for Vel {
        type Storage = PlainColumn<Self>;
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Heat {
        history: Vec<f32>,
    }

    impl Component for Heat {
        type Storage = BoxedColumn<Self>;
    }

    fn world() -> Repository {
        let mut repo = Repository::new();
        repo.register_component::<Pos>().unwrap();
        repo.register_component::<Vel>().unwrap();
        repo.register_component::<Heat>().unwrap();
        repo
    }

    #[test]
    fn crud_roundtrip() {
        let mut repo = world();
        let e = repo.create_entity();
        repo.add_component(e, Pos { x: 1.0, y: 2.0 }).unwrap();
        assert!(repo.has_component::<Pos>(e));
        assert_eq!(repo.get_component_ro::<Pos>(e).unwrap().x, 1.0);

        repo.get_component_rw::<Pos>(e).unwrap().x = 5.0;
        assert_eq!(repo.get_component_ro::<Pos>(e).unwrap().x, 5.0);

        repo.remove_component::<Pos>(e).unwrap();
        assert!(!repo.has_component::<Pos>(e));
        assert!(matches!(
            repo.get_component_ro::<Pos>(e),
            Err(SimDbError::ComponentNotFound { .. })
        ));
    }

    #[test]
    fn destroyed_entity_invalidates_handle() {
        let mut repo = world();
        let e = repo.create_entity();
        repo.add_component(e, Pos::default()).unwrap();
        repo.destroy_entity(e).unwrap();
        assert!(!repo.is_alive(e));
        assert!(matches!(
            repo.get_component_ro::<Pos>(e),
            Err(SimDbError::EntityNotFound { .. })
        ));

        let e2 = repo.create_entity();
        assert_eq!(e2.index, e.index);
        assert!(!repo.has_component::<Pos>(e2));
    }

    #[test]
    fn unregistered_component_is_a_distinct_error() {
        #[derive(Clone, Copy, Default)]
        struct Stranger;
        impl Component for Stranger {
            type Storage = PlainColumn<Self>;
        }

        let mut repo = world();
        let e = repo.create_entity();
        assert!(matches!(
            repo.add_component(e, Stranger),
            Err(SimDbError::UnregisteredComponent(_))
        ));
    }

    #[test]
    fn rw_access_marks_changes_ro_does_not() {
        let mut repo = world();
        let e = repo.create_entity();
        repo.add_component(e, Pos::default()).unwrap();
        repo.tick();
        let seen = repo.global_version();

        let _ = repo.get_component_ro::<Pos>(e).unwrap();
        assert!(!repo.has_component_changed::<Pos>(seen));

        repo.tick();
        repo.get_component_rw::<Pos>(e).unwrap().x = 1.0;
        assert!(repo.has_component_changed::<Pos>(seen));
    }

    #[test]
    fn sync_replicates_and_is_idempotent() {
        let mut live = world();
        let e = live.create_entity();
        live.add_component(e, Pos { x: 3.0, y: 4.0 }).unwrap();
        live.tick();

        let mut replica = live.replica();
        replica.sync_from(&live, &SyncOptions::full()).unwrap();
        assert_eq!(
            replica.get_component_ro::<Pos>(e).unwrap(),
            &Pos { x: 3.0, y: 4.0 }
        );
        assert_eq!(replica.global_version(), live.global_version());

        // Second sync with an unchanged source leaves state identical.
        let version_before = replica.global_version();
        replica.sync_from(&live, &SyncOptions::full()).unwrap();
        assert_eq!(replica.global_version(), version_before);
        assert_eq!(
            replica.get_component_ro::<Pos>(e).unwrap(),
            &Pos { x: 3.0, y: 4.0 }
        );
    }

    #[test]
    fn transient_components_stay_home() {
        let mut live = world();
        let e = live.create_entity();
        live.add_component(e, Pos::default()).unwrap();
        live.add_component(e, Heat { history: vec![1.0] }).unwrap();

        let mut replica = live.replica();
        replica.sync_from(&live, &SyncOptions::full()).unwrap();
        assert!(replica.has_component::<Pos>(e));
        assert!(!replica.has_component::<Heat>(e));

        let mut wide = live.replica();
        let opts = SyncOptions {
            include_transient: true,
            ..SyncOptions::full()
        };
        wide.sync_from(&live, &opts).unwrap();
        assert!(wide.has_component::<Heat>(e));
    }

    #[test]
    fn mask_change_forces_full_recopy() {
        let mut live = world();
        let pos_id = live.registry().id_of::<Pos>().unwrap();
        let vel_id = live.registry().id_of::<Vel>().unwrap();
        let time_id = live.registry().id_of::<GlobalTime>().unwrap();
        let e = live.create_entity();
        live.add_component(e, Pos { x: 1.0, y: 0.0 }).unwrap();
        live.add_component(e, Vel { dx: 2.0, dy: 0.0 }).unwrap();

        let narrow = BitMask256::from_bits(&[pos_id.bit(), time_id.bit()]);
        let mut replica = live.replica();
        replica
            .sync_from(&live, &SyncOptions::masked(narrow))
            .unwrap();
        assert!(replica.has_component::<Pos>(e));
        assert!(!replica.has_component::<Vel>(e));

        // Widening the mask with an untouched source must still deliver Vel.
        let wide = narrow.with(vel_id.bit());
        replica.sync_from(&live, &SyncOptions::masked(wide)).unwrap();
        assert!(replica.has_component::<Vel>(e));
        assert_eq!(
            replica.get_component_ro::<Vel>(e).unwrap(),
            &Vel { dx: 2.0, dy: 0.0 }
        );
    }

    #[test]
    fn soft_clear_resets_everything() {
        #[derive(Debug, Clone, PartialEq)]
        struct Noise;
        impl crate::event::Event for Noise {}

        let mut repo = world();
        let e = repo.create_entity();
        repo.add_component(e, Pos::default()).unwrap();
        repo.events_mut().publish(Noise);
        repo.events_mut().swap_buffers();
        repo.tick();

        repo.soft_clear();
        assert_eq!(repo.entity_count(), 0);
        assert_eq!(repo.global_version(), 1);
        assert!(!repo.has_component_changed::<Pos>(0));
        assert!(repo.events().consume::<Noise>().is_empty());
    }

    #[test]
    fn ghost_promotion_preserves_components() {
        let mut repo = world();
        let ghost = repo.create_ghost();
        repo.add_component(ghost, Pos { x: 9.0, y: 9.0 }).unwrap();
        assert_eq!(repo.lifecycle(ghost).unwrap(), LifecycleState::Ghost);

        repo.promote_ghost(ghost).unwrap();
        assert_eq!(repo.lifecycle(ghost).unwrap(), LifecycleState::Constructing);
        assert_eq!(repo.get_component_ro::<Pos>(ghost).unwrap().x, 9.0);

        assert!(matches!(
            repo.promote_ghost(ghost),
            Err(SimDbError::InvalidState(_))
        ));
    }

    #[test]
    fn time_singleton_replicates() {
        let mut live = world();
        live.set_time(GlobalTime {
            frame_number: 7,
            delta_seconds: 0.016,
            total_seconds: 1.5,
            time_scale: 1.0,
        })
        .unwrap();

        let mut replica = live.replica();
        replica.sync_from(&live, &SyncOptions::full()).unwrap();
        assert_eq!(replica.time().frame_number, 7);
    }

    #[test]
    fn chunk_spans_expose_contiguous_slots() {
        let mut repo = world();
        for i in 0..(crate::storage::CHUNK_SLOTS + 5) {
            let e = repo.create_entity();
            repo.add_component(
                e,
                Pos {
                    x: i as f32,
                    y: 0.0,
                },
            )
            .unwrap();
        }
        let first = repo.chunk_span::<Pos>(0).unwrap().unwrap();
        assert_eq!(first.len(), crate::storage::CHUNK_SLOTS);
        assert_eq!(first[3].x, 3.0);
        assert!(repo.chunk_span::<Pos>(1).unwrap().is_some());
        assert!(repo.chunk_span::<Pos>(7).unwrap().is_none());
    }

    #[test]
    fn raw_access_roundtrip() {
        let mut repo = world();
        let e = repo.create_entity();
        repo.add_component(e, Pos { x: 1.0, y: 1.0 }).unwrap();
        let id = repo.registry().id_of::<Pos>().unwrap();

        let raw = repo.get_component_raw(id, e).unwrap();
        repo.set_component_raw(id, e, raw).unwrap();
        assert_eq!(repo.get_component_ro::<Pos>(e).unwrap().x, 1.0);
    }
}
