//! Component type registry: stable id assignment and per-type policy.
//!
//! A registry instance is owned by a repository family. The live repository
//! and every replica synced from it share one `Arc`, which is what keeps
//! numeric ids and mask bits meaning the same thing on both sides of a
//! `sync_from`. There is no process-global registry; tests that need
//! isolation create fresh repositories.

use std::any::TypeId;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::component::{Component, ComponentPolicy, ComponentTypeId, StorageKind};
use crate::error::{Result, SimDbError};
use crate::mask::BitMask256;
use crate::storage::column::TypedColumn;

/// What the registry records about one component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub id: ComponentTypeId,
    pub name: &'static str,
    pub policy: ComponentPolicy,
    pub kind: StorageKind,
}

#[derive(Default)]
pub struct ComponentRegistry {
    by_type: DashMap<TypeId, ComponentTypeId>,
    // Indexed by id. The write lock also serializes id assignment.
    infos: RwLock<Vec<ComponentInfo>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T`, assigning the next free id. Re-registering the same
    /// type returns the existing id; policy flags are immutable after the
    /// first registration, so a conflicting policy is rejected.
    pub fn register<T: Component>(&self, policy: Option<ComponentPolicy>) -> Result<ComponentTypeId> {
        let requested =
            policy.or_else(T::policy).unwrap_or_else(<T::Storage as TypedColumn<T>>::default_policy);
        let mut infos = self.infos.write();

        if let Some(existing) = self.by_type.get(&TypeId::of::<T>()) {
            let id = *existing;
            if infos[id.index()].policy != requested {
                return Err(SimDbError::PolicyViolation(format!(
                    "policy for {} is immutable after registration",
                    T::type_name()
                )));
            }
            return Ok(id);
        }

        if infos.len() >= 256 {
            return Err(SimDbError::TypeSpaceExhausted);
        }
        let id = ComponentTypeId(infos.len() as u8);
        infos.push(ComponentInfo {
            id,
            name: T::type_name(),
            policy: requested,
            kind: <T::Storage as TypedColumn<T>>::KIND,
        });
        self.by_type.insert(TypeId::of::<T>(), id);
        Ok(id)
    }

    pub fn id_of<T: Component>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).map(|id| *id)
    }

    pub fn info(&self, id: ComponentTypeId) -> Option<ComponentInfo> {
        self.infos.read().get(id.index()).cloned()
    }

    pub fn len(&self) -> usize {
        self.infos.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mask of all ids whose policy marks them snapshotable.
    pub fn snapshotable_mask(&self) -> BitMask256 {
        let infos = self.infos.read();
        let mut mask = BitMask256::EMPTY;
        for info in infos.iter() {
            if info.policy.snapshotable {
                mask.set(info.id.bit());
            }
        }
        mask
    }

    /// Mask with every registered id set.
    pub fn registered_mask(&self) -> BitMask256 {
        let infos = self.infos.read();
        let mut mask = BitMask256::EMPTY;
        for info in infos.iter() {
            mask.set(info.id.bit());
        }
        mask
    }

    pub fn infos(&self) -> Vec<ComponentInfo> {
        self.infos.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::column::{BoxedColumn, PlainColumn};

    #[derive(Clone, Copy, Default)]
    struct Pos(#[allow(dead_code)] f32);

    impl Component for Pos {
        type Storage = PlainColumn<Self>;
    }

    #[derive(Clone)]
    struct Scratch(#[allow(dead_code)] String);

    impl Component for Scratch {
        type Storage = BoxedColumn<Self>;
    }

    #[test]
    fn ids_are_stable_and_sequential() {
        let registry = ComponentRegistry::new();
        let a = registry.register::<Pos>(None).unwrap();
        let b = registry.register::<Scratch>(None).unwrap();
        assert_eq!(a, ComponentTypeId(0));
        assert_eq!(b, ComponentTypeId(1));
        assert_eq!(registry.register::<Pos>(None).unwrap(), a);
    }

    #[test]
    fn storage_kind_defaults_drive_policy() {
        let registry = ComponentRegistry::new();
        let pod = registry.register::<Pos>(None).unwrap();
        let boxed = registry.register::<Scratch>(None).unwrap();
        assert!(registry.info(pod).unwrap().policy.snapshotable);
        assert!(!registry.info(boxed).unwrap().policy.snapshotable);
    }

    #[test]
    fn policy_is_immutable_after_registration() {
        let registry = ComponentRegistry::new();
        registry.register::<Scratch>(None).unwrap();
        let err = registry
            .register::<Scratch>(Some(ComponentPolicy::snapshot_via_clone()))
            .unwrap_err();
        assert!(matches!(err, SimDbError::PolicyViolation(_)));
    }

    #[test]
    fn snapshotable_mask_tracks_policy() {
        let registry = ComponentRegistry::new();
        let pod = registry.register::<Pos>(None).unwrap();
        registry.register::<Scratch>(None).unwrap();
        let mask = registry.snapshotable_mask();
        assert!(mask.test(pod.bit()));
        assert_eq!(mask.count(), 1);
    }
}
