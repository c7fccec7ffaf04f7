//! Fluent entity queries over header masks.
//!
//! Queries never touch component data; they filter the header table by
//! required/forbidden mask bits and lifecycle state, yielding live handles.

use crate::component::Component;
use crate::entity::{Entity, LifecycleState};
use crate::mask::BitMask256;
use crate::repository::Repository;

/// Which lifecycle states a query admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleFilter {
    /// Everything alive, placeholders included.
    Any,
    /// Only fully active entities.
    #[default]
    Active,
    /// Exactly one state.
    Only(LifecycleState),
}

pub struct QueryBuilder<'a> {
    repo: &'a Repository,
    required: BitMask256,
    forbidden: BitMask256,
    lifecycle: LifecycleFilter,
    // Set when a required type was never registered: nothing can match.
    impossible: bool,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            required: BitMask256::EMPTY,
            forbidden: BitMask256::EMPTY,
            lifecycle: LifecycleFilter::default(),
            impossible: false,
        }
    }

    /// Requires entities to carry `T`.
    pub fn with<T: Component>(mut self) -> Self {
        match self.repo.registry().id_of::<T>() {
            Some(id) => self.required.set(id.bit()),
            None => self.impossible = true,
        }
        self
    }

    /// Excludes entities carrying `T`. An unregistered type excludes nothing.
    pub fn without<T: Component>(mut self) -> Self {
        if let Some(id) = self.repo.registry().id_of::<T>() {
            self.forbidden.set(id.bit());
        }
        self
    }

    pub fn lifecycle(mut self, filter: LifecycleFilter) -> Self {
        self.lifecycle = filter;
        self
    }

    /// Shorthand for a mask of required ids assembled elsewhere.
    pub fn with_mask(mut self, mask: BitMask256) -> Self {
        self.required = self.required.union(&mask);
        self
    }

    pub fn iter(self) -> impl Iterator<Item = Entity> + 'a {
        let QueryBuilder {
            repo,
            required,
            forbidden,
            lifecycle,
            impossible,
        } = self;
        repo.entity_index()
            .iter_live()
            .filter(move |(_, header)| {
                if impossible {
                    return false;
                }
                let state_ok = match lifecycle {
                    LifecycleFilter::Any => true,
                    LifecycleFilter::Active => header.lifecycle == LifecycleState::Active,
                    LifecycleFilter::Only(state) => header.lifecycle == state,
                };
                state_ok
                    && required.is_subset_of(&header.component_mask)
                    && header.component_mask.intersect(&forbidden).is_empty()
            })
            .map(|(index, header)| Entity {
                index,
                generation: header.generation,
            })
    }

    pub fn count(self) -> usize {
        self.iter().count()
    }

    pub fn entities(self) -> Vec<Entity> {
        self.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::storage::column::PlainColumn;

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Body(u32);

    impl Component for Body {
        type Storage = PlainColumn<Self>;
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Frozen;

    impl Component for Frozen {
        type Storage = PlainColumn<Self>;
    }

    fn world() -> (Repository, Entity, Entity, Entity) {
        let mut repo = Repository::new();
        repo.register_component::<Body>().unwrap();
        repo.register_component::<Frozen>().unwrap();

        let plain = repo.create_entity();
        repo.add_component(plain, Body(1)).unwrap();

        let frozen = repo.create_entity();
        repo.add_component(frozen, Body(2)).unwrap();
        repo.add_component(frozen, Frozen).unwrap();

        let ghost = repo.create_ghost();
        repo.add_component(ghost, Body(3)).unwrap();

        (repo, plain, frozen, ghost)
    }

    #[test]
    fn required_and_forbidden_masks_compose() {
        let (repo, plain, frozen, _) = world();
        let found = repo.query().with::<Body>().without::<Frozen>().entities();
        assert_eq!(found, vec![plain]);

        let both = repo.query().with::<Body>().with::<Frozen>().entities();
        assert_eq!(both, vec![frozen]);
    }

    #[test]
    fn lifecycle_filter_defaults_to_active() {
        let (repo, _, _, ghost) = world();
        assert_eq!(repo.query().with::<Body>().count(), 2);
        assert_eq!(
            repo.query()
                .with::<Body>()
                .lifecycle(LifecycleFilter::Only(LifecycleState::Ghost))
                .entities(),
            vec![ghost]
        );
        assert_eq!(
            repo.query()
                .with::<Body>()
                .lifecycle(LifecycleFilter::Any)
                .count(),
            3
        );
    }

    #[test]
    fn unregistered_required_type_matches_nothing() {
        #[derive(Debug, Clone, Copy, Default)]
        struct Stranger;
        impl Component for Stranger {
            type Storage = PlainColumn<Self>;
        }

        let (repo, _, _, _) = world();
        assert_eq!(repo.query().with::<Stranger>().count(), 0);
        // An unregistered forbidden type excludes nothing.
        assert_eq!(repo.query().with::<Body>().without::<Stranger>().count(), 2);
    }
}
