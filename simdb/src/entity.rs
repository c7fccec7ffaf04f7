//! Entity handles, per-slot headers, and the index that allocates them.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimDbError};
use crate::mask::BitMask256;
use crate::storage::chunk::slot_of;

/// A generational entity handle. Valid only while the index is alive and
/// the generations match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    pub index: u32,
    pub generation: u32,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Where an entity sits in its construction/destruction protocol.
///
/// `Ghost` is a pre-construction placeholder used by the network path for
/// entities a peer referenced before the local node spawned them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    Constructing,
    #[default]
    Active,
    Destructing,
    Ghost,
}

/// Per-slot record, one per entity index.
#[derive(Debug, Clone, Default)]
pub struct EntityHeader {
    pub alive: bool,
    pub generation: u32,
    pub component_mask: BitMask256,
    pub lifecycle: LifecycleState,
    pub chunk_index: u32,
    pub slot_in_chunk: u16,
}

/// Allocates entity handles and owns the header table.
///
/// Freed indices park on a freelist with their generation already bumped,
/// so a recycled handle can never alias a destroyed one.
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    headers: Vec<EntityHeader>,
    freelist: Vec<u32>,
    live_count: usize,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, lifecycle: LifecycleState) -> Entity {
        let index = match self.freelist.pop() {
            Some(index) => index,
            None => {
                let index = self.headers.len() as u32;
                self.headers.push(EntityHeader::default());
                index
            }
        };
        let (chunk_index, slot_in_chunk) = slot_of(index);
        let header = &mut self.headers[index as usize];
        header.alive = true;
        header.component_mask = BitMask256::EMPTY;
        header.lifecycle = lifecycle;
        header.chunk_index = chunk_index;
        header.slot_in_chunk = slot_in_chunk;
        self.live_count += 1;
        Entity {
            index,
            generation: header.generation,
        }
    }

    pub fn release(&mut self, entity: Entity) -> Result<()> {
        let header = self.header_checked_mut(entity)?;
        header.alive = false;
        header.component_mask = BitMask256::EMPTY;
        header.generation = header.generation.wrapping_add(1);
        self.freelist.push(entity.index);
        self.live_count -= 1;
        Ok(())
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.headers
            .get(entity.index as usize)
            .map_or(false, |h| h.alive && h.generation == entity.generation)
    }

    pub fn header(&self, entity: Entity) -> Result<&EntityHeader> {
        self.headers
            .get(entity.index as usize)
            .filter(|h| h.alive && h.generation == entity.generation)
            .ok_or(SimDbError::EntityNotFound {
                index: entity.index,
                generation: entity.generation,
            })
    }

    pub fn header_checked_mut(&mut self, entity: Entity) -> Result<&mut EntityHeader> {
        self.headers
            .get_mut(entity.index as usize)
            .filter(|h| h.alive && h.generation == entity.generation)
            .ok_or(SimDbError::EntityNotFound {
                index: entity.index,
                generation: entity.generation,
            })
    }

    pub fn header_at(&self, index: u32) -> Option<&EntityHeader> {
        self.headers.get(index as usize)
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn capacity(&self) -> usize {
        self.headers.len()
    }

    /// Iterates live headers with their indices.
    pub fn iter_live(&self) -> impl Iterator<Item = (u32, &EntityHeader)> {
        self.headers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.alive)
            .map(|(i, h)| (i as u32, h))
    }

    pub fn headers_mut(&mut self) -> &mut [EntityHeader] {
        &mut self.headers
    }

    /// Replaces this index with a copy of `source`, reusing allocations.
    pub fn copy_from(&mut self, source: &EntityIndex) {
        self.headers.clone_from(&source.headers);
        self.freelist.clone_from(&source.freelist);
        self.live_count = source.live_count;
    }

    pub fn clear(&mut self) {
        self.headers.clear();
        self.freelist.clear();
        self.live_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_index_gets_new_generation() {
        let mut index = EntityIndex::new();
        let a = index.allocate(LifecycleState::Active);
        index.release(a).unwrap();
        assert!(!index.is_alive(a));

        let b = index.allocate(LifecycleState::Active);
        assert_eq!(b.index, a.index);
        assert_ne!(b.generation, a.generation);
        assert!(index.is_alive(b));
        assert!(!index.is_alive(a));
    }

    #[test]
    fn stale_handle_is_entity_not_found() {
        let mut index = EntityIndex::new();
        let a = index.allocate(LifecycleState::Active);
        index.release(a).unwrap();
        assert!(matches!(
            index.header(a),
            Err(SimDbError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn slot_address_recorded_in_header() {
        let mut index = EntityIndex::new();
        for _ in 0..1025 {
            index.allocate(LifecycleState::Active);
        }
        let header = index.header_at(1024).unwrap();
        assert_eq!(header.chunk_index, 1);
        assert_eq!(header.slot_in_chunk, 0);
    }
}
