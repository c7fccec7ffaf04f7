//! Typed, double-buffered event streams.
//!
//! Each registered event type owns a *current* (writable) and a *read*
//! (consumable) buffer. `swap_buffers` promotes current to read, clears the
//! new current, and refreshes the set of type ids that are active this
//! cycle, so "any events of type T this frame?" is a constant-time check.

pub mod accumulator;

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// An event payload. Events are cloned into the history accumulator, so
/// `Clone` is part of the contract.
pub trait Event: Send + Sync + Clone + 'static {
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Stable numeric id of a registered event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTypeId(pub u16);

/// Assigns event type ids. Shared (`Arc`) across a repository family so a
/// flush from the live bus into a replica bus lands in the right stream.
#[derive(Default)]
pub struct EventTypeRegistry {
    ids: DashMap<TypeId, EventTypeId>,
    // Also serializes id assignment.
    names: Mutex<Vec<&'static str>>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_register<E: Event>(&self) -> EventTypeId {
        if let Some(id) = self.ids.get(&TypeId::of::<E>()) {
            return *id;
        }
        let mut names = self.names.lock();
        // Re-check under the assignment lock.
        if let Some(id) = self.ids.get(&TypeId::of::<E>()) {
            return *id;
        }
        let id = EventTypeId(names.len() as u16);
        names.push(E::type_name());
        self.ids.insert(TypeId::of::<E>(), id);
        id
    }

    pub fn id_of<E: Event>(&self) -> Option<EventTypeId> {
        self.ids.get(&TypeId::of::<E>()).map(|id| *id)
    }

    pub fn name(&self, id: EventTypeId) -> Option<&'static str> {
        self.names.lock().get(id.0 as usize).copied()
    }
}

/// A cloned batch of one type's current-buffer events, replayable into any
/// bus of the same registry family. This is what the accumulator stores.
pub trait EventBatch: Send + Sync {
    fn append_to(&self, bus: &mut EventBus);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct TypedBatch<E: Event> {
    events: Vec<E>,
}

impl<E: Event> EventBatch for TypedBatch<E> {
    fn append_to(&self, bus: &mut EventBus) {
        for event in &self.events {
            bus.publish(event.clone());
        }
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

trait EventQueueOps: Send + Sync {
    fn swap(&mut self);
    fn clear(&mut self);
    fn read_len(&self) -> usize;
    fn current_len(&self) -> usize;
    /// Clones the current buffer into a replayable batch, `None` if empty.
    fn snapshot_current(&self) -> Option<Box<dyn EventBatch>>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct EventQueue<E: Event> {
    current: Vec<E>,
    read: Vec<E>,
}

impl<E: Event> EventQueue<E> {
    fn new() -> Self {
        Self {
            current: Vec::new(),
            read: Vec::new(),
        }
    }
}

impl<E: Event> EventQueueOps for EventQueue<E> {
    fn swap(&mut self) {
        mem::swap(&mut self.current, &mut self.read);
        self.current.clear();
    }

    fn clear(&mut self) {
        self.current.clear();
        self.read.clear();
    }

    fn read_len(&self) -> usize {
        self.read.len()
    }

    fn current_len(&self) -> usize {
        self.current.len()
    }

    fn snapshot_current(&self) -> Option<Box<dyn EventBatch>> {
        if self.current.is_empty() {
            return None;
        }
        Some(Box::new(TypedBatch {
            events: self.current.clone(),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct EventBus {
    registry: Arc<EventTypeRegistry>,
    queues: Vec<Option<Box<dyn EventQueueOps>>>,
    active: HashSet<EventTypeId>,
}

impl EventBus {
    pub fn new(registry: Arc<EventTypeRegistry>) -> Self {
        Self {
            registry,
            queues: Vec::new(),
            active: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &Arc<EventTypeRegistry> {
        &self.registry
    }

    fn queue_mut<E: Event>(&mut self) -> (&mut EventQueue<E>, EventTypeId) {
        let id = self.registry.get_or_register::<E>();
        let index = id.0 as usize;
        if self.queues.len() <= index {
            self.queues.resize_with(index + 1, || None);
        }
        let slot = &mut self.queues[index];
        let queue = slot
            .get_or_insert_with(|| Box::new(EventQueue::<E>::new()) as Box<dyn EventQueueOps>)
            .as_any_mut()
            .downcast_mut::<EventQueue<E>>()
            .expect("event type id bound to a different queue type");
        (queue, id)
    }

    /// Appends to the current buffer; visible to consumers after the next
    /// buffer swap.
    pub fn publish<E: Event>(&mut self, event: E) {
        let (queue, _) = self.queue_mut::<E>();
        queue.current.push(event);
    }

    /// The read-buffer slice for this cycle. Empty for unregistered types.
    pub fn consume<E: Event>(&self) -> &[E] {
        let Some(id) = self.registry.id_of::<E>() else {
            return &[];
        };
        self.queues
            .get(id.0 as usize)
            .and_then(|slot| slot.as_ref())
            .and_then(|q| q.as_any().downcast_ref::<EventQueue<E>>())
            .map_or(&[], |q| &q.read)
    }

    /// Promotes current buffers to read buffers and refreshes the active
    /// set to exactly the ids whose read buffer is non-empty this cycle.
    pub fn swap_buffers(&mut self) {
        self.active.clear();
        for (index, slot) in self.queues.iter_mut().enumerate() {
            if let Some(queue) = slot {
                queue.swap();
                if queue.read_len() > 0 {
                    self.active.insert(EventTypeId(index as u16));
                }
            }
        }
    }

    pub fn is_active(&self, id: EventTypeId) -> bool {
        self.active.contains(&id)
    }

    pub fn any_active(&self, ids: &[EventTypeId]) -> bool {
        ids.iter().any(|id| self.active.contains(id))
    }

    pub fn active_event_ids(&self) -> &HashSet<EventTypeId> {
        &self.active
    }

    /// Clones all non-empty current buffers into replayable batches.
    pub fn snapshot_current_buffers(&self) -> Vec<Box<dyn EventBatch>> {
        self.queues
            .iter()
            .flatten()
            .filter_map(|q| q.snapshot_current())
            .collect()
    }

    /// Empties both buffers of every stream and the active set.
    pub fn clear_all(&mut self) {
        for queue in self.queues.iter_mut().flatten() {
            queue.clear();
        }
        self.active.clear();
    }
}
