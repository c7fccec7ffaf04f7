//! Reusable replica pool.
//!
//! A thread-safe stack of repository replicas. Renting from an empty pool is
//! a soft condition: the pool manufactures a fresh replica and logs it.
//! Callers soft-clear a replica before returning it, so everything on the
//! stack is empty and ready.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use simdb::Repository;

/// Shared handle to a pooled replica. Readers take the read lock for the
/// duration of a module tick; sync and soft-clear take the write lock.
pub type ReplicaHandle = Arc<RwLock<Repository>>;

type ReplicaFactory = Box<dyn Fn() -> Repository + Send + Sync>;

pub struct SnapshotPool {
    replicas: Mutex<Vec<ReplicaHandle>>,
    factory: ReplicaFactory,
}

impl SnapshotPool {
    pub fn new(factory: impl Fn() -> Repository + Send + Sync + 'static) -> Self {
        Self {
            replicas: Mutex::new(Vec::new()),
            factory: Box::new(factory),
        }
    }

    /// Pre-creates `count` replicas, running `setup` on each (schema
    /// registration, warm allocations) before they hit the stack.
    pub fn warmup(&self, count: usize, mut setup: impl FnMut(&mut Repository)) {
        let mut fresh = Vec::with_capacity(count);
        for _ in 0..count {
            let mut replica = (self.factory)();
            setup(&mut replica);
            fresh.push(Arc::new(RwLock::new(replica)));
        }
        self.replicas.lock().extend(fresh);
    }

    pub fn rent(&self) -> ReplicaHandle {
        if let Some(handle) = self.replicas.lock().pop() {
            return handle;
        }
        // Soft exhaustion: grow instead of failing.
        log::debug!("snapshot pool exhausted, creating a replica on demand");
        Arc::new(RwLock::new((self.factory)()))
    }

    pub fn give_back(&self, handle: ReplicaHandle) {
        self.replicas.lock().push(handle);
    }

    pub fn available(&self) -> usize {
        self.replicas.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_prefills_the_stack() {
        let pool = SnapshotPool::new(Repository::new);
        pool.warmup(3, |_| {});
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn empty_pool_grows_on_demand() {
        let pool = SnapshotPool::new(Repository::new);
        assert_eq!(pool.available(), 0);
        let handle = pool.rent();
        pool.give_back(handle);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn released_replicas_come_back_cleared() {
        let pool = SnapshotPool::new(Repository::new);
        pool.warmup(1, |_| {});

        let handle = pool.rent();
        {
            let mut replica = handle.write();
            replica.create_entity();
            assert_eq!(replica.entity_count(), 1);
            replica.soft_clear();
        }
        pool.give_back(handle);

        let again = pool.rent();
        assert_eq!(again.read().entity_count(), 0);
        assert_eq!(again.read().global_version(), 1);
    }
}
