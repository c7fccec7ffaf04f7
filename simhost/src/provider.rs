//! Snapshot provider strategies.
//!
//! A provider decides what world a module observes. All four strategies
//! expose the same surface: `update` once per frame at the sync point,
//! `acquire_view`/`release_view` around each dispatch.
//!
//! - `Direct` hands out the authoritative repository.
//! - `DoubleBuffer` keeps one persistent replica, bulk-synced every frame
//!   and shared read-only by all modules bound to it.
//! - `OnDemand` rents a pooled replica per acquire and filters the sync by
//!   the provider's mask.
//! - `Shared` is the convoy: the first acquire of a frame syncs one replica,
//!   every later acquire of that frame gets the identical instance, and the
//!   last release clears and repools it.
//!
//! Event continuity comes from the accumulator: on sync, every provider
//! flushes the event history its replica has not seen and swaps the replica
//! bus so the events are consumable this dispatch.

use simdb::{BitMask256, EventAccumulator, Repository, SyncOptions};

use crate::error::{HostError, Result};
use crate::pool::{ReplicaHandle, SnapshotPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Direct,
    DoubleBuffer,
    OnDemand,
    Shared,
}

/// What an acquire hands back: the live world or a replica handle.
#[derive(Clone)]
pub enum SnapshotRef {
    Live,
    Replica(ReplicaHandle),
}

pub trait SnapshotProvider: Send {
    fn kind(&self) -> ProviderKind;

    fn mask(&self) -> BitMask256;

    /// Per-frame maintenance at the phase-2 sync point; the live repository
    /// has no concurrent writers here.
    fn update(&mut self, live: &Repository, history: &EventAccumulator) -> Result<()>;

    fn acquire_view(
        &mut self,
        live: &Repository,
        history: &EventAccumulator,
    ) -> Result<SnapshotRef>;

    fn release_view(&mut self, view: SnapshotRef) -> Result<()>;
}

fn sync_replica(
    handle: &ReplicaHandle,
    live: &Repository,
    history: &EventAccumulator,
    mask: BitMask256,
    last_seen_tick: u64,
) -> Result<()> {
    let mut replica = handle.write();
    replica.sync_from(live, &SyncOptions::masked(mask))?;
    history.flush_to(replica.events_mut(), last_seen_tick);
    replica.events_mut().swap_buffers();
    Ok(())
}

// ---------------------------------------------------------------------------

/// No replication: modules observe the authoritative repository.
pub struct DirectProvider;

impl SnapshotProvider for DirectProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Direct
    }

    fn mask(&self) -> BitMask256 {
        BitMask256::FULL
    }

    fn update(&mut self, _live: &Repository, _history: &EventAccumulator) -> Result<()> {
        Ok(())
    }

    fn acquire_view(
        &mut self,
        _live: &Repository,
        _history: &EventAccumulator,
    ) -> Result<SnapshotRef> {
        Ok(SnapshotRef::Live)
    }

    fn release_view(&mut self, _view: SnapshotRef) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// Persistent double-buffered replica, bulk-synced once per frame.
pub struct DoubleBufferProvider {
    replica: ReplicaHandle,
    mask: BitMask256,
    last_seen_tick: u64,
}

impl DoubleBufferProvider {
    pub fn new(live: &Repository, mask: BitMask256) -> Self {
        Self {
            replica: std::sync::Arc::new(parking_lot::RwLock::new(live.replica())),
            mask,
            last_seen_tick: 0,
        }
    }

    pub fn replica(&self) -> &ReplicaHandle {
        &self.replica
    }
}

impl SnapshotProvider for DoubleBufferProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DoubleBuffer
    }

    fn mask(&self) -> BitMask256 {
        self.mask
    }

    fn update(&mut self, live: &Repository, history: &EventAccumulator) -> Result<()> {
        // An abandoned module may still be reading the replica; skipping one
        // sync beats stalling the whole frame behind a zombie.
        let Some(mut replica) = self.replica.try_write() else {
            log::warn!("double-buffer replica still held by a reader, skipping sync");
            return Ok(());
        };
        replica.sync_from(live, &SyncOptions::masked(self.mask))?;
        history.flush_to(replica.events_mut(), self.last_seen_tick);
        replica.events_mut().swap_buffers();
        drop(replica);
        self.last_seen_tick = live.global_version();
        Ok(())
    }

    fn acquire_view(
        &mut self,
        _live: &Repository,
        _history: &EventAccumulator,
    ) -> Result<SnapshotRef> {
        Ok(SnapshotRef::Replica(self.replica.clone()))
    }

    fn release_view(&mut self, _view: SnapshotRef) -> Result<()> {
        // The replica is persistent; nothing to return.
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// Pool-backed, mask-filtered replica acquired per dispatch.
pub struct OnDemandProvider {
    pool: SnapshotPool,
    mask: BitMask256,
    last_seen_tick: u64,
}

impl OnDemandProvider {
    pub fn new(pool: SnapshotPool, mask: BitMask256) -> Self {
        Self {
            pool,
            mask,
            last_seen_tick: 0,
        }
    }
}

impl SnapshotProvider for OnDemandProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OnDemand
    }

    fn mask(&self) -> BitMask256 {
        self.mask
    }

    fn update(&mut self, _live: &Repository, _history: &EventAccumulator) -> Result<()> {
        // Sync happens at acquire; nothing to do per frame.
        Ok(())
    }

    fn acquire_view(
        &mut self,
        live: &Repository,
        history: &EventAccumulator,
    ) -> Result<SnapshotRef> {
        let handle = self.pool.rent();
        sync_replica(&handle, live, history, self.mask, self.last_seen_tick)?;
        self.last_seen_tick = live.global_version();
        Ok(SnapshotRef::Replica(handle))
    }

    fn release_view(&mut self, view: SnapshotRef) -> Result<()> {
        match view {
            SnapshotRef::Replica(handle) => {
                repool(&self.pool, handle);
                Ok(())
            }
            SnapshotRef::Live => Err(HostError::InvalidState(
                "on-demand provider released a live view".to_string(),
            )),
        }
    }
}

/// Clears and returns a replica to the pool, unless a zombie reader still
/// holds it, in which case the handle is dropped and the pool regrows later.
fn repool(pool: &SnapshotPool, handle: ReplicaHandle) {
    let can_repool = match handle.try_write() {
        Some(mut replica) => {
            replica.soft_clear();
            drop(replica);
            true
        }
        None => {
            log::warn!("replica still held by a reader, dropping instead of repooling");
            false
        }
    };
    if can_repool {
        pool.give_back(handle);
    }
}

// ---------------------------------------------------------------------------

/// Convoy snapshot: one replica per frame, shared by every acquirer,
/// repooled when the last reader releases.
pub struct SharedProvider {
    pool: SnapshotPool,
    mask: BitMask256,
    current: Option<ReplicaHandle>,
    active_readers: usize,
    last_seen_tick: u64,
}

impl SharedProvider {
    pub fn new(pool: SnapshotPool, mask: BitMask256) -> Self {
        Self {
            pool,
            mask,
            current: None,
            active_readers: 0,
            last_seen_tick: 0,
        }
    }

    pub fn active_readers(&self) -> usize {
        self.active_readers
    }
}

impl SnapshotProvider for SharedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Shared
    }

    fn mask(&self) -> BitMask256 {
        self.mask
    }

    fn update(&mut self, _live: &Repository, _history: &EventAccumulator) -> Result<()> {
        Ok(())
    }

    fn acquire_view(
        &mut self,
        live: &Repository,
        history: &EventAccumulator,
    ) -> Result<SnapshotRef> {
        if let Some(current) = &self.current {
            self.active_readers += 1;
            return Ok(SnapshotRef::Replica(current.clone()));
        }
        let handle = self.pool.rent();
        sync_replica(&handle, live, history, self.mask, self.last_seen_tick)?;
        self.last_seen_tick = live.global_version();
        self.active_readers = 1;
        self.current = Some(handle.clone());
        Ok(SnapshotRef::Replica(handle))
    }

    fn release_view(&mut self, view: SnapshotRef) -> Result<()> {
        let SnapshotRef::Replica(handle) = view else {
            return Err(HostError::InvalidState(
                "shared provider released a live view".to_string(),
            ));
        };
        self.active_readers = self.active_readers.saturating_sub(1);
        if self.active_readers == 0 {
            // The convoy is done with this frame's snapshot.
            repool(&self.pool, handle);
            self.current = None;
        }
        Ok(())
    }
}
