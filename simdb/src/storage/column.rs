//! Per-type component columns.
//!
//! Two variants share one capability set: [`PlainColumn`] holds bit-copyable
//! values and syncs whole chunks with block copies; [`BoxedColumn`] holds
//! per-slot owning pointers and syncs by sharing or deep-cloning elements
//! depending on the type's policy.
//!
//! The repository stores columns behind the type-erased [`ColumnOps`] trait,
//! keyed by numeric component id, and downcasts to the concrete column for
//! typed access.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::component::{ComponentPolicy, ComponentTypeId, StorageKind};
use crate::error::{Result, SimDbError};
use crate::storage::chunk::{slot_of, Chunk, CHUNK_SLOTS};

/// Immutable description of a registered column, copied from the registry
/// at creation time so erased code never needs a registry lookup.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub id: ComponentTypeId,
    pub name: &'static str,
    pub policy: ComponentPolicy,
    pub kind: StorageKind,
}

/// The type-erased capability surface used by sync, save and clear paths.
pub trait ColumnOps: Send + Sync {
    fn meta(&self) -> &ColumnMeta;

    fn chunk_count(&self) -> usize;

    /// Version stamp of a chunk; 0 for chunks that were never written.
    fn chunk_version(&self, chunk_index: usize) -> u64;

    fn live_in_chunk(&self, chunk_index: usize) -> u16;

    /// Linear scan of chunk versions: true iff some chunk was written after
    /// `since_version`.
    fn has_changes(&self, since_version: u64) -> bool;

    fn max_version(&self) -> u64;

    /// Zeroes all chunk stamps so the next sync re-copies everything.
    fn invalidate_versions(&mut self);

    /// Resets the slot for `index` and stamps the chunk.
    fn clear_slot(&mut self, index: u32, version: u64);

    /// Empties all chunks (slots reset, live counts and versions zeroed)
    /// while keeping the allocation for reuse.
    fn soft_clear(&mut self);

    /// A fresh, empty column of the same concrete type and meta. Used for
    /// schema propagation into replicas.
    fn new_empty(&self) -> Box<dyn ColumnOps>;

    /// Copies every chunk whose source stamp is ahead of the destination
    /// stamp. Clean chunks are skipped. `since_version` is the caller's last
    /// synced version, used purely as a fast-path hint.
    fn sync_dirty_chunks(&mut self, source: &dyn ColumnOps, since_version: u64) -> Result<()>;

    /// Type-erased element read, used by save/restore layers.
    fn get_raw_object(&self, index: u32) -> Option<Box<dyn Any + Send>>;

    /// Type-erased element write, used by save/restore layers.
    fn set_raw_object(&mut self, index: u32, value: Box<dyn Any + Send>, version: u64)
        -> Result<()>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Typed access surface shared by both column variants. A component's
/// `Storage` associated type names the concrete column, which is what lets
/// the repository downcast from `dyn ColumnOps` without reflection.
pub trait TypedColumn<T>: ColumnOps + 'static {
    const KIND: StorageKind;

    fn default_policy() -> ComponentPolicy;

    fn new_column(meta: ColumnMeta) -> Self
    where
        Self: Sized;

    /// Writes a slot that was previously empty, raising the chunk live count.
    fn insert(&mut self, index: u32, value: T, version: u64);

    /// Overwrites an occupied slot without touching the live count.
    fn write(&mut self, index: u32, value: T, version: u64);

    /// Clears an occupied slot, lowering the chunk live count.
    fn remove(&mut self, index: u32, version: u64);

    fn get(&self, index: u32) -> Option<&T>;

    /// Mutable access. A non-zero `write_version` stamps the chunk; zero is
    /// the silent indexer path for trusted mutation not meant to mark dirty.
    fn get_mut(&mut self, index: u32, write_version: u64) -> Option<&mut T>;
}

// ---------------------------------------------------------------------------
// Plain columns
// ---------------------------------------------------------------------------

/// Raw column for bit-copyable value types. Sync is a straight slice copy.
pub struct PlainColumn<T> {
    meta: ColumnMeta,
    chunks: Vec<Chunk<T>>,
    versions_dirty: bool,
}

impl<T: Copy + Default + Send + Sync + 'static> PlainColumn<T> {
    fn ensure_chunk(&mut self, chunk_index: u32) -> &mut Chunk<T> {
        while self.chunks.len() <= chunk_index as usize {
            self.chunks.push(Chunk::new_with(T::default));
        }
        &mut self.chunks[chunk_index as usize]
    }

    /// Zero-copy view of one chunk's element buffer, the chunked iteration
    /// hot path.
    pub fn chunk_span(&self, chunk_index: usize) -> Option<&[T]> {
        self.chunks.get(chunk_index).map(|c| c.slots())
    }
}

impl<T: Copy + Default + Send + Sync + 'static> ColumnOps for PlainColumn<T> {
    fn meta(&self) -> &ColumnMeta {
        &self.meta
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn chunk_version(&self, chunk_index: usize) -> u64 {
        self.chunks.get(chunk_index).map_or(0, |c| c.version())
    }

    fn live_in_chunk(&self, chunk_index: usize) -> u16 {
        self.chunks.get(chunk_index).map_or(0, |c| c.live_count())
    }

    fn has_changes(&self, since_version: u64) -> bool {
        self.chunks.iter().any(|c| c.version() > since_version)
    }

    fn max_version(&self) -> u64 {
        self.chunks.iter().map(|c| c.version()).max().unwrap_or(0)
    }

    fn invalidate_versions(&mut self) {
        for chunk in &mut self.chunks {
            chunk.set_version(0);
        }
        self.versions_dirty = true;
    }

    fn clear_slot(&mut self, index: u32, version: u64) {
        let (chunk_index, slot) = slot_of(index);
        if let Some(chunk) = self.chunks.get_mut(chunk_index as usize) {
            chunk.slots_mut()[slot as usize] = T::default();
            chunk.remove_live();
            chunk.stamp(version);
        }
    }

    fn soft_clear(&mut self) {
        for chunk in &mut self.chunks {
            chunk.slots_mut().fill(T::default());
            chunk.set_live_count(0);
            chunk.set_version(0);
        }
        self.versions_dirty = false;
    }

    fn new_empty(&self) -> Box<dyn ColumnOps> {
        Box::new(Self {
            meta: self.meta.clone(),
            chunks: Vec::new(),
            versions_dirty: false,
        })
    }

    fn sync_dirty_chunks(&mut self, source: &dyn ColumnOps, since_version: u64) -> Result<()> {
        let src = source
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| SimDbError::SyncMaskMismatch(self.meta.name.to_string()))?;

        if !self.versions_dirty && since_version > 0 && !src.has_changes(since_version) {
            return Ok(());
        }

        for (i, schunk) in src.chunks.iter().enumerate() {
            while self.chunks.len() <= i {
                self.chunks.push(Chunk::new_with(T::default));
            }
            let dchunk = &mut self.chunks[i];
            if schunk.version() > dchunk.version() {
                dchunk.slots_mut().copy_from_slice(schunk.slots());
                dchunk.set_live_count(schunk.live_count());
                dchunk.set_version(schunk.version());
            }
        }
        self.versions_dirty = false;
        Ok(())
    }

    fn get_raw_object(&self, index: u32) -> Option<Box<dyn Any + Send>> {
        <Self as TypedColumn<T>>::get(self, index).map(|v| Box::new(*v) as Box<dyn Any + Send>)
    }

    fn set_raw_object(
        &mut self,
        index: u32,
        value: Box<dyn Any + Send>,
        version: u64,
    ) -> Result<()> {
        let value = value
            .downcast::<T>()
            .map_err(|_| SimDbError::SyncMaskMismatch(self.meta.name.to_string()))?;
        let (chunk_index, slot) = slot_of(index);
        let chunk = self.ensure_chunk(chunk_index);
        chunk.slots_mut()[slot as usize] = *value;
        chunk.stamp(version);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<T: Copy + Default + Send + Sync + 'static> TypedColumn<T> for PlainColumn<T> {
    const KIND: StorageKind = StorageKind::Plain;

    fn default_policy() -> ComponentPolicy {
        ComponentPolicy::value()
    }

    fn new_column(meta: ColumnMeta) -> Self {
        Self {
            meta,
            chunks: Vec::new(),
            versions_dirty: false,
        }
    }

    fn insert(&mut self, index: u32, value: T, version: u64) {
        let (chunk_index, slot) = slot_of(index);
        let chunk = self.ensure_chunk(chunk_index);
        chunk.slots_mut()[slot as usize] = value;
        chunk.add_live();
        chunk.stamp(version);
    }

    fn write(&mut self, index: u32, value: T, version: u64) {
        let (chunk_index, slot) = slot_of(index);
        let chunk = self.ensure_chunk(chunk_index);
        chunk.slots_mut()[slot as usize] = value;
        chunk.stamp(version);
    }

    fn remove(&mut self, index: u32, version: u64) {
        self.clear_slot(index, version);
    }

    fn get(&self, index: u32) -> Option<&T> {
        let (chunk_index, slot) = slot_of(index);
        self.chunks
            .get(chunk_index as usize)
            .map(|c| &c.slots()[slot as usize])
    }

    fn get_mut(&mut self, index: u32, write_version: u64) -> Option<&mut T> {
        let (chunk_index, slot) = slot_of(index);
        let chunk = self.chunks.get_mut(chunk_index as usize)?;
        if write_version != 0 {
            chunk.stamp(write_version);
        }
        Some(&mut chunk.slots_mut()[slot as usize])
    }
}

// ---------------------------------------------------------------------------
// Boxed columns
// ---------------------------------------------------------------------------

/// Column for non-copyable or heap-referencing types. Slots own their
/// elements through `Arc`; sync shares the pointer unless the policy asks
/// for a deep clone.
pub struct BoxedColumn<T> {
    meta: ColumnMeta,
    chunks: Vec<Chunk<Option<Arc<T>>>>,
    versions_dirty: bool,
}

impl<T: Clone + Send + Sync + 'static> BoxedColumn<T> {
    fn ensure_chunk(&mut self, chunk_index: u32) -> &mut Chunk<Option<Arc<T>>> {
        while self.chunks.len() <= chunk_index as usize {
            self.chunks.push(Chunk::new_with(|| None));
        }
        &mut self.chunks[chunk_index as usize]
    }
}

impl<T: Clone + Send + Sync + 'static> ColumnOps for BoxedColumn<T> {
    fn meta(&self) -> &ColumnMeta {
        &self.meta
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn chunk_version(&self, chunk_index: usize) -> u64 {
        self.chunks.get(chunk_index).map_or(0, |c| c.version())
    }

    fn live_in_chunk(&self, chunk_index: usize) -> u16 {
        self.chunks.get(chunk_index).map_or(0, |c| c.live_count())
    }

    fn has_changes(&self, since_version: u64) -> bool {
        self.chunks.iter().any(|c| c.version() > since_version)
    }

    fn max_version(&self) -> u64 {
        self.chunks.iter().map(|c| c.version()).max().unwrap_or(0)
    }

    fn invalidate_versions(&mut self) {
        for chunk in &mut self.chunks {
            chunk.set_version(0);
        }
        self.versions_dirty = true;
    }

    fn clear_slot(&mut self, index: u32, version: u64) {
        let (chunk_index, slot) = slot_of(index);
        if let Some(chunk) = self.chunks.get_mut(chunk_index as usize) {
            chunk.slots_mut()[slot as usize] = None;
            chunk.remove_live();
            chunk.stamp(version);
        }
    }

    fn soft_clear(&mut self) {
        for chunk in &mut self.chunks {
            chunk.slots_mut().fill(None);
            chunk.set_live_count(0);
            chunk.set_version(0);
        }
        self.versions_dirty = false;
    }

    fn new_empty(&self) -> Box<dyn ColumnOps> {
        Box::new(Self {
            meta: self.meta.clone(),
            chunks: Vec::new(),
            versions_dirty: false,
        })
    }

    fn sync_dirty_chunks(&mut self, source: &dyn ColumnOps, since_version: u64) -> Result<()> {
        let src = source
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| SimDbError::SyncMaskMismatch(self.meta.name.to_string()))?;

        if !self.versions_dirty && since_version > 0 && !src.has_changes(since_version) {
            return Ok(());
        }

        let deep = self.meta.policy.needs_clone;
        for (i, schunk) in src.chunks.iter().enumerate() {
            while self.chunks.len() <= i {
                self.chunks.push(Chunk::new_with(|| None));
            }
            let dchunk = &mut self.chunks[i];
            if schunk.version() <= dchunk.version() {
                continue;
            }

            if deep {
                // A user Clone impl may panic; contain it and surface the
                // chunk so the sync aborts with a diagnosable error.
                let cloned = panic::catch_unwind(AssertUnwindSafe(|| {
                    schunk
                        .slots()
                        .iter()
                        .map(|slot| slot.as_ref().map(|arc| Arc::new(T::clone(arc))))
                        .collect::<Vec<_>>()
                }))
                .map_err(|_| SimDbError::CloneFailed {
                    component_type: self.meta.name.to_string(),
                    chunk_index: i as u32,
                })?;
                dchunk.slots_mut().clone_from_slice(&cloned);
            } else {
                dchunk.slots_mut().clone_from_slice(schunk.slots());
            }
            dchunk.set_live_count(schunk.live_count());
            dchunk.set_version(schunk.version());
        }
        self.versions_dirty = false;
        Ok(())
    }

    fn get_raw_object(&self, index: u32) -> Option<Box<dyn Any + Send>> {
        <Self as TypedColumn<T>>::get(self, index)
            .map(|v| Box::new(v.clone()) as Box<dyn Any + Send>)
    }

    fn set_raw_object(
        &mut self,
        index: u32,
        value: Box<dyn Any + Send>,
        version: u64,
    ) -> Result<()> {
        let value = value
            .downcast::<T>()
            .map_err(|_| SimDbError::SyncMaskMismatch(self.meta.name.to_string()))?;
        let (chunk_index, slot) = slot_of(index);
        let chunk = self.ensure_chunk(chunk_index);
        chunk.slots_mut()[slot as usize] = Some(Arc::new(*value));
        chunk.stamp(version);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<T: Clone + Send + Sync + 'static> TypedColumn<T> for BoxedColumn<T> {
    const KIND: StorageKind = StorageKind::Boxed;

    fn default_policy() -> ComponentPolicy {
        ComponentPolicy::transient()
    }

    fn new_column(meta: ColumnMeta) -> Self {
        Self {
            meta,
            chunks: Vec::new(),
            versions_dirty: false,
        }
    }

    fn insert(&mut self, index: u32, value: T, version: u64) {
        let (chunk_index, slot) = slot_of(index);
        let chunk = self.ensure_chunk(chunk_index);
        chunk.slots_mut()[slot as usize] = Some(Arc::new(value));
        chunk.add_live();
        chunk.stamp(version);
    }

    fn write(&mut self, index: u32, value: T, version: u64) {
        let (chunk_index, slot) = slot_of(index);
        let chunk = self.ensure_chunk(chunk_index);
        chunk.slots_mut()[slot as usize] = Some(Arc::new(value));
        chunk.stamp(version);
    }

    fn remove(&mut self, index: u32, version: u64) {
        self.clear_slot(index, version);
    }

    fn get(&self, index: u32) -> Option<&T> {
        let (chunk_index, slot) = slot_of(index);
        self.chunks
            .get(chunk_index as usize)
            .and_then(|c| c.slots()[slot as usize].as_deref())
    }

    fn get_mut(&mut self, index: u32, write_version: u64) -> Option<&mut T> {
        let (chunk_index, slot) = slot_of(index);
        let chunk = self.chunks.get_mut(chunk_index as usize)?;
        if write_version != 0 {
            chunk.stamp(write_version);
        }
        chunk.slots_mut()[slot as usize]
            .as_mut()
            .map(Arc::make_mut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(kind: StorageKind, policy: ComponentPolicy) -> ColumnMeta {
        ColumnMeta {
            id: ComponentTypeId(0),
            name: "test",
            policy,
            kind,
        }
    }

    #[test]
    fn plain_insert_get_versions() {
        let mut col: PlainColumn<u64> =
            PlainColumn::new_column(meta(StorageKind::Plain, ComponentPolicy::value()));
        col.insert(3, 42, 7);
        assert_eq!(col.get(3), Some(&42));
        assert_eq!(col.chunk_version(0), 7);
        assert_eq!(col.live_in_chunk(0), 1);
        assert!(col.has_changes(6));
        assert!(!col.has_changes(7));
    }

    #[test]
    fn silent_write_path_leaves_version_alone() {
        let mut col: PlainColumn<u64> =
            PlainColumn::new_column(meta(StorageKind::Plain, ComponentPolicy::value()));
        col.insert(0, 1, 2);
        *col.get_mut(0, 0).unwrap() = 99;
        assert_eq!(col.chunk_version(0), 2);
        *col.get_mut(0, 5).unwrap() = 100;
        assert_eq!(col.chunk_version(0), 5);
    }

    #[test]
    fn plain_sync_copies_only_dirty_chunks() {
        let policy = ComponentPolicy::value();
        let mut src: PlainColumn<u64> = PlainColumn::new_column(meta(StorageKind::Plain, policy));
        let mut dst: PlainColumn<u64> = PlainColumn::new_column(meta(StorageKind::Plain, policy));

        src.insert(0, 10, 3);
        src.insert(CHUNK_SLOTS as u32, 20, 3);
        dst.sync_dirty_chunks(&src, 0).unwrap();
        assert_eq!(dst.get(0), Some(&10));
        assert_eq!(dst.get(CHUNK_SLOTS as u32), Some(&20));

        // Touch only chunk 1; chunk 0 must be skipped (stamp unchanged).
        src.write(CHUNK_SLOTS as u32, 21, 4);
        dst.sync_dirty_chunks(&src, 3).unwrap();
        assert_eq!(dst.get(CHUNK_SLOTS as u32), Some(&21));
        assert_eq!(dst.chunk_version(0), 3);
        assert_eq!(dst.chunk_version(1), 4);
    }

    #[test]
    fn invalidated_destination_recopies_despite_clean_source() {
        let policy = ComponentPolicy::value();
        let mut src: PlainColumn<u64> = PlainColumn::new_column(meta(StorageKind::Plain, policy));
        let mut dst: PlainColumn<u64> = PlainColumn::new_column(meta(StorageKind::Plain, policy));

        src.insert(1, 5, 2);
        dst.sync_dirty_chunks(&src, 0).unwrap();
        *dst.get_mut(1, 0).unwrap() = 0;

        dst.invalidate_versions();
        dst.sync_dirty_chunks(&src, 2).unwrap();
        assert_eq!(dst.get(1), Some(&5));
    }

    #[test]
    fn boxed_shallow_sync_shares_elements() {
        let policy = ComponentPolicy::transient().with_snapshotable(true);
        let mut src: BoxedColumn<String> = BoxedColumn::new_column(meta(StorageKind::Boxed, policy));
        let mut dst: BoxedColumn<String> = BoxedColumn::new_column(meta(StorageKind::Boxed, policy));

        src.insert(0, "hello".to_string(), 1);
        dst.sync_dirty_chunks(&src, 0).unwrap();
        assert_eq!(dst.get(0).map(String::as_str), Some("hello"));

        let (c, s) = slot_of(0);
        let shared = Arc::ptr_eq(
            src.chunks[c as usize].slots()[s as usize].as_ref().unwrap(),
            dst.chunks[c as usize].slots()[s as usize].as_ref().unwrap(),
        );
        assert!(shared);
    }

    #[test]
    fn boxed_deep_sync_clones_elements() {
        let policy = ComponentPolicy::snapshot_via_clone();
        let mut src: BoxedColumn<String> = BoxedColumn::new_column(meta(StorageKind::Boxed, policy));
        let mut dst: BoxedColumn<String> = BoxedColumn::new_column(meta(StorageKind::Boxed, policy));

        src.insert(0, "hello".to_string(), 1);
        dst.sync_dirty_chunks(&src, 0).unwrap();

        let (c, s) = slot_of(0);
        let shared = Arc::ptr_eq(
            src.chunks[c as usize].slots()[s as usize].as_ref().unwrap(),
            dst.chunks[c as usize].slots()[s as usize].as_ref().unwrap(),
        );
        assert!(!shared);
        assert_eq!(dst.get(0).map(String::as_str), Some("hello"));
    }

    #[test]
    fn deep_clone_panic_surfaces_chunk() {
        #[derive(Default)]
        struct Exploding;

        impl Clone for Exploding {
            fn clone(&self) -> Self {
                panic!("clone refused");
            }
        }

        let policy = ComponentPolicy::snapshot_via_clone();
        let mut src: BoxedColumn<Exploding> =
            BoxedColumn::new_column(meta(StorageKind::Boxed, policy));
        let mut dst: BoxedColumn<Exploding> =
            BoxedColumn::new_column(meta(StorageKind::Boxed, policy));

        src.insert(0, Exploding, 1);
        let err = dst.sync_dirty_chunks(&src, 0).unwrap_err();
        match err {
            SimDbError::CloneFailed { chunk_index, .. } => assert_eq!(chunk_index, 0),
            other => panic!("unexpected error: {other}"),
        }
    }
}
