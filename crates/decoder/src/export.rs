//! Zero-copy export of mapped surfaces.
//!
//! [`SurfacePool::export`] hands a mapped surface to a consumer as an
//! [`ExportedMemory`]: a cheaply cloneable, reference-counted view of the
//! mapped device memory. When the last clone is dropped the release callback
//! runs exactly once under the pool lock: it unmaps the surface, gives the
//! budget slot back, returns the surface to the pool (or discards it if its
//! epoch is stale), and wakes every waiter.
//!
//! The [`OutputMemoryCache`] remembers every device pointer that was ever
//! exported, so a pointer the hardware hands out again reuses its entry.
//! Entries carry the epoch of the surface that created them and are only
//! reused by surfaces of that epoch.
//! At most one live export exists per pointer; exporting a pointer whose
//! entry is still live blocks until it is released.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use nvd_common::{DeviceMapping, DevicePtr, FrameGeometry, MapError};

use crate::pool::{PoolShared, SlotState, SurfacePool};
use crate::surface::Surface;

// ---------------------------------------------------------------------------
// Output memory cache
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct CacheEntry {
    id: u64,
    epoch: u64,
    live: bool,
    exports: u64,
}

/// Result of looking up a pointer for a surface of a given epoch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CacheLookup {
    Vacant,
    /// Entry from a different epoch, not live.
    Stale,
    /// Entry from the same epoch, ready for reuse.
    Idle,
    /// An export of this pointer is still referenced.
    Live,
}

/// A claimed cache entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct CacheClaim {
    pub(crate) id: u64,
    pub(crate) reused: bool,
}

/// Export bookkeeping keyed by device pointer. Lives under the pool lock.
#[derive(Debug, Default)]
pub(crate) struct OutputMemoryCache {
    entries: HashMap<DevicePtr, CacheEntry>,
    next_id: u64,
}

impl OutputMemoryCache {
    pub(crate) fn lookup(&self, ptr: DevicePtr, epoch: u64) -> CacheLookup {
        match self.entries.get(&ptr) {
            None => CacheLookup::Vacant,
            Some(e) if e.live => CacheLookup::Live,
            Some(e) if e.epoch != epoch => CacheLookup::Stale,
            Some(_) => CacheLookup::Idle,
        }
    }

    /// Mark `ptr` live, creating its entry if needed. Caller has checked it
    /// is not live already.
    pub(crate) fn claim(&mut self, ptr: DevicePtr, epoch: u64) -> CacheClaim {
        if let Some(entry) = self.entries.get_mut(&ptr) {
            entry.live = true;
            entry.exports += 1;
            return CacheClaim {
                id: entry.id,
                reused: true,
            };
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            ptr,
            CacheEntry {
                id,
                epoch,
                live: true,
                exports: 1,
            },
        );
        CacheClaim { id, reused: false }
    }

    /// The export of `ptr` was dropped.
    pub(crate) fn release(&mut self, ptr: DevicePtr) {
        if let Some(entry) = self.entries.get_mut(&ptr) {
            entry.live = false;
        }
    }

    pub(crate) fn remove(&mut self, ptr: DevicePtr) {
        self.entries.remove(&ptr);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.live).count()
    }

    /// How many times `ptr` has been exported.
    pub(crate) fn export_count(&self, ptr: DevicePtr) -> u64 {
        self.entries.get(&ptr).map_or(0, |e| e.exports)
    }
}

// ---------------------------------------------------------------------------
// Exported memory
// ---------------------------------------------------------------------------

struct ExportInner {
    mapping: DeviceMapping,
    geometry: FrameGeometry,
    surface_index: u32,
    epoch: u64,
    claim: CacheClaim,
    pool: Arc<PoolShared>,
}

impl Drop for ExportInner {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        self.pool.unmap_locked(&mut state, self.mapping.ptr);
        if self.epoch == state.epoch {
            state.cache.release(self.mapping.ptr);
        } else {
            state.cache.remove(self.mapping.ptr);
        }
        state.return_surface(self.surface_index, self.epoch);
        debug!(
            index = self.surface_index,
            ptr = %self.mapping.ptr,
            mapped = state.mapped,
            "Exported memory released"
        );
        self.pool.cond.notify_all();
    }
}

/// Reference-counted view of an exported surface's device memory.
///
/// Clones share the same mapping; the surface goes back to its pool when the
/// last clone is dropped. The decode driver stays alive as long as any clone
/// exists.
#[derive(Clone)]
pub struct ExportedMemory {
    inner: Arc<ExportInner>,
}

impl std::fmt::Debug for ExportedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedMemory")
            .field("ptr", &self.inner.mapping.ptr)
            .field("pitch", &self.inner.mapping.pitch)
            .field("surface_index", &self.inner.surface_index)
            .field("epoch", &self.inner.epoch)
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl ExportedMemory {
    pub fn ptr(&self) -> DevicePtr {
        self.inner.mapping.ptr
    }

    pub fn pitch(&self) -> u32 {
        self.inner.mapping.pitch
    }

    pub fn len(&self) -> usize {
        self.inner.mapping.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.mapping.len == 0
    }

    pub fn mapping(&self) -> DeviceMapping {
        self.inner.mapping
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.inner.geometry
    }

    /// Device address of `plane`.
    pub fn plane_ptr(&self, plane: u32) -> DevicePtr {
        self.ptr()
            .offset(self.inner.geometry.device_plane_offset(plane, self.pitch()))
    }

    pub fn surface_index(&self) -> u32 {
        self.inner.surface_index
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    /// Identifier of the cache entry backing this export.
    pub fn cache_id(&self) -> u64 {
        self.inner.claim.id
    }

    /// True if the cache entry was created by an earlier export of the same pointer.
    pub fn is_reused(&self) -> bool {
        self.inner.claim.reused
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl SurfacePool {
    /// Export a mapped surface as zero-copy memory.
    ///
    /// Blocks while another live export holds the same device pointer. On any
    /// error the surface is unmapped and returned to the pool.
    pub fn export(&self, surface: Surface) -> Result<ExportedMemory, MapError> {
        let Some(mapping) = surface.mapping() else {
            return Err(MapError::NotMapped {
                index: surface.index(),
            });
        };
        let ptr = mapping.ptr;

        let epoch = surface.epoch();
        let mut state = self.shared.state.lock();
        let claim = loop {
            match state.cache.lookup(ptr, epoch) {
                CacheLookup::Live => {
                    if state.flushing {
                        debug!(index = surface.index(), %ptr, "Export cancelled by flush");
                        drop(state);
                        return Err(MapError::Cancelled);
                    }
                    debug!(index = surface.index(), %ptr, "Waiting for previous export of pointer");
                    self.shared.cond.wait(&mut state);
                }
                CacheLookup::Stale => {
                    debug!(%ptr, "Dropping stale export cache entry");
                    state.cache.remove(ptr);
                }
                CacheLookup::Idle | CacheLookup::Vacant => break state.cache.claim(ptr, epoch),
            }
        };

        state.set_slot(surface.index(), surface.epoch(), SlotState::Exported);
        let geometry = state.geometry;
        trace!(
            index = surface.index(),
            %ptr,
            reused = claim.reused,
            live = state.cache.live_count(),
            "Surface exported"
        );
        drop(state);

        let detached = surface.detach();
        Ok(ExportedMemory {
            inner: Arc::new(ExportInner {
                mapping,
                geometry,
                surface_index: detached.index,
                epoch: detached.epoch,
                claim,
                pool: detached.pool,
            }),
        })
    }

    /// Times `ptr` has been exported from this pool.
    pub fn export_count(&self, ptr: DevicePtr) -> u64 {
        self.shared.state.lock().cache.export_count(ptr)
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crossbeam::channel::{unbounded, RecvTimeoutError};

    use crate::emulated::{EmulatedDevice, OutputSlotPolicy};
    use crate::pool::tests::pool_on;
    use crate::reconfigure::ReconfigureRequest;

    // ── Cache ──

    #[test]
    fn cache_lifecycle() {
        let mut cache = OutputMemoryCache::default();
        let p = DevicePtr(0x1000);
        assert_eq!(cache.lookup(p, 0), CacheLookup::Vacant);

        let first = cache.claim(p, 0);
        assert!(!first.reused);
        assert_eq!(cache.lookup(p, 0), CacheLookup::Live);

        cache.release(p);
        assert_eq!(cache.lookup(p, 0), CacheLookup::Idle);
        assert_eq!(cache.lookup(p, 1), CacheLookup::Stale);

        let second = cache.claim(p, 0);
        assert!(second.reused);
        assert_eq!(second.id, first.id);
        assert_eq!(cache.export_count(p), 2);
        assert_eq!(cache.live_count(), 1);
    }

    // ── Export ──

    #[test]
    fn export_holds_budget_until_last_clone_drops() {
        let device = Arc::new(EmulatedDevice::new());
        let pool = pool_on(&device, 4, 2);
        let mut s = pool.acquire().unwrap();
        pool.map(&mut s).unwrap();
        let mem = pool.export(s).unwrap();
        let clone = mem.clone();
        assert_eq!(mem.ref_count(), 2);

        let stats = pool.stats();
        assert_eq!((stats.mapped, stats.exported, stats.free), (1, 1, 3));

        drop(mem);
        assert_eq!(pool.stats().mapped, 1);
        drop(clone);
        let stats = pool.stats();
        assert_eq!((stats.mapped, stats.exported, stats.free), (0, 0, 4));
        assert_eq!(device.counters().mapped_now, 0);
    }

    #[test]
    fn export_of_unmapped_surface_releases_it() {
        let pool = pool_on(&Arc::new(EmulatedDevice::new()), 2, 2);
        let s = pool.acquire().unwrap();
        assert_eq!(pool.export(s).unwrap_err(), MapError::NotMapped { index: 0 });
        assert_eq!(pool.stats().free, 2);
    }

    #[test]
    fn reexport_of_same_pointer_reuses_entry() {
        let device = Arc::new(EmulatedDevice::new());
        let pool = pool_on(&device, 2, 2);

        let mut s = pool.acquire().unwrap();
        pool.map(&mut s).unwrap();
        let first = pool.export(s).unwrap();
        let ptr = first.ptr();
        let id = first.cache_id();
        drop(first);

        let mut s = pool.acquire().unwrap();
        pool.map(&mut s).unwrap();
        let second = pool.export(s).unwrap();
        assert_eq!(second.ptr(), ptr);
        assert!(second.is_reused());
        assert_eq!(second.cache_id(), id);
        assert_eq!(pool.export_count(ptr), 2);
    }

    #[test]
    fn stale_surface_export_is_not_reused_by_new_epoch() {
        let device = Arc::new(EmulatedDevice::new());
        let pool = pool_on(&device, 2, 2);
        let mut stale = pool.acquire().unwrap();

        let req = ReconfigureRequest {
            format: nvd_common::PixelFormat::Nv12,
            bit_depth: 8,
            coded: nvd_common::Resolution::new(64, 64),
            display: nvd_common::Resolution::new(64, 64),
            target: nvd_common::Resolution::new(64, 64),
            pool_size: 2,
            num_decode_surfaces: 2,
            budget: None,
        };
        assert!(pool.reconfigure(&req));

        pool.map(&mut stale).unwrap();
        let old = pool.export(stale).unwrap();
        assert_eq!((old.epoch(), pool.epoch()), (0, 1));
        let ptr = old.ptr();
        drop(old);
        assert_eq!(pool.stats().cached_exports, 0);

        let mut fresh = pool.acquire().unwrap();
        pool.map(&mut fresh).unwrap();
        let mem = pool.export(fresh).unwrap();
        assert_eq!(mem.ptr(), ptr);
        assert_eq!(mem.epoch(), 1);
        assert!(!mem.is_reused());
    }

    #[test]
    fn entries_from_before_reconfigure_are_recreated() {
        let device = Arc::new(EmulatedDevice::new());
        let pool = pool_on(&device, 2, 2);

        let mut s = pool.acquire().unwrap();
        pool.map(&mut s).unwrap();
        let first = pool.export(s).unwrap();
        let id = first.cache_id();
        drop(first);

        let req = ReconfigureRequest {
            format: nvd_common::PixelFormat::Nv12,
            bit_depth: 8,
            coded: nvd_common::Resolution::new(64, 64),
            display: nvd_common::Resolution::new(64, 64),
            target: nvd_common::Resolution::new(64, 64),
            pool_size: 2,
            num_decode_surfaces: 2,
            budget: None,
        };
        assert!(pool.reconfigure(&req));

        let mut s = pool.acquire().unwrap();
        pool.map(&mut s).unwrap();
        let second = pool.export(s).unwrap();
        assert!(!second.is_reused());
        assert_ne!(second.cache_id(), id);
    }

    #[test]
    fn export_waits_while_pointer_is_live() {
        let device = Arc::new(EmulatedDevice::new().with_output_policy(OutputSlotPolicy::RoundRobin));
        let pool = pool_on(&device, 4, 2);

        // Two output slots: the third map recycles the first slot's pointer.
        let mut a = pool.acquire().unwrap();
        pool.map(&mut a).unwrap();
        let held = pool.export(a).unwrap();

        let mut b = pool.acquire().unwrap();
        pool.map(&mut b).unwrap();
        pool.unmap(&mut b);
        let mut c = pool.acquire().unwrap();
        let c_mapping = pool.map(&mut c).unwrap();
        assert_eq!(c_mapping.ptr, held.ptr());

        let (tx, rx) = unbounded();
        let p = pool.clone();
        let exporter = std::thread::spawn(move || {
            tx.send(p.export(c).map(|m| m.ptr())).unwrap();
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Timeout)
        );

        let ptr = held.ptr();
        drop(held);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(ptr));
        exporter.join().unwrap();
        drop(b);
    }

    #[test]
    fn flush_cancels_export_wait_and_releases_surface() {
        let device = Arc::new(EmulatedDevice::new().with_output_policy(OutputSlotPolicy::RoundRobin));
        let pool = pool_on(&device, 4, 2);

        let mut a = pool.acquire().unwrap();
        pool.map(&mut a).unwrap();
        let held = pool.export(a).unwrap();
        let mut b = pool.acquire().unwrap();
        pool.map(&mut b).unwrap();
        pool.unmap(&mut b);
        drop(b);
        let mut c = pool.acquire().unwrap();
        pool.map(&mut c).unwrap();

        let (tx, rx) = unbounded();
        let p = pool.clone();
        let exporter = std::thread::spawn(move || {
            tx.send(p.export(c).map(|m| m.ptr())).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        pool.set_flushing(true);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(MapError::Cancelled)
        );
        exporter.join().unwrap();

        // Only the held export still counts against the budget.
        assert_eq!(pool.stats().mapped, 1);
        drop(held);
        assert_eq!(pool.stats().mapped, 0);
        assert_eq!(pool.stats().free, 4);
    }

    #[test]
    fn export_outlives_pool_handle() {
        let device = Arc::new(EmulatedDevice::new());
        let pool = pool_on(&device, 2, 2);
        let mut s = pool.acquire().unwrap();
        pool.map(&mut s).unwrap();
        let mem = pool.export(s).unwrap();
        drop(pool);
        assert_eq!(device.counters().live_decoders, 1);
        drop(mem);
        assert_eq!(device.counters().live_decoders, 0);
        assert_eq!(device.counters().mapped_now, 0);
    }
}
