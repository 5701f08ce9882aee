//! Surface Pool — bounded set of decode surfaces with blocking acquire,
//! a mapped-surface budget, and epoch-tagged recycling.
//!
//! All pool state lives behind one mutex with one condition variable. Every
//! operation that frees a resource (surface release, unmap, export release,
//! reconfiguration, flushing) broadcasts on the condition variable, and every
//! waiter re-checks its own predicate in a loop, so waiters for different
//! resources can share the same condition.
//!
//! ## Epochs
//!
//! Reconfiguration bumps the pool epoch and rebuilds the free list. Surfaces
//! acquired in an earlier epoch are discarded when they come back instead of
//! being re-listed, so a stale index can never alias a new one.
//!
//! ## Budget
//!
//! At most `budget` surfaces are mapped (or exported) at once. `map` blocks
//! while the budget is exhausted; `set_flushing(true)` aborts every blocked
//! call with `Cancelled`. A call that would not have to wait succeeds even
//! while flushing.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use nvd_common::{
    Cancelled, DecodeError, DecoderCreateInfo, DeviceError, DeviceMapping, DevicePtr,
    FrameGeometry, MapError, PictureParams,
};

use crate::context::DecoderContext;
use crate::driver::DecodeDriver;
use crate::export::OutputMemoryCache;
use crate::surface::Surface;

/// Lifecycle of one slot within the current epoch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    InFlight,
    Mapped,
    Exported,
}

/// Sizing of a new pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    /// Number of surfaces handed out by `acquire`.
    pub pool_size: u32,
    /// Pair each surface with a decode-only slot at `index + pool_size`.
    pub alloc_aux_frame: bool,
}

/// Snapshot of pool state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Surfaces in the current epoch.
    pub total: u32,
    /// Surfaces on the free list.
    pub free: u32,
    /// Acquired and not mapped.
    pub in_flight: u32,
    /// Mapped surfaces counted against the budget (exports included).
    pub mapped: u32,
    /// Surfaces of the current epoch held by a live export.
    pub exported: u32,
    /// Maximum number of surfaces mapped at once.
    pub budget: u32,
    /// Bumped by every in-place reconfiguration.
    pub epoch: u64,
    /// Whether blocking waits are being cancelled.
    pub flushing: bool,
    /// Device pointers with an entry in the export cache.
    pub cached_exports: usize,
}

pub(crate) struct PoolState {
    pub(crate) slots: Vec<SlotState>,
    pub(crate) free: BTreeSet<u32>,
    pub(crate) mapped: u32,
    pub(crate) budget: u32,
    /// Smaller budget waiting for mapped surfaces to drain below it.
    pub(crate) pending_budget: Option<u32>,
    pub(crate) epoch: u64,
    pub(crate) flushing: bool,
    pub(crate) alloc_aux: bool,
    pub(crate) info: DecoderCreateInfo,
    pub(crate) geometry: FrameGeometry,
    pub(crate) cache: OutputMemoryCache,
}

impl PoolState {
    pub(crate) fn pool_size(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Reset every slot to free for a new `pool_size`.
    pub(crate) fn rebuild_slots(&mut self, pool_size: u32) {
        self.slots = vec![SlotState::Free; pool_size as usize];
        self.free = (0..pool_size).collect();
    }

    /// Update a slot's state if `epoch` is still current.
    pub(crate) fn set_slot(&mut self, index: u32, epoch: u64, state: SlotState) {
        if epoch == self.epoch {
            if let Some(slot) = self.slots.get_mut(index as usize) {
                *slot = state;
            }
        }
    }

    /// Put a surface back on the free list, or discard it if its epoch is stale.
    pub(crate) fn return_surface(&mut self, index: u32, epoch: u64) {
        if epoch != self.epoch || index >= self.pool_size() {
            debug!(index, epoch, current = self.epoch, "Discarding stale surface");
            return;
        }
        self.slots[index as usize] = SlotState::Free;
        self.free.insert(index);
        trace!(index, free = self.free.len(), "Surface released");
    }

    /// Apply a new budget without dropping below what is mapped right now.
    /// The rest of a shrink lands as mapped surfaces drain.
    pub(crate) fn set_budget(&mut self, budget: u32) {
        if budget >= self.mapped {
            self.budget = budget;
            self.pending_budget = None;
        } else {
            self.budget = self.mapped;
            self.pending_budget = Some(budget);
        }
    }

    fn shrink_pending_budget(&mut self) {
        if let Some(target) = self.pending_budget {
            self.budget = target.max(self.mapped);
            if self.mapped <= target {
                self.pending_budget = None;
            }
        }
    }

    fn count(&self, state: SlotState) -> u32 {
        self.slots.iter().filter(|s| **s == state).count() as u32
    }
}

/// State shared by the pool handle, every outstanding surface, and every
/// exported memory object. Keeps the decode driver (and its context) alive
/// until the last of them is gone.
pub(crate) struct PoolShared {
    pub(crate) driver: DecodeDriver,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) cond: Condvar,
}

impl PoolShared {
    /// Unmap `ptr` and give its budget slot back. Never fails; driver errors
    /// are logged.
    pub(crate) fn unmap_locked(&self, state: &mut PoolState, ptr: DevicePtr) {
        if let Err(status) = self.driver.unmap(ptr) {
            warn!(%ptr, %status, "Unmap failed");
        }
        state.mapped = state.mapped.saturating_sub(1);
        state.shrink_pending_budget();
    }

    /// Return path for a dropped [`Surface`].
    pub(crate) fn release_surface(&self, index: u32, epoch: u64, mapping: Option<DeviceMapping>) {
        let mut state = self.state.lock();
        if let Some(mapping) = mapping {
            debug!(index, ptr = %mapping.ptr, "Unmapping surface on release");
            self.unmap_locked(&mut state, mapping.ptr);
        }
        state.return_surface(index, epoch);
        self.cond.notify_all();
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug!(
            epoch = state.epoch,
            cached_exports = state.cache.len(),
            "Surface pool torn down"
        );
        state.cache.clear();
    }
}

/// Cloneable handle to a surface pool.
#[derive(Clone)]
pub struct SurfacePool {
    pub(crate) shared: Arc<PoolShared>,
}

impl std::fmt::Debug for SurfacePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfacePool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl SurfacePool {
    /// Create the hardware decoder described by `info` and a pool of
    /// `options.pool_size` surfaces over it. The map budget starts at
    /// `info.num_output_surfaces`.
    pub fn new(
        context: Arc<DecoderContext>,
        info: DecoderCreateInfo,
        options: PoolOptions,
    ) -> Result<Self, DeviceError> {
        if options.pool_size == 0 {
            return Err(DeviceError::InvalidConfig("pool size must be > 0".into()));
        }
        let needed = if options.alloc_aux_frame {
            options.pool_size * 2
        } else {
            options.pool_size
        };
        if info.num_decode_surfaces < needed {
            return Err(DeviceError::InvalidConfig(format!(
                "{} decode surfaces cannot back {} pool surfaces (aux: {})",
                info.num_decode_surfaces, options.pool_size, options.alloc_aux_frame
            )));
        }

        let driver = DecodeDriver::create(context, &info)?;
        let budget = info.num_output_surfaces.max(1);
        let geometry = FrameGeometry::new(info.format, info.display, info.target.height);

        let mut state = PoolState {
            slots: Vec::new(),
            free: BTreeSet::new(),
            mapped: 0,
            budget,
            pending_budget: None,
            epoch: 0,
            flushing: false,
            alloc_aux: options.alloc_aux_frame,
            info,
            geometry,
            cache: OutputMemoryCache::default(),
        };
        state.rebuild_slots(options.pool_size);

        info!(
            pool_size = options.pool_size,
            budget,
            aux = options.alloc_aux_frame,
            "Surface pool created"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                driver,
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
        })
    }

    /// Take the lowest-indexed free surface, blocking until one is free.
    ///
    /// Returns `Cancelled` only if it would have to wait while flushing.
    pub fn acquire(&self) -> Result<Surface, Cancelled> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(index) = state.free.pop_first() {
                let epoch = state.epoch;
                state.slots[index as usize] = SlotState::InFlight;
                let aux_slot = state.alloc_aux.then(|| index + state.pool_size());
                trace!(index, epoch, free = state.free.len(), "Surface acquired");
                return Ok(Surface::new(index, aux_slot, epoch, Arc::clone(&self.shared)));
            }
            if state.flushing {
                debug!("Acquire cancelled by flush");
                return Err(Cancelled);
            }
            debug!(total = state.pool_size(), "Waiting for a free surface");
            self.shared.cond.wait(&mut state);
        }
    }

    /// Return a surface to the pool. Equivalent to dropping it.
    pub fn release(&self, surface: Surface) {
        debug_assert!(Arc::ptr_eq(surface.pool(), &self.shared));
        drop(surface);
    }

    /// Submit `surface`'s picture to the hardware decoder.
    pub fn decode(&self, surface: &Surface, params: &PictureParams) -> Result<(), DecodeError> {
        self.shared
            .driver
            .decode(surface.index(), surface.decode_slot(), params)
    }

    /// Map a decoded surface for output, blocking while the budget is exhausted.
    pub fn map(&self, surface: &mut Surface) -> Result<DeviceMapping, MapError> {
        if surface.is_mapped() {
            return Err(MapError::AlreadyMapped {
                index: surface.index(),
            });
        }

        let mut state = self.shared.state.lock();
        while state.mapped >= state.budget {
            if state.flushing {
                debug!(index = surface.index(), "Map cancelled by flush");
                return Err(MapError::Cancelled);
            }
            debug!(
                index = surface.index(),
                mapped = state.mapped,
                budget = state.budget,
                "Waiting for an output surface"
            );
            self.shared.cond.wait(&mut state);
        }

        let (ptr, pitch) = self
            .shared
            .driver
            .map(surface.decode_slot())
            .map_err(|status| MapError::MapFailed {
                index: surface.index(),
                status,
            })?;

        state.mapped += 1;
        state.set_slot(surface.index(), surface.epoch(), SlotState::Mapped);
        let mapping = DeviceMapping {
            ptr,
            pitch,
            len: state.geometry.device_len(pitch),
        };
        surface.set_mapping(mapping);
        trace!(
            index = surface.index(),
            %ptr,
            pitch,
            mapped = state.mapped,
            "Surface mapped"
        );
        Ok(mapping)
    }

    /// Undo `map`. A surface that is not mapped is left alone.
    pub fn unmap(&self, surface: &mut Surface) {
        let Some(mapping) = surface.take_mapping() else {
            warn!(index = surface.index(), "Unmap of a surface that is not mapped");
            return;
        };
        let mut state = self.shared.state.lock();
        self.shared.unmap_locked(&mut state, mapping.ptr);
        state.set_slot(surface.index(), surface.epoch(), SlotState::InFlight);
        trace!(index = surface.index(), mapped = state.mapped, "Surface unmapped");
        self.shared.cond.notify_all();
    }

    /// Enter or leave flushing. Entering wakes every blocked waiter, which
    /// then returns `Cancelled`.
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.shared.state.lock();
        if state.flushing != flushing {
            info!(flushing, "Surface pool flushing changed");
        }
        state.flushing = flushing;
        if flushing {
            self.shared.cond.notify_all();
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.state.lock().flushing
    }

    /// Output slots that can still be mapped without waiting.
    pub fn num_free_output_slots(&self) -> u32 {
        let state = self.shared.state.lock();
        state.budget.saturating_sub(state.mapped)
    }

    pub fn budget(&self) -> u32 {
        self.shared.state.lock().budget
    }

    pub fn epoch(&self) -> u64 {
        self.shared.state.lock().epoch
    }

    pub fn pool_size(&self) -> u32 {
        self.shared.state.lock().pool_size()
    }

    pub fn allocates_aux_frames(&self) -> bool {
        self.shared.state.lock().alloc_aux
    }

    /// Decoder parameters currently in effect.
    pub fn create_info(&self) -> DecoderCreateInfo {
        self.shared.state.lock().info.clone()
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.shared.state.lock().geometry
    }

    pub(crate) fn driver(&self) -> &DecodeDriver {
        &self.shared.driver
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            total: state.pool_size(),
            free: state.free.len() as u32,
            in_flight: state.count(SlotState::InFlight),
            mapped: state.mapped,
            exported: state.count(SlotState::Exported),
            budget: state.budget,
            epoch: state.epoch,
            flushing: state.flushing,
            cached_exports: state.cache.len(),
        }
    }
}

// ── Tests ──
