//! Surface — exclusive handle to one decode slot of a [`SurfacePool`].
//!
//! A surface is handed out by `acquire` and returns to its pool when dropped
//! (or passed to `release`). If it is still mapped at that point the mapping
//! is undone first, so the mapped-surface budget can never leak.
//!
//! [`SurfacePool`]: crate::pool::SurfacePool

use std::sync::Arc;

use nvd_common::DeviceMapping;

use crate::pool::PoolShared;

pub struct Surface {
    index: u32,
    aux_slot: Option<u32>,
    epoch: u64,
    mapping: Option<DeviceMapping>,
    pool: Arc<PoolShared>,
    /// Set once ownership moved elsewhere (export); suppresses the return on drop.
    detached: bool,
}

/// The parts of a surface that outlive it once exported.
pub(crate) struct DetachedSurface {
    pub(crate) index: u32,
    pub(crate) epoch: u64,
    pub(crate) pool: Arc<PoolShared>,
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("index", &self.index)
            .field("aux_slot", &self.aux_slot)
            .field("epoch", &self.epoch)
            .field("mapping", &self.mapping)
            .finish()
    }
}

impl Surface {
    pub(crate) fn new(index: u32, aux_slot: Option<u32>, epoch: u64, pool: Arc<PoolShared>) -> Self {
        Self {
            index,
            aux_slot,
            epoch,
            mapping: None,
            pool,
            detached: false,
        }
    }

    /// Index within the pool (stable while the epoch lasts).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Hardware decode slot of the output picture.
    pub fn decode_slot(&self) -> u32 {
        self.index
    }

    /// Decode-only companion slot, when the pool allocates aux frames.
    pub fn aux_slot(&self) -> Option<u32> {
        self.aux_slot
    }

    /// Pool epoch this surface was acquired in.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn mapping(&self) -> Option<DeviceMapping> {
        self.mapping
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub(crate) fn pool(&self) -> &Arc<PoolShared> {
        &self.pool
    }

    pub(crate) fn set_mapping(&mut self, mapping: DeviceMapping) {
        self.mapping = Some(mapping);
    }

    pub(crate) fn take_mapping(&mut self) -> Option<DeviceMapping> {
        self.mapping.take()
    }

    /// Give up the handle without returning the surface to its pool. The
    /// mapping, if any, now belongs to the caller.
    pub(crate) fn detach(mut self) -> DetachedSurface {
        self.detached = true;
        DetachedSurface {
            index: self.index,
            epoch: self.epoch,
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if !self.detached {
            self.pool
                .release_surface(self.index, self.epoch, self.mapping.take());
        }
    }
}
