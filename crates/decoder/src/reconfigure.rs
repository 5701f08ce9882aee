//! Reconfiguration Controller — resize the stream in place when possible.
//!
//! An in-place reconfiguration keeps the hardware decoder and the pool but
//! starts a new epoch: every surface is put back on the free list, surfaces
//! still held from the old epoch are discarded when they come back, and
//! cached exports from the old epoch are dropped on their next reuse.

use tracing::{debug, info, warn};

use nvd_common::{FrameGeometry, PixelFormat, ReconfigureInfo, Resolution};

use crate::pool::SurfacePool;

/// New stream parameters for an in-place reconfiguration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconfigureRequest {
    pub format: PixelFormat,
    pub bit_depth: u32,
    pub coded: Resolution,
    pub display: Resolution,
    pub target: Resolution,
    /// Surfaces handed out by `acquire` in the new epoch.
    pub pool_size: u32,
    /// Hardware decode surfaces for the new epoch.
    pub num_decode_surfaces: u32,
    /// Replacement map budget, clamped to the decoder's output surfaces.
    pub budget: Option<u32>,
}

impl SurfacePool {
    /// Whether `req` fits the limits the decoder was created with.
    pub fn can_reconfigure(&self, req: &ReconfigureRequest) -> bool {
        if !self.driver().supports_reconfigure() {
            return false;
        }
        let state = self.shared.state.lock();
        fits(&state.info, state.alloc_aux, req)
    }

    /// Reconfigure in place. Returns false (pool untouched) when the request
    /// exceeds the created limits or the hardware refuses; the caller then
    /// recreates the pool.
    pub fn reconfigure(&self, req: &ReconfigureRequest) -> bool {
        if !self.driver().supports_reconfigure() {
            debug!("Decoder does not support in-place reconfiguration");
            return false;
        }

        let mut state = self.shared.state.lock();
        if !fits(&state.info, state.alloc_aux, req) {
            debug!(
                coded = %req.coded,
                max = %state.info.max,
                format = ?req.format,
                "Reconfiguration exceeds created limits"
            );
            return false;
        }

        let info = ReconfigureInfo {
            coded: req.coded,
            display: req.display,
            target: req.target,
            num_decode_surfaces: req.num_decode_surfaces,
        };
        if let Err(status) = self.driver().reconfigure(&info) {
            warn!(%status, "Hardware reconfiguration failed");
            return false;
        }

        state.epoch += 1;
        state.rebuild_slots(req.pool_size);
        state.info.coded = req.coded;
        state.info.display = req.display;
        state.info.target = req.target;
        state.info.num_decode_surfaces = req.num_decode_surfaces;
        state.geometry = FrameGeometry::new(req.format, req.display, req.target.height);
        if let Some(budget) = req.budget {
            let budget = budget.clamp(1, state.info.num_output_surfaces.max(1));
            state.set_budget(budget);
        }

        info!(
            epoch = state.epoch,
            coded = %req.coded,
            display = %req.display,
            pool_size = req.pool_size,
            budget = state.budget,
            "Surface pool reconfigured"
        );
        self.shared.cond.notify_all();
        true
    }
}

fn fits(info: &nvd_common::DecoderCreateInfo, alloc_aux: bool, req: &ReconfigureRequest) -> bool {
    let needed = if alloc_aux {
        req.pool_size * 2
    } else {
        req.pool_size
    };
    req.pool_size > 0
        && req.num_decode_surfaces >= needed
        && req.format == info.format
        && req.bit_depth == info.bit_depth
        && req.coded.fits_within(info.max)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam::channel::unbounded;

    use crate::emulated::EmulatedDevice;
    use crate::pool::tests::pool_on;

    fn request(coded: Resolution, pool_size: u32) -> ReconfigureRequest {
        ReconfigureRequest {
            format: PixelFormat::Nv12,
            bit_depth: 8,
            coded,
            display: coded,
            target: coded.round_up_even(),
            pool_size,
            num_decode_surfaces: pool_size,
            budget: None,
        }
    }

    #[test]
    fn in_place_bumps_epoch_and_discards_stale() {
        let device = Arc::new(EmulatedDevice::new());
        let pool = pool_on(&device, 4, 2);
        let old = pool.acquire().unwrap();
        assert_eq!(old.epoch(), 0);

        assert!(pool.reconfigure(&request(Resolution::new(96, 96), 3)));
        let stats = pool.stats();
        assert_eq!((stats.epoch, stats.total, stats.free), (1, 3, 3));

        drop(old);
        assert_eq!(pool.stats().free, 3);

        let fresh = pool.acquire().unwrap();
        assert_eq!((fresh.index(), fresh.epoch()), (0, 1));
        assert_eq!(device.counters().reconfigure_calls, 1);
        assert_eq!(pool.geometry().display, Resolution::new(96, 96));
    }

    #[test]
    fn stale_mapped_surface_still_unmaps() {
        let device = Arc::new(EmulatedDevice::new());
        let pool = pool_on(&device, 4, 2);
        let mut old = pool.acquire().unwrap();
        pool.map(&mut old).unwrap();

        assert!(pool.reconfigure(&request(Resolution::new(64, 64), 4)));
        assert_eq!(pool.stats().mapped, 1);
        drop(old);
        assert_eq!(pool.stats().mapped, 0);
        assert_eq!(pool.stats().free, 4);
        assert_eq!(device.counters().mapped_now, 0);
    }

    #[test]
    fn rejects_requests_beyond_limits() {
        let device = Arc::new(EmulatedDevice::new());
        let pool = pool_on(&device, 4, 2);

        assert!(!pool.can_reconfigure(&request(Resolution::new(256, 64), 4)));
        assert!(!pool.reconfigure(&request(Resolution::new(256, 64), 4)));

        let mut wrong_depth = request(Resolution::new(64, 64), 4);
        wrong_depth.bit_depth = 10;
        assert!(!pool.reconfigure(&wrong_depth));

        let mut too_many = request(Resolution::new(64, 64), 4);
        too_many.num_decode_surfaces = 2;
        assert!(!pool.reconfigure(&too_many));

        assert_eq!(pool.epoch(), 0);
        assert_eq!(device.counters().reconfigure_calls, 0);
    }

    #[test]
    fn unsupported_device_never_reconfigures() {
        let device = Arc::new(EmulatedDevice::new().with_reconfigure(false));
        let pool = pool_on(&device, 4, 2);
        assert!(!pool.can_reconfigure(&request(Resolution::new(64, 64), 4)));
        assert!(!pool.reconfigure(&request(Resolution::new(64, 64), 4)));
    }

    #[test]
    fn budget_is_recomputed_and_clamped() {
        let pool = pool_on(&Arc::new(EmulatedDevice::new()), 4, 2);
        let mut req = request(Resolution::new(64, 64), 4);
        req.budget = Some(1);
        assert!(pool.reconfigure(&req));
        assert_eq!(pool.budget(), 1);

        req.budget = Some(10);
        assert!(pool.reconfigure(&req));
        assert_eq!(pool.budget(), 2);
    }

    #[test]
    fn budget_shrink_waits_for_mapped_surfaces() {
        let pool = pool_on(&Arc::new(EmulatedDevice::new()), 4, 2);
        let mut a = pool.acquire().unwrap();
        let mut b = pool.acquire().unwrap();
        pool.map(&mut a).unwrap();
        pool.map(&mut b).unwrap();

        let mut req = request(Resolution::new(64, 64), 4);
        req.budget = Some(1);
        assert!(pool.reconfigure(&req));
        let stats = pool.stats();
        assert!(stats.mapped <= stats.budget);
        assert_eq!((stats.mapped, stats.budget), (2, 2));
        assert_eq!(pool.num_free_output_slots(), 0);

        pool.unmap(&mut a);
        let stats = pool.stats();
        assert_eq!((stats.mapped, stats.budget), (1, 1));

        drop(b);
        let mut c = pool.acquire().unwrap();
        pool.map(&mut c).unwrap();
        let stats = pool.stats();
        assert_eq!((stats.mapped, stats.budget), (1, 1));
        assert_eq!(pool.num_free_output_slots(), 0);
    }

    #[test]
    fn reconfigure_wakes_blocked_acquire() {
        let pool = pool_on(&Arc::new(EmulatedDevice::new()), 1, 1);
        let held = pool.acquire().unwrap();

        let (tx, rx) = unbounded();
        let p = pool.clone();
        let waiter = std::thread::spawn(move || {
            tx.send(p.acquire().map(|s| (s.index(), s.epoch()))).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        assert!(pool.reconfigure(&request(Resolution::new(64, 64), 1)));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok((0, 1)));
        waiter.join().unwrap();

        drop(held);
        assert_eq!(pool.stats().free, 1);
    }
}
