//! Cross-module pool behavior: the blocking scenarios, concurrent stress,
//! reconfiguration under load, and flush wakeups.
//!
//! Everything runs on the emulated device, so these tests need no GPU.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, RecvTimeoutError};

use nvd_common::{
    Cancelled, DecoderCreateInfo, MapError, PictureParams, PixelFormat, Resolution, VideoCodec,
};
use nvd_decoder::{
    DecoderContext, EmulatedDevice, OutputSlotPolicy, PoolOptions, ReconfigureRequest, SurfacePool,
};

const BLOCKED: Duration = Duration::from_millis(50);
const WAKE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn create_info(pool_size: u32, budget: u32) -> DecoderCreateInfo {
    DecoderCreateInfo {
        codec: VideoCodec::H265,
        format: PixelFormat::Nv12,
        bit_depth: 8,
        coded: Resolution::new(128, 64),
        display: Resolution::new(128, 64),
        target: Resolution::new(128, 64),
        max: Resolution::new(256, 128),
        num_decode_surfaces: pool_size,
        num_output_surfaces: budget,
    }
}

fn make_pool(device: EmulatedDevice, pool_size: u32, budget: u32) -> (Arc<EmulatedDevice>, SurfacePool) {
    let device = Arc::new(device);
    let ctx = DecoderContext::create(device.clone(), 0).expect("context");
    let pool = SurfacePool::new(
        ctx,
        create_info(pool_size, budget),
        PoolOptions {
            pool_size,
            alloc_aux_frame: false,
        },
    )
    .expect("pool");
    (device, pool)
}

fn picture(tag: u8) -> PictureParams {
    PictureParams {
        bitstream: vec![tag],
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Blocking scenario
// ---------------------------------------------------------------------------

#[test]
fn pool_of_four_with_budget_of_two() {
    let (_device, pool) = make_pool(EmulatedDevice::new(), 4, 2);

    let mut held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
    let indices: Vec<u32> = held.iter().map(|s| s.index()).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    // A fifth acquire blocks...
    let (tx, rx) = unbounded();
    let p = pool.clone();
    let fifth = thread::spawn(move || {
        let s = p.acquire().unwrap();
        tx.send(s.index()).unwrap();
        s
    });
    assert_eq!(rx.recv_timeout(BLOCKED), Err(RecvTimeoutError::Timeout));

    // ...until index 1 is released, which it then receives.
    let one = held.remove(1);
    pool.release(one);
    assert_eq!(rx.recv_timeout(WAKE).unwrap(), 1);
    let fifth_surface = fifth.join().unwrap();

    // Mapping 0 and 2 succeeds; a third map blocks until one is unmapped.
    let mut s0 = held.remove(0);
    let mut s2 = held.remove(0);
    assert_eq!((s0.index(), s2.index()), (0, 2));
    pool.decode(&s0, &picture(10)).unwrap();
    pool.decode(&s2, &picture(20)).unwrap();
    pool.map(&mut s0).unwrap();
    pool.map(&mut s2).unwrap();

    let mut s3 = held.remove(0);
    let (tx, rx) = unbounded();
    let p = pool.clone();
    let third = thread::spawn(move || {
        let r = p.map(&mut s3).map(|m| m.pitch);
        tx.send(r.is_ok()).unwrap();
        s3
    });
    assert_eq!(rx.recv_timeout(BLOCKED), Err(RecvTimeoutError::Timeout));
    pool.unmap(&mut s2);
    assert!(rx.recv_timeout(WAKE).unwrap());

    let s3 = third.join().unwrap();
    let stats = pool.stats();
    assert_eq!(stats.mapped, 2);
    assert_eq!(stats.budget, 2);
    drop((s0, s2, s3, fifth_surface));
    assert_eq!(pool.stats().free, 4);
    assert_eq!(pool.stats().mapped, 0);
}

// ---------------------------------------------------------------------------
// Stress
// ---------------------------------------------------------------------------

#[test]
fn concurrent_frame_loops_respect_pool_and_budget() {
    const POOL: u32 = 6;
    const BUDGET: u32 = 3;
    const WORKERS: usize = 8;
    const FRAMES: usize = 200;

    let (device, pool) = make_pool(EmulatedDevice::new(), POOL, BUDGET);
    let outstanding = Arc::new(AtomicU32::new(0));
    let max_outstanding = Arc::new(AtomicU32::new(0));
    let live: Arc<parking_lot::Mutex<HashSet<u32>>> = Arc::default();
    let (tx, rx) = unbounded();

    let workers: Vec<_> = (0..WORKERS)
        .map(|w| {
            let pool = pool.clone();
            let outstanding = outstanding.clone();
            let max_outstanding = max_outstanding.clone();
            let live = live.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                for frame in 0..FRAMES {
                    let mut surface = pool.acquire().unwrap();
                    assert!(live.lock().insert(surface.index()), "index handed out twice");
                    let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                    max_outstanding.fetch_max(now, Ordering::SeqCst);

                    pool.decode(&surface, &picture((w * FRAMES + frame) as u8)).unwrap();
                    pool.map(&mut surface).unwrap();
                    assert!(pool.stats().mapped <= BUDGET);

                    if frame % 2 == 0 {
                        live.lock().remove(&surface.index());
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                        let mem = pool.export(surface).unwrap();
                        thread::yield_now();
                        drop(mem);
                    } else {
                        pool.unmap(&mut surface);
                        live.lock().remove(&surface.index());
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                        pool.release(surface);
                    }
                }
                tx.send(w).unwrap();
            })
        })
        .collect();
    drop(tx);

    let mut done = 0;
    while done < WORKERS {
        rx.recv_timeout(Duration::from_secs(30)).expect("worker stalled");
        done += 1;
    }
    for w in workers {
        w.join().unwrap();
    }

    assert!(max_outstanding.load(Ordering::SeqCst) <= POOL);
    let stats = pool.stats();
    assert_eq!((stats.free, stats.mapped, stats.exported), (POOL, 0, 0));
    let counters = device.counters();
    assert_eq!(counters.mapped_now, 0);
    assert_eq!(counters.map_calls, (WORKERS * FRAMES) as u64);
    assert_eq!(counters.unmap_calls, (WORKERS * FRAMES) as u64);
}

#[test]
fn producers_and_consumers_hand_off_surfaces() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 3;
    const PER_PRODUCER: usize = 150;

    let (_device, pool) = make_pool(EmulatedDevice::new(), 4, 2);
    let (work_tx, work_rx) = unbounded();
    let (done_tx, done_rx) = unbounded();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let pool = pool.clone();
            let work_tx = work_tx.clone();
            thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    let surface = pool.acquire().unwrap();
                    work_tx.send(surface).unwrap();
                }
            })
        })
        .collect();
    drop(work_tx);

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let pool = pool.clone();
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                for mut surface in work_rx.iter() {
                    pool.map(&mut surface).unwrap();
                    pool.unmap(&mut surface);
                    pool.release(surface);
                    done_tx.send(()).unwrap();
                }
            })
        })
        .collect();
    drop(done_tx);

    for _ in 0..PRODUCERS * PER_PRODUCER {
        done_rx.recv_timeout(Duration::from_secs(30)).expect("hand-off stalled");
    }
    for t in producers.into_iter().chain(consumers) {
        t.join().unwrap();
    }
    assert_eq!(pool.stats().free, 4);
}

// ---------------------------------------------------------------------------
// Reconfiguration
// ---------------------------------------------------------------------------

#[test]
fn stale_indices_never_reappear_after_reconfigure() {
    let (_device, pool) = make_pool(EmulatedDevice::new(), 4, 2);
    let stale: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();

    let req = ReconfigureRequest {
        format: PixelFormat::Nv12,
        bit_depth: 8,
        coded: Resolution::new(192, 96),
        display: Resolution::new(192, 96),
        target: Resolution::new(192, 96),
        pool_size: 2,
        num_decode_surfaces: 2,
        budget: None,
    };
    assert!(pool.reconfigure(&req));
    drop(stale);

    let fresh: Vec<_> = (0..2).map(|_| pool.acquire().unwrap()).collect();
    assert!(fresh.iter().all(|s| s.epoch() == 1));
    assert_eq!(
        fresh.iter().map(|s| s.index()).collect::<Vec<_>>(),
        vec![0, 1]
    );
    let stats = pool.stats();
    assert_eq!((stats.total, stats.free, stats.in_flight), (2, 0, 2));
}

#[test]
fn reconfigure_under_load_keeps_accounting() {
    let (device, pool) = make_pool(EmulatedDevice::new(), 4, 2);
    let (tx, rx) = unbounded();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut s = pool.acquire().unwrap();
                    pool.map(&mut s).unwrap();
                    if s.index() % 2 == 0 {
                        drop(pool.export(s).unwrap());
                    } else {
                        drop(s);
                    }
                }
                tx.send(()).unwrap();
            })
        })
        .collect();
    drop(tx);

    for size in [3, 4, 2, 4] {
        let req = ReconfigureRequest {
            format: PixelFormat::Nv12,
            bit_depth: 8,
            coded: Resolution::new(128, 64),
            display: Resolution::new(128, 64),
            target: Resolution::new(128, 64),
            pool_size: size,
            num_decode_surfaces: 4,
            budget: None,
        };
        assert!(pool.reconfigure(&req));
        thread::sleep(Duration::from_millis(5));
    }

    for _ in 0..4 {
        rx.recv_timeout(Duration::from_secs(30)).expect("worker stalled");
    }
    for w in workers {
        w.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.epoch, 4);
    assert_eq!((stats.total, stats.free, stats.mapped), (4, 4, 0));
    assert_eq!(device.counters().mapped_now, 0);
}

// ---------------------------------------------------------------------------
// Flushing
// ---------------------------------------------------------------------------

#[test]
fn flushing_wakes_every_parked_waiter() {
    let (_device, pool) =
        make_pool(EmulatedDevice::new().with_output_policy(OutputSlotPolicy::RoundRobin), 3, 2);

    // Exhaust surfaces and budget, and keep a live export on output slot 0.
    let mut a = pool.acquire().unwrap();
    pool.map(&mut a).unwrap();
    let export = pool.export(a).unwrap();
    let mut b = pool.acquire().unwrap();
    pool.map(&mut b).unwrap();
    pool.unmap(&mut b);
    let mut c = pool.acquire().unwrap();
    pool.map(&mut c).unwrap();
    assert_eq!(c.mapping().unwrap().ptr, export.ptr());

    let (tx, rx) = unbounded::<(&'static str, bool)>();

    // A cancelled export hands its surface back, so one acquirer may win it.
    let acquirers: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let result = pool.acquire();
                tx.send(("acquire", matches!(result, Err(Cancelled)))).unwrap();
            })
        })
        .collect();
    let mapper = {
        let pool = pool.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            let result = pool.map(&mut b);
            tx.send(("map", result == Err(MapError::Cancelled))).unwrap();
            b
        })
    };
    let exporter = {
        let pool = pool.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            let result = pool.export(c);
            tx.send(("export", matches!(result, Err(MapError::Cancelled)))).unwrap();
        })
    };
    drop(tx);

    // Every waiter is parked before the flag flips.
    assert_eq!(rx.recv_timeout(Duration::from_millis(100)), Err(RecvTimeoutError::Timeout));
    pool.set_flushing(true);

    let mut woke: Vec<(&str, bool)> =
        (0..5).map(|_| rx.recv_timeout(WAKE).expect("missed wakeup")).collect();
    woke.sort_unstable();
    let names: Vec<&str> = woke.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, vec!["acquire", "acquire", "acquire", "export", "map"]);
    let cancelled_acquires = woke.iter().filter(|(n, c)| *n == "acquire" && *c).count();
    assert!(cancelled_acquires >= 2);
    assert!(woke.iter().filter(|(n, _)| *n != "acquire").all(|(_, c)| *c));

    for t in acquirers {
        t.join().unwrap();
    }
    let b = mapper.join().unwrap();
    exporter.join().unwrap();
    drop(b);

    // Cancelled calls left nothing behind except the live export.
    let stats = pool.stats();
    assert_eq!((stats.mapped, stats.exported), (1, 1));
    drop(export);
    assert_eq!(pool.stats().free, 3);
    assert_eq!(pool.stats().mapped, 0);
}
