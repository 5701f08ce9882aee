//! `NvDecoder` — per-stream frame protocol on top of the surface pool.
//!
//! The caller's bitstream parser drives the decoder through four steps:
//!
//! 1. [`NvDecoder::configure`] with the stream parameters of a new sequence.
//! 2. [`NvDecoder::new_picture`] for each picture to get a free surface.
//! 3. [`NvDecoder::decode`] to submit the picture parameters.
//! 4. [`NvDecoder::output_picture`] in display order, which either exports the
//!    surface zero-copy or copies it to host memory and recycles it.
//!
//! The hardware decoder is created lazily on the first `new_picture`, once
//! the output kind and downstream's buffer requirements are known.
//!
//! ## Concurrency
//!
//! All methods take `&self`. The decoder's bookkeeping sits behind a mutex
//! that is never held across a blocking pool call, so another thread can
//! call [`NvDecoder::set_flushing`] to abort a blocked `new_picture` or
//! `output_picture`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use nvd_common::{
    DecodeDevice, DecodeError, DecoderConfig, DecoderCreateInfo, DecoderSettings, DeviceCopy,
    DeviceError, FrameError, FrameGeometry, FrameResult, HostPlane, MapError, PictureParams,
    Resolution,
};

use crate::caps::CapsCache;
use crate::context::DecoderContext;
use crate::export::ExportedMemory;
use crate::pool::{PoolOptions, PoolStats, SurfacePool};
use crate::reconfigure::ReconfigureRequest;
use crate::surface::Surface;

/// Where decoded pictures are delivered.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputKind {
    /// Copied into host memory.
    #[default]
    System,
    /// Device memory; exported zero-copy when the budget allows.
    Device,
}

/// A decoded picture copied to host memory with packed planes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostFrame {
    pub data: Vec<u8>,
    pub geometry: FrameGeometry,
    pub planes: Vec<HostPlane>,
    pub surface_index: u32,
}

impl HostFrame {
    pub fn plane(&self, plane: usize) -> Option<&[u8]> {
        let p = self.planes.get(plane)?;
        self.data.get(p.offset..p.offset + p.stride * p.rows)
    }
}

/// Output of [`NvDecoder::output_picture`].
#[derive(Debug)]
pub enum DecodedFrame {
    System(HostFrame),
    Device(ExportedMemory),
}

impl DecodedFrame {
    pub fn is_zero_copy(&self) -> bool {
        matches!(self, Self::Device(_))
    }

    pub fn surface_index(&self) -> u32 {
        match self {
            Self::System(f) => f.surface_index,
            Self::Device(m) => m.surface_index(),
        }
    }
}

/// Upper bound for one output dimension.
///
/// Returns `coded` unless the user asked for more, in which case the request
/// is rounded up to a multiple of 16 and clamped to the device maximum.
pub fn max_output_size(coded: u32, user: u32, device_max: u32) -> u32 {
    if user <= coded {
        return coded;
    }
    user.next_multiple_of(16).min(device_max)
}

/// Pool parameters recorded by `configure`, used when the pool is created.
#[derive(Clone, Debug)]
struct PoolLayout {
    info: DecoderCreateInfo,
    options: PoolOptions,
}

#[derive(Default)]
struct DecoderInner {
    context: Option<Arc<DecoderContext>>,
    pool: Option<SurfacePool>,
    layout: Option<PoolLayout>,
    config: Option<DecoderConfig>,
    output_kind: OutputKind,
    downstream_min: u32,
    flushing: bool,
    frames_output: u64,
    frames_exported: u64,
}

pub struct NvDecoder {
    device: Arc<dyn DecodeDevice>,
    caps: Arc<CapsCache>,
    settings: DecoderSettings,
    inner: Mutex<DecoderInner>,
}

impl std::fmt::Debug for NvDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NvDecoder")
            .field("device", &self.device.name())
            .field("config", &inner.config)
            .field("output_kind", &inner.output_kind)
            .field("pool", &inner.pool)
            .field("frames_output", &inner.frames_output)
            .finish()
    }
}

impl NvDecoder {
    pub fn new(device: Arc<dyn DecodeDevice>, caps: Arc<CapsCache>, settings: DecoderSettings) -> Self {
        Self {
            device,
            caps,
            settings,
            inner: Mutex::new(DecoderInner::default()),
        }
    }

    pub fn settings(&self) -> &DecoderSettings {
        &self.settings
    }

    /// Open the device context. Idempotent.
    pub fn open(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if inner.context.is_none() {
            inner.context = Some(DecoderContext::create(
                Arc::clone(&self.device),
                self.settings.device_ordinal,
            )?);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().context.is_some()
    }

    pub fn is_configured(&self) -> bool {
        self.inner.lock().config.is_some()
    }

    pub fn config(&self) -> Option<DecoderConfig> {
        self.inner.lock().config.clone()
    }

    /// Output kind for pools created from now on.
    pub fn set_output_kind(&self, kind: OutputKind) {
        self.inner.lock().output_kind = kind;
    }

    /// Buffers downstream needs to hold at once (from allocation negotiation).
    pub fn set_downstream_min_buffers(&self, min: u32) {
        self.inner.lock().downstream_min = min;
    }

    /// Apply stream parameters. Reconfigures in place when the new stream
    /// fits the existing decoder, otherwise drops the pool so the next
    /// `new_picture` recreates it.
    pub fn configure(&self, config: &DecoderConfig) -> Result<(), DeviceError> {
        config.validate()?;

        let caps = self
            .caps
            .get_or_probe(self.device.as_ref(), self.settings.device_ordinal, config.codec)?;
        if !caps.supports(config.format) {
            return Err(DeviceError::Unsupported {
                codec: config.codec,
                format: Some(config.format),
                reason: "output format not supported by device".into(),
            });
        }
        if !caps.accepts(config.coded) {
            return Err(DeviceError::Unsupported {
                codec: config.codec,
                format: Some(config.format),
                reason: format!("coded size {} outside {}..{}", config.coded, caps.min, caps.max),
            });
        }

        let pool_size = config.pool_size + config.codec.extra_decode_surfaces();
        let num_decode_surfaces = config.decode_surface_count();
        let target = config.display.round_up_even();

        let mut inner = self.inner.lock();
        if inner.context.is_none() {
            return Err(DeviceError::ContextClosed);
        }

        if let Some(pool) = inner.pool.clone() {
            let current = pool.create_info();
            let budget = (inner.output_kind == OutputKind::Device).then(|| {
                self.settings
                    .budget_policy()
                    .resolve(inner.downstream_min)
            });
            let req = ReconfigureRequest {
                format: config.format,
                bit_depth: config.coded_bit_depth,
                coded: config.coded,
                display: config.display,
                target,
                pool_size,
                num_decode_surfaces,
                budget,
            };
            if current.codec == config.codec
                && pool.allocates_aux_frames() == config.alloc_aux_frame
                && pool.reconfigure(&req)
            {
                if let Some(layout) = inner.layout.as_mut() {
                    layout.info = pool.create_info();
                    layout.options.pool_size = pool_size;
                }
                inner.config = Some(config.clone());
                info!(coded = %config.coded, display = %config.display, "Decoder reconfigured in place");
                return Ok(());
            }
        }

        Self::reset_locked(&mut inner);

        let init_max = Resolution::new(self.settings.init_max_width, self.settings.init_max_height);
        let max = Resolution::new(
            max_output_size(config.coded.width, init_max.width, caps.max.width),
            max_output_size(config.coded.height, init_max.height, caps.max.height),
        )
        .max(config.coded);

        inner.layout = Some(PoolLayout {
            info: DecoderCreateInfo {
                codec: config.codec,
                format: config.format,
                bit_depth: config.coded_bit_depth,
                coded: config.coded,
                display: config.display,
                target,
                max,
                num_decode_surfaces,
                num_output_surfaces: 1,
            },
            options: PoolOptions {
                pool_size,
                alloc_aux_frame: config.alloc_aux_frame,
            },
        });
        inner.config = Some(config.clone());

        info!(
            codec = config.codec.display_name(),
            format = ?config.format,
            coded = %config.coded,
            display = %config.display,
            %max,
            pool_size,
            decode_surfaces = num_decode_surfaces,
            "Decoder configured"
        );
        Ok(())
    }

    /// Acquire a surface for the next picture, creating the hardware decoder
    /// on first use. Blocks while every surface is in use.
    pub fn new_picture(&self) -> FrameResult<Surface> {
        let pool = self.ensure_pool()?;
        Ok(pool.acquire()?)
    }

    /// Submit a picture to the hardware decoder.
    pub fn decode(&self, surface: &Surface, params: &PictureParams) -> Result<(), DecodeError> {
        surface
            .pool()
            .driver
            .decode(surface.index(), surface.decode_slot(), params)
    }

    /// Deliver a decoded picture, zero-copy when possible.
    pub fn output_picture(&self, surface: Surface) -> FrameResult<DecodedFrame> {
        let (kind, downstream_min) = {
            let inner = self.inner.lock();
            (inner.output_kind, inner.downstream_min)
        };
        let pool = SurfacePool {
            shared: Arc::clone(surface.pool()),
        };

        let mut surface = surface;
        pool.map(&mut surface)?;

        if self.can_export(&pool, kind, downstream_min) {
            let mem = pool.export(surface).map_err(|e| {
                warn!(error = %e, "Couldn't export surface");
                e
            })?;
            trace!(index = mem.surface_index(), ptr = %mem.ptr(), "Exported output surface without copy");
            self.count_output(true);
            return Ok(DecodedFrame::Device(mem));
        }

        let frame = download(&pool, &surface);
        pool.unmap(&mut surface);
        pool.release(surface);
        let frame = frame?;
        self.count_output(false);
        Ok(DecodedFrame::System(frame))
    }

    fn can_export(&self, pool: &SurfacePool, kind: OutputKind, downstream_min: u32) -> bool {
        if kind != OutputKind::Device || self.settings.num_output_surfaces == 1 {
            return false;
        }
        if pool.budget() < downstream_min {
            return false;
        }
        if self.settings.wait_on_pool_full {
            return true;
        }
        let free = pool.num_free_output_slots();
        if free == 0 {
            trace!("No more free output surface, need copy");
        }
        free > 0
    }

    fn count_output(&self, exported: bool) {
        let mut inner = self.inner.lock();
        inner.frames_output += 1;
        if exported {
            inner.frames_exported += 1;
        }
    }

    /// Abort (or re-allow) blocking pool waits.
    pub fn set_flushing(&self, flushing: bool) {
        let mut inner = self.inner.lock();
        inner.flushing = flushing;
        if let Some(pool) = &inner.pool {
            pool.set_flushing(flushing);
        }
    }

    /// Drop the pool and all configuration. Outstanding surfaces and exports
    /// keep the old hardware decoder alive until they are gone.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        Self::reset_locked(&mut inner);
        inner.config = None;
        inner.layout = None;
        inner.downstream_min = 0;
    }

    /// Reset and release the device context. Idempotent.
    pub fn close(&self) {
        self.reset();
        let context = self.inner.lock().context.take();
        if let Some(context) = context {
            context.destroy();
            info!("Decoder closed");
        }
    }

    pub fn stats(&self) -> Option<PoolStats> {
        self.inner.lock().pool.as_ref().map(SurfacePool::stats)
    }

    /// (frames output, of which exported zero-copy)
    pub fn frame_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.frames_output, inner.frames_exported)
    }

    fn reset_locked(inner: &mut DecoderInner) {
        if let Some(pool) = inner.pool.take() {
            pool.set_flushing(true);
            debug!(stats = ?pool.stats(), "Dropping surface pool");
        }
    }

    fn ensure_pool(&self) -> FrameResult<SurfacePool> {
        let mut inner = self.inner.lock();
        if let Some(pool) = &inner.pool {
            return Ok(pool.clone());
        }
        let layout = inner.layout.clone().ok_or(DecodeError::NotConfigured)?;
        let context = inner.context.clone().ok_or(DeviceError::ContextClosed)?;

        let mut info = layout.info;
        if inner.output_kind == OutputKind::Device {
            info.num_output_surfaces = self
                .settings
                .budget_policy()
                .resolve(inner.downstream_min);
            info!(
                output_surfaces = info.num_output_surfaces,
                requested = self.settings.num_output_surfaces,
                downstream_min = inner.downstream_min,
                "Updating output surface count"
            );
        }

        let pool = SurfacePool::new(context, info, layout.options)?;
        if inner.flushing {
            pool.set_flushing(true);
        }
        inner.pool = Some(pool.clone());
        Ok(pool)
    }
}

impl Drop for NvDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copy a mapped surface into a packed host frame.
fn download(pool: &SurfacePool, surface: &Surface) -> FrameResult<HostFrame> {
    let mapping = surface.mapping().ok_or(MapError::NotMapped {
        index: surface.index(),
    })?;
    let geometry = pool.geometry();
    let planes = geometry.host_planes();
    let copies: Vec<DeviceCopy> = planes
        .iter()
        .zip(0u32..)
        .map(|(p, plane)| DeviceCopy {
            src: mapping
                .ptr
                .offset(geometry.device_plane_offset(plane, mapping.pitch)),
            src_pitch: mapping.pitch,
            dst_offset: p.offset,
            dst_stride: p.stride,
            width_bytes: p.stride,
            rows: p.rows,
        })
        .collect();

    let mut data = vec![0u8; geometry.host_len()];
    pool.driver()
        .copy_to_host(&copies, &mut data)
        .map_err(FrameError::CopyFailed)?;

    Ok(HostFrame {
        data,
        geometry,
        planes,
        surface_index: surface.index(),
    })
}

// ── Tests ──
