//! Emulated decode device — a host-memory [`DecodeDevice`].
//!
//! Models the parts of NVDEC the surface pool depends on: a fixed number of
//! decode slots, a bounded set of output surfaces that `map_frame` hands out
//! (and may recycle while still mapped, like the hardware does), strided
//! device-to-host copies, and optional in-place reconfiguration. "Decoding"
//! fills a slot with a byte derived from the bitstream, so copies can be
//! checked plane by plane.
//!
//! Used by the test suites and on hosts without NVIDIA hardware.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::trace;

use nvd_common::{
    ChromaFormat, ContextHandle, DecodeDevice, DecoderCaps, DecoderCreateInfo, DecoderHandle,
    DeviceCopy, DevicePtr, DriverStatus, FrameGeometry, PictureParams, PixelFormat,
    ReconfigureInfo, Resolution, StreamHandle, VideoCodec,
};

/// Row pitch alignment of output surfaces.
const PITCH_ALIGN: u32 = 256;
/// Address space reserved per decoder instance.
const DECODER_ADDRESS_SPAN: u64 = 1 << 36;

/// How `map_frame` picks an output surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputSlotPolicy {
    /// The lowest output surface that is not mapped; fails when all are.
    #[default]
    LowestFree,
    /// Cycle through output surfaces whether or not they are still mapped.
    RoundRobin,
}

/// Call counters and live-object counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmulatedCounters {
    pub open_contexts: usize,
    pub live_decoders: usize,
    pub mapped_now: u32,
    pub decode_calls: u64,
    pub map_calls: u64,
    pub unmap_calls: u64,
    pub reconfigure_calls: u64,
    pub caps_queries: u64,
    pub copies: u64,
}

#[derive(Default)]
struct Failures {
    create: Option<DriverStatus>,
    decode: Option<DriverStatus>,
    map: Option<DriverStatus>,
}

struct OutputSurface {
    maps: u32,
    memory: Vec<u8>,
}

struct EmulatedDecoder {
    ctx: u64,
    info: DecoderCreateInfo,
    pitch: u32,
    base: u64,
    /// Distance between consecutive output surfaces.
    spacing: u64,
    slot_fill: Vec<u8>,
    outputs: Vec<OutputSurface>,
    next_output: usize,
}

impl EmulatedDecoder {
    fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.info.format, self.info.target, self.info.target.height)
    }

    fn output_ptr(&self, index: usize) -> DevicePtr {
        DevicePtr(self.base + index as u64 * self.spacing)
    }

    /// Output surface index and byte offset of `ptr`, if it lies in one.
    fn locate(&self, ptr: DevicePtr) -> Option<(usize, usize)> {
        let rel = ptr.0.checked_sub(self.base)?;
        let index = (rel / self.spacing) as usize;
        let offset = (rel % self.spacing) as usize;
        (index < self.outputs.len()).then_some((index, offset))
    }

    fn resize(&mut self) {
        let len = self.geometry().device_len(self.pitch);
        self.slot_fill.resize(self.info.num_decode_surfaces as usize, 0);
        for out in &mut self.outputs {
            out.memory.resize(len, 0);
        }
    }
}

#[derive(Default)]
struct EmulatedState {
    next_handle: u64,
    contexts: HashSet<u64>,
    streams: HashMap<u64, u64>,
    decoders: HashMap<u64, EmulatedDecoder>,
    failures: Failures,
    counters: EmulatedCounters,
}

impl EmulatedState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn decoder(&mut self, ctx: ContextHandle, decoder: DecoderHandle) -> Result<&mut EmulatedDecoder, DriverStatus> {
        if !self.contexts.contains(&ctx.0) {
            return Err(DriverStatus::INVALID_CONTEXT);
        }
        match self.decoders.get_mut(&decoder.0) {
            Some(d) if d.ctx == ctx.0 => Ok(d),
            _ => Err(DriverStatus::INVALID_HANDLE),
        }
    }
}

pub struct EmulatedDevice {
    device_count: u32,
    codecs: Vec<VideoCodec>,
    max_resolution: Resolution,
    reconfigure: bool,
    policy: OutputSlotPolicy,
    state: Mutex<EmulatedState>,
}

impl std::fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedDevice")
            .field("device_count", &self.device_count)
            .field("reconfigure", &self.reconfigure)
            .field("policy", &self.policy)
            .field("counters", &self.counters())
            .finish()
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedDevice {
    /// One device supporting every codec up to 8192x8192, with reconfiguration.
    pub fn new() -> Self {
        Self {
            device_count: 1,
            codecs: VideoCodec::ALL.to_vec(),
            max_resolution: Resolution::new(8192, 8192),
            reconfigure: true,
            policy: OutputSlotPolicy::default(),
            state: Mutex::new(EmulatedState::default()),
        }
    }

    pub fn with_reconfigure(mut self, supported: bool) -> Self {
        self.reconfigure = supported;
        self
    }

    pub fn with_output_policy(mut self, policy: OutputSlotPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_codecs(mut self, codecs: &[VideoCodec]) -> Self {
        self.codecs = codecs.to_vec();
        self
    }

    pub fn with_max_resolution(mut self, max: Resolution) -> Self {
        self.max_resolution = max;
        self
    }

    pub fn with_device_count(mut self, count: u32) -> Self {
        self.device_count = count;
        self
    }

    pub fn fail_next_create(&self, status: DriverStatus) {
        self.state.lock().failures.create = Some(status);
    }

    pub fn fail_next_decode(&self, status: DriverStatus) {
        self.state.lock().failures.decode = Some(status);
    }

    pub fn fail_next_map(&self, status: DriverStatus) {
        self.state.lock().failures.map = Some(status);
    }

    pub fn counters(&self) -> EmulatedCounters {
        let state = self.state.lock();
        EmulatedCounters {
            open_contexts: state.contexts.len(),
            live_decoders: state.decoders.len(),
            mapped_now: state
                .decoders
                .values()
                .flat_map(|d| d.outputs.iter())
                .map(|o| o.maps)
                .sum(),
            ..state.counters.clone()
        }
    }
}

impl DecodeDevice for EmulatedDevice {
    fn name(&self) -> &str {
        "emulated"
    }

    fn open_context(&self, ordinal: u32) -> Result<ContextHandle, DriverStatus> {
        if ordinal >= self.device_count {
            return Err(DriverStatus::INVALID_DEVICE);
        }
        let mut state = self.state.lock();
        let handle = state.handle();
        state.contexts.insert(handle);
        Ok(ContextHandle(handle))
    }

    fn close_context(&self, ctx: ContextHandle) -> Result<(), DriverStatus> {
        let mut state = self.state.lock();
        if !state.contexts.remove(&ctx.0) {
            return Err(DriverStatus::INVALID_CONTEXT);
        }
        state.streams.retain(|_, c| *c != ctx.0);
        state.decoders.retain(|_, d| d.ctx != ctx.0);
        Ok(())
    }

    fn create_stream(&self, ctx: ContextHandle) -> Result<StreamHandle, DriverStatus> {
        let mut state = self.state.lock();
        if !state.contexts.contains(&ctx.0) {
            return Err(DriverStatus::INVALID_CONTEXT);
        }
        let handle = state.handle();
        state.streams.insert(handle, ctx.0);
        Ok(StreamHandle(handle))
    }

    fn destroy_stream(&self, _ctx: ContextHandle, stream: StreamHandle) -> Result<(), DriverStatus> {
        match self.state.lock().streams.remove(&stream.0) {
            Some(_) => Ok(()),
            None => Err(DriverStatus::INVALID_HANDLE),
        }
    }

    fn create_decoder(
        &self,
        ctx: ContextHandle,
        info: &DecoderCreateInfo,
    ) -> Result<DecoderHandle, DriverStatus> {
        let mut state = self.state.lock();
        if !state.contexts.contains(&ctx.0) {
            return Err(DriverStatus::INVALID_CONTEXT);
        }
        if let Some(status) = state.failures.create.take() {
            return Err(status);
        }
        if !self.codecs.contains(&info.codec)
            || !info.max.fits_within(self.max_resolution)
            || !info.coded.fits_within(info.max)
        {
            return Err(DriverStatus::NOT_SUPPORTED);
        }
        if info.num_decode_surfaces == 0 || info.num_output_surfaces == 0 {
            return Err(DriverStatus::INVALID_VALUE);
        }

        let handle = state.handle();
        let pitch = info
            .format
            .row_bytes(info.max.width.max(info.target.width))
            .next_multiple_of(PITCH_ALIGN);
        let max_height = info.max.height.max(info.target.height).next_multiple_of(2);
        let spacing = FrameGeometry::new(info.format, info.max, max_height)
            .device_len(pitch)
            .next_multiple_of(4096) as u64;
        let mut decoder = EmulatedDecoder {
            ctx: ctx.0,
            info: info.clone(),
            pitch,
            base: handle * DECODER_ADDRESS_SPAN,
            spacing,
            slot_fill: Vec::new(),
            outputs: (0..info.num_output_surfaces)
                .map(|_| OutputSurface {
                    maps: 0,
                    memory: Vec::new(),
                })
                .collect(),
            next_output: 0,
        };
        decoder.resize();
        state.decoders.insert(handle, decoder);
        Ok(DecoderHandle(handle))
    }

    fn destroy_decoder(&self, ctx: ContextHandle, decoder: DecoderHandle) -> Result<(), DriverStatus> {
        let mut state = self.state.lock();
        state.decoder(ctx, decoder)?;
        state.decoders.remove(&decoder.0);
        Ok(())
    }

    fn decode_picture(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        slot: u32,
        params: &PictureParams,
    ) -> Result<(), DriverStatus> {
        let mut state = self.state.lock();
        state.counters.decode_calls += 1;
        if let Some(status) = state.failures.decode.take() {
            return Err(status);
        }
        let dec = state.decoder(ctx, decoder)?;
        let fill = dec
            .slot_fill
            .get_mut(slot as usize)
            .ok_or(DriverStatus::INVALID_VALUE)?;
        *fill = params.bitstream.first().copied().unwrap_or(slot as u8);
        trace!(slot, fill = *fill, "Emulated decode");
        Ok(())
    }

    fn supports_reconfigure(&self) -> bool {
        self.reconfigure
    }

    fn reconfigure_decoder(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        info: &ReconfigureInfo,
    ) -> Result<(), DriverStatus> {
        if !self.reconfigure {
            return Err(DriverStatus::NOT_SUPPORTED);
        }
        let mut state = self.state.lock();
        state.counters.reconfigure_calls += 1;
        let dec = state.decoder(ctx, decoder)?;
        if !info.coded.fits_within(dec.info.max) || !info.target.fits_within(dec.info.max.round_up_even()) {
            return Err(DriverStatus::INVALID_VALUE);
        }
        dec.info.coded = info.coded;
        dec.info.display = info.display;
        dec.info.target = info.target;
        dec.info.num_decode_surfaces = info.num_decode_surfaces;
        dec.resize();
        Ok(())
    }

    fn map_frame(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        slot: u32,
        _stream: StreamHandle,
    ) -> Result<(DevicePtr, u32), DriverStatus> {
        let policy = self.policy;
        let mut state = self.state.lock();
        state.counters.map_calls += 1;
        if let Some(status) = state.failures.map.take() {
            return Err(status);
        }
        let dec = state.decoder(ctx, decoder)?;
        let fill = *dec
            .slot_fill
            .get(slot as usize)
            .ok_or(DriverStatus::INVALID_VALUE)?;

        let index = match policy {
            OutputSlotPolicy::LowestFree => dec
                .outputs
                .iter()
                .position(|o| o.maps == 0)
                .ok_or(DriverStatus::MAP_FAILED)?,
            OutputSlotPolicy::RoundRobin => {
                let index = dec.next_output;
                dec.next_output = (index + 1) % dec.outputs.len();
                index
            }
        };

        let geometry = dec.geometry();
        let pitch = dec.pitch;
        let out = &mut dec.outputs[index];
        for plane in 0..geometry.format.plane_count() {
            let start = geometry.device_plane_offset(plane, pitch) as usize;
            let rows = geometry.format.plane_height(plane, geometry.aligned_height) as usize;
            let end = (start + rows * pitch as usize).min(out.memory.len());
            out.memory[start..end].fill(fill.wrapping_add(plane as u8));
        }
        out.maps += 1;
        let ptr = dec.output_ptr(index);
        trace!(slot, output = index, %ptr, "Emulated map");
        Ok((ptr, pitch))
    }

    fn unmap_frame(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        ptr: DevicePtr,
    ) -> Result<(), DriverStatus> {
        let mut state = self.state.lock();
        state.counters.unmap_calls += 1;
        let dec = state.decoder(ctx, decoder)?;
        let (index, offset) = dec.locate(ptr).ok_or(DriverStatus::INVALID_VALUE)?;
        let out = &mut dec.outputs[index];
        if offset != 0 || out.maps == 0 {
            return Err(DriverStatus::UNMAP_FAILED);
        }
        out.maps -= 1;
        Ok(())
    }

    fn copy_to_host(
        &self,
        ctx: ContextHandle,
        stream: StreamHandle,
        copy: &DeviceCopy,
        dst: &mut [u8],
    ) -> Result<(), DriverStatus> {
        let mut state = self.state.lock();
        if state.streams.get(&stream.0) != Some(&ctx.0) {
            return Err(DriverStatus::INVALID_HANDLE);
        }
        state.counters.copies += 1;
        let (dec, index, offset) = state
            .decoders
            .values()
            .filter(|d| d.ctx == ctx.0)
            .find_map(|d| d.locate(copy.src).map(|(i, o)| (d, i, o)))
            .ok_or(DriverStatus::INVALID_VALUE)?;
        let src = &dec.outputs[index].memory;

        for row in 0..copy.rows {
            let s = offset + row * copy.src_pitch as usize;
            let d = copy.dst_offset + row * copy.dst_stride;
            let src_row = src
                .get(s..s + copy.width_bytes)
                .ok_or(DriverStatus::INVALID_VALUE)?;
            dst.get_mut(d..d + copy.width_bytes)
                .ok_or(DriverStatus::INVALID_VALUE)?
                .copy_from_slice(src_row);
        }
        Ok(())
    }

    fn synchronize(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<(), DriverStatus> {
        match self.state.lock().streams.get(&stream.0) {
            Some(c) if *c == ctx.0 => Ok(()),
            _ => Err(DriverStatus::INVALID_HANDLE),
        }
    }

    fn decoder_caps(
        &self,
        ordinal: u32,
        codec: VideoCodec,
        chroma: ChromaFormat,
        bit_depth: u32,
    ) -> Result<DecoderCaps, DriverStatus> {
        if ordinal >= self.device_count {
            return Err(DriverStatus::INVALID_DEVICE);
        }
        self.state.lock().counters.caps_queries += 1;

        let supported = self.codecs.contains(&codec)
            && match chroma {
                ChromaFormat::Yuv420 => true,
                ChromaFormat::Yuv444 => bit_depth == 8,
            };
        if !supported {
            return Ok(DecoderCaps::default());
        }
        Ok(DecoderCaps {
            supported,
            min: Resolution::new(48, 16),
            max: self.max_resolution,
            max_macroblocks: (self.max_resolution.width / 16) * (self.max_resolution.height / 16),
            output_formats: PixelFormat::for_stream(chroma, bit_depth).into_iter().collect(),
        })
    }
}

// ── Tests ──
