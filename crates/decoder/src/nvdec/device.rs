//! `NvdecDevice` — [`DecodeDevice`] on top of the CUDA driver and nvcuvid.
//!
//! Handles cross the trait boundary as integers; every call that needs a
//! context pushes it for the duration of the call with [`CurrentContext`].

use std::collections::HashMap;
use std::ffi::{c_int, c_uint, c_ulong};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use nvd_common::{
    ChromaFormat, ContextHandle, DecodeDevice, DecoderCaps, DecoderCreateInfo, DecoderHandle,
    DeviceCopy, DeviceError, DevicePtr, DriverStatus, PictureParams, PixelFormat,
    ReconfigureInfo, Resolution, StreamHandle, VideoCodec,
};

use super::ffi::{self, pic_params, CUcontext, CUstream, CUvideodecoder, NvdecLibrary};

fn ctx_ptr(ctx: ContextHandle) -> CUcontext {
    ctx.0 as usize as CUcontext
}

fn stream_ptr(stream: StreamHandle) -> CUstream {
    stream.0 as usize as CUstream
}

fn decoder_ptr(decoder: DecoderHandle) -> CUvideodecoder {
    decoder.0 as usize as CUvideodecoder
}

fn check(code: ffi::CUresult) -> Result<(), DriverStatus> {
    DriverStatus::check(code)
}

/// Keeps a context current on this thread until dropped.
struct CurrentContext<'a> {
    lib: &'a NvdecLibrary,
}

impl<'a> CurrentContext<'a> {
    fn push(lib: &'a NvdecLibrary, ctx: CUcontext) -> Result<Self, DriverStatus> {
        // SAFETY: ctx is a live context created by cuCtxCreate.
        check(unsafe { (lib.cuda.ctx_push_current)(ctx) })?;
        Ok(Self { lib })
    }
}

impl Drop for CurrentContext<'_> {
    fn drop(&mut self) {
        let mut popped: CUcontext = std::ptr::null_mut();
        // SAFETY: Pops the context pushed in `push` on this thread.
        let status = unsafe { (self.lib.cuda.ctx_pop_current)(&mut popped) };
        if status != 0 {
            warn!(status = %DriverStatus(status), "Failed to pop CUDA context");
        }
    }
}

pub fn cuvid_codec(codec: VideoCodec) -> c_int {
    match codec {
        VideoCodec::Mpeg1 => ffi::CUDA_VIDEO_CODEC_MPEG1,
        VideoCodec::Mpeg2 => ffi::CUDA_VIDEO_CODEC_MPEG2,
        VideoCodec::Mpeg4 => ffi::CUDA_VIDEO_CODEC_MPEG4,
        VideoCodec::Vc1 => ffi::CUDA_VIDEO_CODEC_VC1,
        VideoCodec::H264 => ffi::CUDA_VIDEO_CODEC_H264,
        VideoCodec::Jpeg => ffi::CUDA_VIDEO_CODEC_JPEG,
        VideoCodec::H265 => ffi::CUDA_VIDEO_CODEC_HEVC,
        VideoCodec::Vp8 => ffi::CUDA_VIDEO_CODEC_VP8,
        VideoCodec::Vp9 => ffi::CUDA_VIDEO_CODEC_VP9,
        VideoCodec::Av1 => ffi::CUDA_VIDEO_CODEC_AV1,
    }
}

fn cuvid_chroma(chroma: ChromaFormat) -> c_int {
    match chroma {
        ChromaFormat::Yuv420 => ffi::CUDA_VIDEO_CHROMA_420,
        ChromaFormat::Yuv444 => ffi::CUDA_VIDEO_CHROMA_444,
    }
}

pub fn cuvid_surface_format(format: PixelFormat) -> c_int {
    match format {
        PixelFormat::Nv12 => ffi::CUDA_VIDEO_SURFACE_NV12,
        PixelFormat::P010 | PixelFormat::P012 => ffi::CUDA_VIDEO_SURFACE_P016,
        PixelFormat::Y444 => ffi::CUDA_VIDEO_SURFACE_YUV444,
        PixelFormat::Y444_16 => ffi::CUDA_VIDEO_SURFACE_YUV444_16BIT,
    }
}

/// Output formats named by a caps `nOutputFormatMask`.
pub fn formats_from_mask(mask: u16, bit_depth: u32) -> Vec<PixelFormat> {
    let has = |surface: c_int| mask & (1 << surface) != 0;
    let mut formats = Vec::new();
    if has(ffi::CUDA_VIDEO_SURFACE_NV12) {
        formats.push(PixelFormat::Nv12);
    }
    if has(ffi::CUDA_VIDEO_SURFACE_P016) {
        formats.push(if bit_depth >= 12 {
            PixelFormat::P012
        } else {
            PixelFormat::P010
        });
    }
    if has(ffi::CUDA_VIDEO_SURFACE_YUV444) {
        formats.push(PixelFormat::Y444);
    }
    if has(ffi::CUDA_VIDEO_SURFACE_YUV444_16BIT) {
        formats.push(PixelFormat::Y444_16);
    }
    formats
}

fn rect(size: Resolution) -> ffi::CuvidRect {
    ffi::CuvidRect {
        left: 0,
        top: 0,
        right: size.width as i16,
        bottom: size.height as i16,
    }
}

fn put(block: &mut [u8], offset: usize, value: &[u8]) {
    block[offset..offset + value.len()].copy_from_slice(value);
}

pub struct NvdecDevice {
    lib: Arc<NvdecLibrary>,
    /// Contexts used only for capability queries, created on demand.
    probe_contexts: Mutex<HashMap<u32, ContextHandle>>,
}

impl std::fmt::Debug for NvdecDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvdecDevice")
            .field("lib", &self.lib)
            .field("probe_contexts", &self.probe_contexts.lock().len())
            .finish()
    }
}

impl NvdecDevice {
    /// Load the NVIDIA libraries. Fails on hosts without the driver.
    pub fn load() -> Result<Self, DeviceError> {
        Ok(Self::with_library(Arc::new(NvdecLibrary::load()?)))
    }

    pub fn with_library(lib: Arc<NvdecLibrary>) -> Self {
        Self {
            lib,
            probe_contexts: Mutex::new(HashMap::new()),
        }
    }

    fn probe_context(&self, ordinal: u32) -> Result<ContextHandle, DriverStatus> {
        let mut contexts = self.probe_contexts.lock();
        if let Some(ctx) = contexts.get(&ordinal) {
            return Ok(*ctx);
        }
        let ctx = self.open_context(ordinal)?;
        contexts.insert(ordinal, ctx);
        Ok(ctx)
    }
}

impl Drop for NvdecDevice {
    fn drop(&mut self) {
        let contexts: Vec<ContextHandle> = self.probe_contexts.get_mut().drain().map(|(_, c)| c).collect();
        for ctx in contexts {
            if let Err(status) = self.close_context(ctx) {
                warn!(%status, "Failed to destroy probe context");
            }
        }
    }
}

impl DecodeDevice for NvdecDevice {
    fn name(&self) -> &str {
        "nvdec"
    }

    fn open_context(&self, ordinal: u32) -> Result<ContextHandle, DriverStatus> {
        let cuda = &self.lib.cuda;
        let mut device: ffi::CUdevice = 0;
        let mut ctx: CUcontext = std::ptr::null_mut();
        let mut popped: CUcontext = std::ptr::null_mut();
        // SAFETY: Out-pointers are valid locals. cuCtxCreate makes the new
        // context current; it is popped right away so the calling thread is
        // left as it was.
        unsafe {
            check((cuda.device_get)(&mut device, ordinal as c_int))?;
            check((cuda.ctx_create)(&mut ctx, 0, device))?;
            check((cuda.ctx_pop_current)(&mut popped))?;
        }
        debug!(ordinal, "CUDA context created");
        Ok(ContextHandle(ctx as usize as u64))
    }

    fn close_context(&self, ctx: ContextHandle) -> Result<(), DriverStatus> {
        // SAFETY: ctx came from open_context and is destroyed once.
        check(unsafe { (self.lib.cuda.ctx_destroy)(ctx_ptr(ctx)) })
    }

    fn create_stream(&self, ctx: ContextHandle) -> Result<StreamHandle, DriverStatus> {
        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: Out-pointer is a valid local; context is current.
        check(unsafe { (self.lib.cuda.stream_create)(&mut stream, 0) })?;
        Ok(StreamHandle(stream as usize as u64))
    }

    fn destroy_stream(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<(), DriverStatus> {
        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        // SAFETY: stream was created on this context and is destroyed once.
        check(unsafe { (self.lib.cuda.stream_destroy)(stream_ptr(stream)) })
    }

    fn create_decoder(
        &self,
        ctx: ContextHandle,
        info: &DecoderCreateInfo,
    ) -> Result<DecoderHandle, DriverStatus> {
        let mut params = ffi::CuvidDecodeCreateInfo {
            ul_width: info.coded.width as c_ulong,
            ul_height: info.coded.height as c_ulong,
            ul_num_decode_surfaces: info.num_decode_surfaces as c_ulong,
            codec_type: cuvid_codec(info.codec),
            chroma_format: cuvid_chroma(info.format.chroma()),
            ul_creation_flags: ffi::CUDA_VIDEO_CREATE_PREFER_CUVID,
            bit_depth_minus8: info.bit_depth.saturating_sub(8) as c_ulong,
            ul_max_width: info.max.width as c_ulong,
            ul_max_height: info.max.height as c_ulong,
            display_area: rect(info.display),
            output_format: cuvid_surface_format(info.format),
            deinterlace_mode: ffi::CUDA_VIDEO_DEINTERLACE_WEAVE,
            ul_target_width: info.target.width as c_ulong,
            ul_target_height: info.target.height as c_ulong,
            ul_num_output_surfaces: info.num_output_surfaces as c_ulong,
            target_rect: rect(info.target),
            ..Default::default()
        };

        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        let mut decoder: CUvideodecoder = std::ptr::null_mut();
        // SAFETY: params is fully initialized; out-pointer is a valid local.
        check(unsafe { (self.lib.cuvid.create_decoder)(&mut decoder, &mut params) })?;
        Ok(DecoderHandle(decoder as usize as u64))
    }

    fn destroy_decoder(&self, ctx: ContextHandle, decoder: DecoderHandle) -> Result<(), DriverStatus> {
        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        // SAFETY: decoder came from create_decoder and is destroyed once.
        check(unsafe { (self.lib.cuvid.destroy_decoder)(decoder_ptr(decoder)) })
    }

    fn decode_picture(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        slot: u32,
        params: &PictureParams,
    ) -> Result<(), DriverStatus> {
        let len = params.raw.len();
        if len < pic_params::HEADER_LEN {
            return Err(DriverStatus::INVALID_VALUE);
        }

        // Copy into 8-byte aligned storage so the driver sees a properly
        // aligned CUVIDPICPARAMS.
        let mut storage = vec![0u64; len.div_ceil(8)];
        // SAFETY: storage holds at least `len` bytes and u8 has no alignment
        // requirement; the slice does not outlive storage.
        let block = unsafe { std::slice::from_raw_parts_mut(storage.as_mut_ptr().cast::<u8>(), len) };
        block.copy_from_slice(&params.raw);

        put(block, pic_params::CURR_PIC_IDX, &(slot as i32).to_ne_bytes());
        if !params.bitstream.is_empty() {
            put(block, pic_params::BITSTREAM_DATA_LEN, &(params.bitstream.len() as u32).to_ne_bytes());
            put(block, pic_params::BITSTREAM_DATA, &(params.bitstream.as_ptr() as u64).to_ne_bytes());
            put(block, pic_params::NUM_SLICES, &(params.slice_offsets.len() as u32).to_ne_bytes());
            put(block, pic_params::SLICE_DATA_OFFSETS, &(params.slice_offsets.as_ptr() as u64).to_ne_bytes());
        }
        put(block, pic_params::REF_PIC_FLAG, &(params.reference as i32).to_ne_bytes());
        put(block, pic_params::INTRA_PIC_FLAG, &(params.intra as i32).to_ne_bytes());

        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        // SAFETY: storage is a complete CUVIDPICPARAMS block; the bitstream and
        // slice offset buffers it points to are borrowed from `params` for the
        // duration of the call.
        check(unsafe { (self.lib.cuvid.decode_picture)(decoder_ptr(decoder), storage.as_mut_ptr().cast()) })
    }

    fn supports_reconfigure(&self) -> bool {
        self.lib.cuvid.reconfigure_decoder.is_some()
    }

    fn reconfigure_decoder(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        info: &ReconfigureInfo,
    ) -> Result<(), DriverStatus> {
        let reconfigure = self
            .lib
            .cuvid
            .reconfigure_decoder
            .ok_or(DriverStatus::NOT_SUPPORTED)?;
        let mut params = ffi::CuvidReconfigureDecoderInfo {
            ul_width: info.coded.width,
            ul_height: info.coded.height,
            ul_target_width: info.target.width,
            ul_target_height: info.target.height,
            ul_num_decode_surfaces: info.num_decode_surfaces,
            display_area: rect(info.display),
            target_rect: rect(info.target),
            ..Default::default()
        };

        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        // SAFETY: params is fully initialized; decoder is live.
        check(unsafe { reconfigure(decoder_ptr(decoder), &mut params) })
    }

    fn map_frame(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        slot: u32,
        stream: StreamHandle,
    ) -> Result<(DevicePtr, u32), DriverStatus> {
        let mut proc = ffi::CuvidProcParams {
            progressive_frame: 1,
            output_stream: stream_ptr(stream),
            ..Default::default()
        };
        let mut ptr: ffi::CUdeviceptr = 0;
        let mut pitch: c_uint = 0;

        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        // SAFETY: Out-pointers are valid locals; decoder is live.
        check(unsafe {
            (self.lib.cuvid.map_video_frame)(decoder_ptr(decoder), slot as c_int, &mut ptr, &mut pitch, &mut proc)
        })?;
        Ok((DevicePtr(ptr), pitch))
    }

    fn unmap_frame(&self, ctx: ContextHandle, decoder: DecoderHandle, ptr: DevicePtr) -> Result<(), DriverStatus> {
        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        // SAFETY: ptr came from map_frame on this decoder.
        check(unsafe { (self.lib.cuvid.unmap_video_frame)(decoder_ptr(decoder), ptr.0) })
    }

    fn copy_to_host(
        &self,
        ctx: ContextHandle,
        stream: StreamHandle,
        copy: &DeviceCopy,
        dst: &mut [u8],
    ) -> Result<(), DriverStatus> {
        if copy.rows == 0 {
            return Ok(());
        }
        let end = copy.dst_offset + (copy.rows - 1) * copy.dst_stride + copy.width_bytes;
        if end > dst.len() || copy.width_bytes > copy.src_pitch as usize {
            return Err(DriverStatus::INVALID_VALUE);
        }

        let params = ffi::CudaMemcpy2D {
            src_memory_type: ffi::CU_MEMORYTYPE_DEVICE,
            src_device: copy.src.0,
            src_pitch: copy.src_pitch as usize,
            dst_memory_type: ffi::CU_MEMORYTYPE_HOST,
            dst_host: dst[copy.dst_offset..].as_mut_ptr().cast(),
            dst_pitch: copy.dst_stride,
            width_in_bytes: copy.width_bytes,
            height: copy.rows,
            ..Default::default()
        };

        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        // SAFETY: The destination range was bounds-checked above. The copy is
        // asynchronous; callers synchronize the stream before `dst` is read
        // or released.
        check(unsafe { (self.lib.cuda.memcpy_2d_async)(&params, stream_ptr(stream)) })
    }

    fn synchronize(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<(), DriverStatus> {
        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        // SAFETY: stream is live on this context.
        check(unsafe { (self.lib.cuda.stream_synchronize)(stream_ptr(stream)) })
    }

    fn decoder_caps(
        &self,
        ordinal: u32,
        codec: VideoCodec,
        chroma: ChromaFormat,
        bit_depth: u32,
    ) -> Result<DecoderCaps, DriverStatus> {
        let ctx = self.probe_context(ordinal)?;
        let mut caps = ffi::CuvidDecodeCaps {
            codec_type: cuvid_codec(codec),
            chroma_format: cuvid_chroma(chroma),
            bit_depth_minus8: bit_depth.saturating_sub(8),
            ..Default::default()
        };

        let _current = CurrentContext::push(&self.lib, ctx_ptr(ctx))?;
        // SAFETY: caps is a valid, initialized in/out struct.
        check(unsafe { (self.lib.cuvid.get_decoder_caps)(&mut caps) })?;

        Ok(DecoderCaps {
            supported: caps.is_supported != 0,
            min: Resolution::new(caps.min_width as u32, caps.min_height as u32),
            max: Resolution::new(caps.max_width, caps.max_height),
            max_macroblocks: caps.max_mb_count,
            output_formats: formats_from_mask(caps.output_format_mask, bit_depth),
        })
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_ids_match_cuviddec() {
        assert_eq!(cuvid_codec(VideoCodec::H264), 4);
        assert_eq!(cuvid_codec(VideoCodec::H265), 8);
        assert_eq!(cuvid_codec(VideoCodec::Av1), 11);
    }

    #[test]
    fn output_mask_decoding() {
        assert_eq!(formats_from_mask(0b0001, 8), vec![PixelFormat::Nv12]);
        assert_eq!(
            formats_from_mask(0b0011, 10),
            vec![PixelFormat::Nv12, PixelFormat::P010]
        );
        assert_eq!(formats_from_mask(0b0010, 12), vec![PixelFormat::P012]);
        assert_eq!(
            formats_from_mask(0b1100, 8),
            vec![PixelFormat::Y444, PixelFormat::Y444_16]
        );
    }

    #[test]
    fn surface_formats() {
        assert_eq!(cuvid_surface_format(PixelFormat::P012), ffi::CUDA_VIDEO_SURFACE_P016);
        assert_eq!(cuvid_surface_format(PixelFormat::Y444_16), ffi::CUDA_VIDEO_SURFACE_YUV444_16BIT);
    }
}
