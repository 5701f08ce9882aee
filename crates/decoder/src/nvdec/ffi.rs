//! Raw FFI bindings for the CUDA driver API and NVIDIA's nvcuvid (NVDEC) library.
//!
//! Both libraries are loaded dynamically at runtime via `libloading`. The
//! bindings cover only what the decode engine calls: context and stream
//! management, strided copies, and the decoder object API.
//!
//! Reference: NVIDIA Video Codec SDK -- `cuviddec.h`; CUDA driver API -- `cuda.h`.

use std::ffi::{c_int, c_short, c_uint, c_ulong, c_ulonglong, c_ushort, c_void};

use libloading::Library;
use tracing::{debug, info};

use nvd_common::DeviceError;

// ---------------------------------------------------------------------------
// CUDA driver types
// ---------------------------------------------------------------------------

pub type CUresult = c_int;
pub type CUdevice = c_int;
pub type CUcontext = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUdeviceptr = c_ulonglong;

pub const CU_MEMORYTYPE_HOST: c_uint = 1;
pub const CU_MEMORYTYPE_DEVICE: c_uint = 2;

/// `CUDA_MEMCPY2D`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CudaMemcpy2D {
    pub src_x_in_bytes: usize,
    pub src_y: usize,
    pub src_memory_type: c_uint,
    pub src_host: *const c_void,
    pub src_device: CUdeviceptr,
    pub src_array: *mut c_void,
    pub src_pitch: usize,
    pub dst_x_in_bytes: usize,
    pub dst_y: usize,
    pub dst_memory_type: c_uint,
    pub dst_host: *mut c_void,
    pub dst_device: CUdeviceptr,
    pub dst_array: *mut c_void,
    pub dst_pitch: usize,
    pub width_in_bytes: usize,
    pub height: usize,
}

impl Default for CudaMemcpy2D {
    fn default() -> Self {
        // SAFETY: All-zeros is valid for this POD struct (null pointers, zero sizes).
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// nvcuvid types
// ---------------------------------------------------------------------------

/// Opaque decoder handle (`CUvideodecoder`).
pub type CUvideodecoder = *mut c_void;

// cudaVideoCodec
pub const CUDA_VIDEO_CODEC_MPEG1: c_int = 0;
pub const CUDA_VIDEO_CODEC_MPEG2: c_int = 1;
pub const CUDA_VIDEO_CODEC_MPEG4: c_int = 2;
pub const CUDA_VIDEO_CODEC_VC1: c_int = 3;
pub const CUDA_VIDEO_CODEC_H264: c_int = 4;
pub const CUDA_VIDEO_CODEC_JPEG: c_int = 5;
pub const CUDA_VIDEO_CODEC_HEVC: c_int = 8;
pub const CUDA_VIDEO_CODEC_VP8: c_int = 9;
pub const CUDA_VIDEO_CODEC_VP9: c_int = 10;
pub const CUDA_VIDEO_CODEC_AV1: c_int = 11;

// cudaVideoChromaFormat
pub const CUDA_VIDEO_CHROMA_420: c_int = 1;
pub const CUDA_VIDEO_CHROMA_444: c_int = 3;

// cudaVideoSurfaceFormat
pub const CUDA_VIDEO_SURFACE_NV12: c_int = 0;
pub const CUDA_VIDEO_SURFACE_P016: c_int = 1;
pub const CUDA_VIDEO_SURFACE_YUV444: c_int = 2;
pub const CUDA_VIDEO_SURFACE_YUV444_16BIT: c_int = 3;

// cudaVideoDeinterlaceMode
pub const CUDA_VIDEO_DEINTERLACE_WEAVE: c_int = 0;

// cudaVideoCreateFlags
pub const CUDA_VIDEO_CREATE_PREFER_CUVID: c_ulong = 0x04;

/// Rectangle in `short` coordinates, as embedded in decoder structs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CuvidRect {
    pub left: c_short,
    pub top: c_short,
    pub right: c_short,
    pub bottom: c_short,
}

/// `CUVIDDECODECREATEINFO`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CuvidDecodeCreateInfo {
    pub ul_width: c_ulong,
    pub ul_height: c_ulong,
    pub ul_num_decode_surfaces: c_ulong,
    pub codec_type: c_int,
    pub chroma_format: c_int,
    pub ul_creation_flags: c_ulong,
    pub bit_depth_minus8: c_ulong,
    pub ul_intra_decode_only: c_ulong,
    pub ul_max_width: c_ulong,
    pub ul_max_height: c_ulong,
    pub reserved1: c_ulong,
    pub display_area: CuvidRect,
    pub output_format: c_int,
    pub deinterlace_mode: c_int,
    pub ul_target_width: c_ulong,
    pub ul_target_height: c_ulong,
    pub ul_num_output_surfaces: c_ulong,
    pub vid_lock: *mut c_void,
    pub target_rect: CuvidRect,
    pub enable_histogram: c_ulong,
    pub reserved2: [c_ulong; 4],
}

impl Default for CuvidDecodeCreateInfo {
    fn default() -> Self {
        // SAFETY: All-zeros is valid for this POD struct (null lock, zero sizes).
        unsafe { std::mem::zeroed() }
    }
}

/// `CUVIDRECONFIGUREDECODERINFO`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CuvidReconfigureDecoderInfo {
    pub ul_width: c_uint,
    pub ul_height: c_uint,
    pub ul_target_width: c_uint,
    pub ul_target_height: c_uint,
    pub ul_num_decode_surfaces: c_uint,
    pub reserved1: [c_uint; 12],
    pub display_area: CuvidRect,
    pub target_rect: CuvidRect,
    pub reserved2: [c_uint; 11],
}

impl Default for CuvidReconfigureDecoderInfo {
    fn default() -> Self {
        // SAFETY: All-zeros is valid for this POD struct.
        unsafe { std::mem::zeroed() }
    }
}

/// `CUVIDPROCPARAMS`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CuvidProcParams {
    pub progressive_frame: c_int,
    pub second_field: c_int,
    pub top_field_first: c_int,
    pub unpaired_field: c_int,
    pub reserved_flags: c_uint,
    pub reserved_zero: c_uint,
    pub raw_input_dptr: c_ulonglong,
    pub raw_input_pitch: c_uint,
    pub raw_input_format: c_uint,
    pub raw_output_dptr: c_ulonglong,
    pub raw_output_pitch: c_uint,
    pub reserved1: c_uint,
    pub output_stream: CUstream,
    pub reserved: [c_uint; 46],
    pub histogram_dptr: *mut c_ulonglong,
    pub reserved2: [*mut c_void; 1],
}

impl Default for CuvidProcParams {
    fn default() -> Self {
        // SAFETY: All-zeros is valid for this POD struct.
        unsafe { std::mem::zeroed() }
    }
}

/// `CUVIDDECODECAPS`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CuvidDecodeCaps {
    pub codec_type: c_int,
    pub chroma_format: c_int,
    pub bit_depth_minus8: c_uint,
    pub reserved1: [c_uint; 3],
    pub is_supported: u8,
    pub num_nvdecs: u8,
    pub output_format_mask: c_ushort,
    pub max_width: c_uint,
    pub max_height: c_uint,
    pub max_mb_count: c_uint,
    pub min_width: c_ushort,
    pub min_height: c_ushort,
    pub is_histogram_supported: u8,
    pub counter_bit_depth: u8,
    pub max_histogram_bins: c_ushort,
    pub reserved3: [c_uint; 10],
}

impl Default for CuvidDecodeCaps {
    fn default() -> Self {
        // SAFETY: All-zeros is valid for this POD struct.
        unsafe { std::mem::zeroed() }
    }
}

/// Leading fields of `CUVIDPICPARAMS` that the backend patches in the
/// serialized block received from the bitstream parser.
pub mod pic_params {
    pub const CURR_PIC_IDX: usize = 8;
    pub const BITSTREAM_DATA_LEN: usize = 24;
    pub const BITSTREAM_DATA: usize = 32;
    pub const NUM_SLICES: usize = 40;
    pub const SLICE_DATA_OFFSETS: usize = 48;
    pub const REF_PIC_FLAG: usize = 56;
    pub const INTRA_PIC_FLAG: usize = 60;
    /// Smallest block that contains every patched field.
    pub const HEADER_LEN: usize = 64;
}

// ---------------------------------------------------------------------------
// Function tables
// ---------------------------------------------------------------------------

/// CUDA driver entry points.
pub struct CudaFunctions {
    pub init: unsafe extern "C" fn(c_uint) -> CUresult,
    pub device_get: unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult,
    pub ctx_create: unsafe extern "C" fn(*mut CUcontext, c_uint, CUdevice) -> CUresult,
    pub ctx_destroy: unsafe extern "C" fn(CUcontext) -> CUresult,
    pub ctx_push_current: unsafe extern "C" fn(CUcontext) -> CUresult,
    pub ctx_pop_current: unsafe extern "C" fn(*mut CUcontext) -> CUresult,
    pub stream_create: unsafe extern "C" fn(*mut CUstream, c_uint) -> CUresult,
    pub stream_destroy: unsafe extern "C" fn(CUstream) -> CUresult,
    pub stream_synchronize: unsafe extern "C" fn(CUstream) -> CUresult,
    pub memcpy_2d_async: unsafe extern "C" fn(*const CudaMemcpy2D, CUstream) -> CUresult,
}

/// nvcuvid entry points.
pub struct CuvidFunctions {
    pub create_decoder: unsafe extern "C" fn(*mut CUvideodecoder, *mut CuvidDecodeCreateInfo) -> CUresult,
    pub destroy_decoder: unsafe extern "C" fn(CUvideodecoder) -> CUresult,
    pub decode_picture: unsafe extern "C" fn(CUvideodecoder, *mut c_void) -> CUresult,
    /// Missing from old drivers.
    pub reconfigure_decoder:
        Option<unsafe extern "C" fn(CUvideodecoder, *mut CuvidReconfigureDecoderInfo) -> CUresult>,
    pub map_video_frame: unsafe extern "C" fn(
        CUvideodecoder,
        c_int,
        *mut CUdeviceptr,
        *mut c_uint,
        *mut CuvidProcParams,
    ) -> CUresult,
    pub unmap_video_frame: unsafe extern "C" fn(CUvideodecoder, CUdeviceptr) -> CUresult,
    pub get_decoder_caps: unsafe extern "C" fn(*mut CuvidDecodeCaps) -> CUresult,
}

/// Dynamically loaded CUDA driver and nvcuvid libraries.
pub struct NvdecLibrary {
    /// Library handles -- must live as long as we use any symbols.
    _cuda: Library,
    _cuvid: Library,
    pub cuda: CudaFunctions,
    pub cuvid: CuvidFunctions,
}

// SAFETY: NvdecLibrary holds library handles and plain function pointers.
// The Library values keep the shared objects loaded; the driver functions
// are thread-safe as long as callers serialize per-context work, which the
// decoder context's device lock does.
unsafe impl Send for NvdecLibrary {}
unsafe impl Sync for NvdecLibrary {}

impl std::fmt::Debug for NvdecLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvdecLibrary")
            .field("reconfigure", &self.cuvid.reconfigure_decoder.is_some())
            .finish()
    }
}

/// Look up `name` and copy out the function pointer.
///
/// # Safety
/// `T` must match the C signature of the symbol.
unsafe fn symbol<T: Copy>(lib: &Library, name: &str) -> Result<T, DeviceError> {
    let cname = format!("{name}\0");
    // SAFETY: Upheld by the caller; the pointer is copied out of the Symbol and
    // stays valid while `lib` is loaded.
    unsafe { lib.get::<T>(cname.as_bytes()) }
        .map(|sym| *sym)
        .map_err(|e| DeviceError::SymbolNotFound(format!("{name}: {e}")))
}

impl NvdecLibrary {
    /// Load both libraries from the default system paths and initialize the driver.
    pub fn load() -> Result<Self, DeviceError> {
        let (cuda_name, cuvid_name) = Self::library_names();
        info!(cuda = cuda_name, cuvid = cuvid_name, "Loading NVDEC libraries");

        // SAFETY: Loading well-known NVIDIA driver libraries, which only
        // register driver entry points on load.
        let cuda_lib = unsafe { Library::new(cuda_name) }.map_err(|e| {
            DeviceError::LibraryNotFound(format!(
                "Failed to load {cuda_name}: {e}. Is the NVIDIA driver installed?"
            ))
        })?;
        // SAFETY: As above.
        let cuvid_lib = unsafe { Library::new(cuvid_name) }.map_err(|e| {
            DeviceError::LibraryNotFound(format!("Failed to load {cuvid_name}: {e}"))
        })?;

        // SAFETY: Every symbol below is a documented CUDA driver / nvcuvid
        // entry point; the field types match `cuda.h` and `cuviddec.h`. The
        // libraries are stored alongside the pointers.
        let (cuda, cuvid) = unsafe {
            let cuda = CudaFunctions {
                init: symbol(&cuda_lib, "cuInit")?,
                device_get: symbol(&cuda_lib, "cuDeviceGet")?,
                ctx_create: symbol(&cuda_lib, "cuCtxCreate_v2")?,
                ctx_destroy: symbol(&cuda_lib, "cuCtxDestroy_v2")?,
                ctx_push_current: symbol(&cuda_lib, "cuCtxPushCurrent_v2")?,
                ctx_pop_current: symbol(&cuda_lib, "cuCtxPopCurrent_v2")?,
                stream_create: symbol(&cuda_lib, "cuStreamCreate")?,
                stream_destroy: symbol(&cuda_lib, "cuStreamDestroy_v2")?,
                stream_synchronize: symbol(&cuda_lib, "cuStreamSynchronize")?,
                memcpy_2d_async: symbol(&cuda_lib, "cuMemcpy2DAsync_v2")?,
            };
            let cuvid = CuvidFunctions {
                create_decoder: symbol(&cuvid_lib, "cuvidCreateDecoder")?,
                destroy_decoder: symbol(&cuvid_lib, "cuvidDestroyDecoder")?,
                decode_picture: symbol(&cuvid_lib, "cuvidDecodePicture")?,
                reconfigure_decoder: symbol(&cuvid_lib, "cuvidReconfigureDecoder").ok(),
                map_video_frame: symbol(&cuvid_lib, "cuvidMapVideoFrame64")?,
                unmap_video_frame: symbol(&cuvid_lib, "cuvidUnmapVideoFrame64")?,
                get_decoder_caps: symbol(&cuvid_lib, "cuvidGetDecoderCaps")?,
            };
            (cuda, cuvid)
        };

        // SAFETY: cuInit takes a flags word that must be 0.
        let status = unsafe { (cuda.init)(0) };
        if status != 0 {
            return Err(DeviceError::DeviceUnavailable {
                ordinal: 0,
                status: nvd_common::DriverStatus(status),
            });
        }

        debug!(
            reconfigure = cuvid.reconfigure_decoder.is_some(),
            "NVDEC libraries loaded"
        );

        Ok(Self {
            _cuda: cuda_lib,
            _cuvid: cuvid_lib,
            cuda,
            cuvid,
        })
    }

    /// Platform-specific library names (CUDA driver, nvcuvid).
    fn library_names() -> (&'static str, &'static str) {
        if cfg!(target_os = "windows") {
            ("nvcuda.dll", "nvcuvid.dll")
        } else {
            ("libcuda.so.1", "libnvcuvid.so.1")
        }
    }
}

// ── Tests ──
