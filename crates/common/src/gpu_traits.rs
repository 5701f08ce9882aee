//! Hardware decode device abstraction.
//!
//! The surface pool, decode driver, and frame orchestrator program against
//! [`DecodeDevice`], not against a concrete backend. The NVDEC backend loads
//! the vendor libraries at runtime; the emulated backend keeps everything in
//! host memory.

use std::fmt;

use crate::codec::VideoCodec;
use crate::color::{ChromaFormat, PixelFormat};
use crate::error::DriverStatus;
use crate::types::{ContextHandle, DecoderHandle, DevicePtr, Resolution, StreamHandle};

/// Parameters for creating a hardware decoder instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderCreateInfo {
    pub codec: VideoCodec,
    pub format: PixelFormat,
    pub bit_depth: u32,
    /// Coded picture size.
    pub coded: Resolution,
    /// Visible area cropped out of the coded picture.
    pub display: Resolution,
    /// Post-processed output size (even).
    pub target: Resolution,
    /// Upper bound for in-place reconfiguration.
    pub max: Resolution,
    /// Decode surfaces (slots) the hardware allocates.
    pub num_decode_surfaces: u32,
    /// Output surfaces that may be mapped simultaneously.
    pub num_output_surfaces: u32,
}

/// Parameters for reconfiguring a decoder without recreating it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconfigureInfo {
    pub coded: Resolution,
    pub display: Resolution,
    pub target: Resolution,
    pub num_decode_surfaces: u32,
}

/// Per-picture decode parameters produced by the (external) bitstream parser.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureParams {
    /// Serialized driver picture-parameter block. The backend patches in the
    /// target slot index before submission.
    pub raw: Vec<u8>,
    /// Slice data for this picture.
    pub bitstream: Vec<u8>,
    pub slice_offsets: Vec<u32>,
    pub intra: bool,
    pub reference: bool,
}

/// One strided device-to-host plane copy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceCopy {
    pub src: DevicePtr,
    pub src_pitch: u32,
    pub dst_offset: usize,
    pub dst_stride: usize,
    pub width_bytes: usize,
    pub rows: usize,
}

/// Hardware support for one (codec, chroma, bit depth) combination.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderCaps {
    pub supported: bool,
    pub min: Resolution,
    pub max: Resolution,
    pub max_macroblocks: u32,
    pub output_formats: Vec<PixelFormat>,
}

/// A device able to decode video pictures into hardware surfaces.
///
/// Every call that touches a context receives its handle; implementations make
/// it current for the duration of the call. Callers serialize calls on the same
/// context with the decoder context's device lock.
pub trait DecodeDevice: Send + Sync + fmt::Debug {
    /// Backend name (for logging).
    fn name(&self) -> &str;

    // -- Context / stream lifecycle --

    fn open_context(&self, ordinal: u32) -> Result<ContextHandle, DriverStatus>;

    fn close_context(&self, ctx: ContextHandle) -> Result<(), DriverStatus>;

    fn create_stream(&self, ctx: ContextHandle) -> Result<StreamHandle, DriverStatus>;

    fn destroy_stream(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<(), DriverStatus>;

    // -- Decoder instance --

    fn create_decoder(
        &self,
        ctx: ContextHandle,
        info: &DecoderCreateInfo,
    ) -> Result<DecoderHandle, DriverStatus>;

    fn destroy_decoder(&self, ctx: ContextHandle, decoder: DecoderHandle) -> Result<(), DriverStatus>;

    /// Submit one picture for decoding into decode slot `slot`.
    fn decode_picture(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        slot: u32,
        params: &PictureParams,
    ) -> Result<(), DriverStatus>;

    /// Whether `reconfigure_decoder` is available (driver/library dependent).
    fn supports_reconfigure(&self) -> bool;

    fn reconfigure_decoder(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        info: &ReconfigureInfo,
    ) -> Result<(), DriverStatus>;

    // -- Output --

    /// Map the picture in decode slot `slot` into an output surface.
    /// Returns the device pointer and row pitch.
    fn map_frame(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        slot: u32,
        stream: StreamHandle,
    ) -> Result<(DevicePtr, u32), DriverStatus>;

    fn unmap_frame(
        &self,
        ctx: ContextHandle,
        decoder: DecoderHandle,
        ptr: DevicePtr,
    ) -> Result<(), DriverStatus>;

    /// Enqueue a strided copy from device memory into `dst`.
    fn copy_to_host(
        &self,
        ctx: ContextHandle,
        stream: StreamHandle,
        copy: &DeviceCopy,
        dst: &mut [u8],
    ) -> Result<(), DriverStatus>;

    /// Wait for all work queued on `stream`.
    fn synchronize(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<(), DriverStatus>;

    // -- Capabilities --

    fn decoder_caps(
        &self,
        ordinal: u32,
        codec: VideoCodec,
        chroma: ChromaFormat,
        bit_depth: u32,
    ) -> Result<DecoderCaps, DriverStatus>;
}
