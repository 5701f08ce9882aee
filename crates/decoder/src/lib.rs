//! `nvd-decoder` — Hardware video decode surfaces, output budget, and zero-copy export.
//!
//! Manages the pool of hardware decode surfaces a video decoder writes into,
//! bounds how many of them are mapped for output at once, and hands mapped
//! surfaces to consumers without copying.
//!
//! # Architecture
//!
//! Decoding runs against a [`DecodeDevice`](nvd_common::DecodeDevice): the
//! NVDEC backend loads the NVIDIA libraries at runtime, and an emulated
//! device keeps everything in host memory.
//!
//! ## Module Overview
//!
//! - [`context`] — Decoder context: device context, stream, and device lock
//! - [`driver`] — Decode driver: one hardware decoder instance
//! - [`surface`] / [`pool`] — Surfaces, blocking acquire, map budget, epochs
//! - [`export`] — Zero-copy export and the output memory cache
//! - [`reconfigure`] — In-place resolution changes
//! - [`caps`] — Memoized device capabilities
//! - [`decoder`] — `NvDecoder`, the per-stream frame protocol
//! - [`nvdec`] — NVDEC backend
//! - [`emulated`] — Host-memory backend
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use nvd_common::{DecoderConfig, PixelFormat, Resolution, VideoCodec};
//! use nvd_decoder::{CapsCache, EmulatedDevice, NvDecoder, OutputKind};
//!
//! let decoder = NvDecoder::new(
//!     Arc::new(EmulatedDevice::new()),
//!     Arc::new(CapsCache::new()),
//!     Default::default(),
//! );
//! decoder.open()?;
//! decoder.set_output_kind(OutputKind::Device);
//! decoder.configure(&DecoderConfig::new(VideoCodec::H265, PixelFormat::Nv12, Resolution::HD))?;
//!
//! let surface = decoder.new_picture()?;
//! decoder.decode(&surface, &picture_params)?;
//! let frame = decoder.output_picture(surface)?;
//! ```

pub mod caps;
pub mod context;
pub mod decoder;
pub mod driver;
pub mod emulated;
pub mod export;
pub mod nvdec;
pub mod pool;
pub mod reconfigure;
pub mod surface;

pub use caps::{CapsCache, CodecCaps};
pub use context::DecoderContext;
pub use decoder::{max_output_size, DecodedFrame, HostFrame, NvDecoder, OutputKind};
pub use driver::DecodeDriver;
pub use emulated::{EmulatedCounters, EmulatedDevice, OutputSlotPolicy};
pub use export::ExportedMemory;
pub use pool::{PoolOptions, PoolStats, SurfacePool};
pub use reconfigure::ReconfigureRequest;
pub use surface::Surface;
