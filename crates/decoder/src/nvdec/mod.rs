//! NVDEC hardware decode backend.
//!
//! The CUDA driver (`libcuda`) and nvcuvid (`libnvcuvid`) are loaded
//! dynamically at runtime, so the application can fall back to another
//! device on hosts without NVIDIA hardware.
//!
//! # Module Structure
//!
//! - [`ffi`] — Raw FFI bindings (loaded via `libloading`).
//! - [`device`] — [`NvdecDevice`], the `DecodeDevice` implementation.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use nvd_decoder::nvdec::NvdecDevice;
//! use nvd_decoder::{CapsCache, NvDecoder};
//!
//! let device = Arc::new(NvdecDevice::load()?);
//! let decoder = NvDecoder::new(device, Arc::new(CapsCache::new()), Default::default());
//! decoder.open()?;
//! ```

pub mod device;
pub mod ffi;

pub use device::NvdecDevice;
pub use ffi::NvdecLibrary;
