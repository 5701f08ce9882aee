//! `nvd-common` — Shared types, traits, and errors for the hardware video decode engine.
//!
//! This crate is the foundation the decoder crate depends on.
//! It defines the core vocabulary:
//!
//! - **Types**: `Resolution`, `DevicePtr`, `DeviceMapping`, `FrameGeometry` (newtypes for safety)
//! - **Device trait**: `DecodeDevice` (hardware backend abstraction)
//! - **Errors**: `DeviceError`, `DecodeError`, `MapError`, `Cancelled`, `FrameError` (thiserror-based)
//! - **Config**: `DecoderSettings`, `DecoderConfig`, `OutputBudgetPolicy`

pub mod codec;
pub mod color;
pub mod config;
pub mod error;
pub mod gpu_traits;
pub mod types;

// Re-export commonly used items at crate root
pub use codec::VideoCodec;
pub use color::{ChromaFormat, PixelFormat};
pub use config::{DecoderConfig, DecoderSettings, OutputBudgetPolicy, DEFAULT_OUTPUT_MARGIN};
pub use error::{
    Cancelled, DecodeError, DeviceError, DriverStatus, FrameError, FrameResult, MapError,
};
pub use gpu_traits::{
    DecodeDevice, DecoderCaps, DecoderCreateInfo, DeviceCopy, PictureParams, ReconfigureInfo,
};
pub use types::{
    ContextHandle, DecoderHandle, DeviceMapping, DevicePtr, FrameGeometry, HostPlane, Resolution,
    StreamHandle,
};
