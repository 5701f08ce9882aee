//! Central error types for the decode engine (thiserror-based).

use std::fmt;

use thiserror::Error;

use crate::codec::VideoCodec;
use crate::color::PixelFormat;
use crate::types::DevicePtr;

/// Raw status code returned by the driver (CUDA `CUresult` numbering).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DriverStatus(pub i32);

impl DriverStatus {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_VALUE: Self = Self(1);
    pub const OUT_OF_MEMORY: Self = Self(2);
    pub const NOT_INITIALIZED: Self = Self(3);
    pub const NO_DEVICE: Self = Self(100);
    pub const INVALID_DEVICE: Self = Self(101);
    pub const INVALID_CONTEXT: Self = Self(201);
    pub const MAP_FAILED: Self = Self(205);
    pub const UNMAP_FAILED: Self = Self(206);
    pub const INVALID_HANDLE: Self = Self(400);
    pub const NOT_SUPPORTED: Self = Self(801);
    pub const UNKNOWN: Self = Self(999);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Converts a raw driver return code into a `Result`.
    pub fn check(code: i32) -> Result<(), DriverStatus> {
        if code == 0 {
            Ok(())
        } else {
            Err(Self(code))
        }
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "CUDA_SUCCESS",
            1 => "CUDA_ERROR_INVALID_VALUE",
            2 => "CUDA_ERROR_OUT_OF_MEMORY",
            3 => "CUDA_ERROR_NOT_INITIALIZED",
            100 => "CUDA_ERROR_NO_DEVICE",
            101 => "CUDA_ERROR_INVALID_DEVICE",
            201 => "CUDA_ERROR_INVALID_CONTEXT",
            205 => "CUDA_ERROR_MAP_FAILED",
            206 => "CUDA_ERROR_UNMAP_FAILED",
            400 => "CUDA_ERROR_INVALID_HANDLE",
            801 => "CUDA_ERROR_NOT_SUPPORTED",
            _ => "CUDA_ERROR_UNKNOWN",
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// A blocking pool operation was abandoned because the pool is flushing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation cancelled: surface pool is flushing")]
pub struct Cancelled;

/// Device, context, and decoder-instance setup errors.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    #[error("Required symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Device {ordinal} unavailable: {status}")]
    DeviceUnavailable { ordinal: u32, status: DriverStatus },

    #[error("Stream creation failed: {0}")]
    StreamCreation(DriverStatus),

    #[error("HW decoder creation failed for {codec:?}: {status}")]
    DecoderCreation {
        codec: VideoCodec,
        status: DriverStatus,
    },

    #[error("Unsupported stream: {codec:?} {format:?}: {reason}")]
    Unsupported {
        codec: VideoCodec,
        format: Option<PixelFormat>,
        reason: String,
    },

    #[error("Invalid decoder configuration: {0}")]
    InvalidConfig(String),

    #[error("Decoder context is closed")]
    ContextClosed,
}

/// Hardware decode submission errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Decode failed on surface {index}: {status}")]
    DecodeFailed { index: u32, status: DriverStatus },

    #[error("Decoder is not configured")]
    NotConfigured,
}

/// Mapping, unmapping, and export errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("Map cancelled: surface pool is flushing")]
    Cancelled,

    #[error("Mapping surface {index} failed: {status}")]
    MapFailed { index: u32, status: DriverStatus },

    #[error("Unmapping {ptr} failed: {status}")]
    UnmapFailed { ptr: DevicePtr, status: DriverStatus },

    #[error("Surface {index} is not mapped")]
    NotMapped { index: u32 },

    #[error("Surface {index} is already mapped")]
    AlreadyMapped { index: u32 },
}

impl From<Cancelled> for MapError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Errors from the frame-level protocol (new picture, decode, output).
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Map error: {0}")]
    Map(#[from] MapError),

    #[error("Device-to-host copy failed: {0}")]
    CopyFailed(DriverStatus),
}

impl FrameError {
    /// True when the error only reflects a flush in progress.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::Map(MapError::Cancelled))
    }
}

pub type FrameResult<T> = Result<T, FrameError>;
