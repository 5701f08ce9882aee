//! Core types with newtype pattern for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::color::PixelFormat;

/// Picture dimensions in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self {
        width: 1920,
        height: 1080,
    };
    pub const UHD: Self = Self {
        width: 3840,
        height: 2160,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Both dimensions rounded up to the next even value (4:2:0 output targets).
    pub fn round_up_even(self) -> Self {
        Self {
            width: self.width.next_multiple_of(2),
            height: self.height.next_multiple_of(2),
        }
    }

    /// Component-wise maximum.
    pub fn max(self, other: Self) -> Self {
        Self {
            width: self.width.max(other.width),
            height: self.height.max(other.height),
        }
    }

    /// True when both dimensions are less than or equal to `bound`.
    pub fn fits_within(self, bound: Self) -> bool {
        self.width <= bound.width && self.height <= bound.height
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Device-resident address. Opaque: never dereferenceable from the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A decoded picture mapped into device-addressable memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceMapping {
    pub ptr: DevicePtr,
    /// Row pitch in bytes, shared by every plane.
    pub pitch: u32,
    /// Total bytes spanned by all planes.
    pub len: usize,
}

/// Driver context handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Driver stream (command queue) handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Hardware decoder instance handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DecoderHandle(pub u64);

/// One plane of a tightly packed host frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HostPlane {
    pub offset: usize,
    pub stride: usize,
    pub rows: usize,
}

/// Geometry of one decoded picture, on the device and once copied to the host.
///
/// Device planes are stacked `pitch * aligned_height` bytes apart; host planes
/// are packed with `stride == row_bytes(display.width)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub format: PixelFormat,
    pub display: Resolution,
    /// Rows per plane slot in device memory (the decoder's target height).
    pub aligned_height: u32,
}

impl FrameGeometry {
    pub fn new(format: PixelFormat, display: Resolution, aligned_height: u32) -> Self {
        Self {
            format,
            display,
            aligned_height: aligned_height.max(display.height),
        }
    }

    /// Byte offset of `plane` from the start of a mapped surface.
    pub fn device_plane_offset(&self, plane: u32, pitch: u32) -> u64 {
        plane as u64 * pitch as u64 * self.aligned_height as u64
    }

    /// Bytes spanned by a mapped surface with the given pitch.
    pub fn device_len(&self, pitch: u32) -> usize {
        let last = self.format.plane_count() - 1;
        let tail = pitch as u64 * self.format.plane_height(last, self.aligned_height) as u64;
        (self.device_plane_offset(last, pitch) + tail) as usize
    }

    /// Packed host plane layout.
    pub fn host_planes(&self) -> Vec<HostPlane> {
        let stride = self.format.row_bytes(self.display.width) as usize;
        let mut offset = 0;
        (0..self.format.plane_count())
            .map(|plane| {
                let rows = self.format.plane_height(plane, self.display.height) as usize;
                let p = HostPlane {
                    offset,
                    stride,
                    rows,
                };
                offset += stride * rows;
                p
            })
            .collect()
    }

    /// Total bytes of a packed host frame.
    pub fn host_len(&self) -> usize {
        self.host_planes()
            .last()
            .map(|p| p.offset + p.stride * p.rows)
            .unwrap_or(0)
    }
}
