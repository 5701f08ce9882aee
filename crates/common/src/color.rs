//! Pixel formats produced by the hardware decoder and their plane geometry.

use serde::{Deserialize, Serialize};

/// Chroma subsampling of the coded stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChromaFormat {
    Yuv420,
    Yuv444,
}

impl ChromaFormat {
    pub const ALL: [ChromaFormat; 2] = [Self::Yuv420, Self::Yuv444];
}

/// Output pixel format of a decoded surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// NV12: Y plane + interleaved UV at half resolution.
    Nv12,
    /// P010: 10-bit NV12 variant in 16-bit containers.
    P010,
    /// P012: 12-bit NV12 variant in 16-bit containers.
    P012,
    /// Planar 4:4:4, 8 bits per sample.
    Y444,
    /// Planar 4:4:4, 10/12 bits in 16-bit containers.
    Y444_16,
}

impl PixelFormat {
    /// Output format for a (chroma, bit depth) combination, if the decoder can emit one.
    pub fn for_stream(chroma: ChromaFormat, bit_depth: u32) -> Option<Self> {
        match (chroma, bit_depth) {
            (ChromaFormat::Yuv420, 8) => Some(Self::Nv12),
            (ChromaFormat::Yuv420, 10) => Some(Self::P010),
            (ChromaFormat::Yuv420, 12) => Some(Self::P012),
            (ChromaFormat::Yuv444, 8) => Some(Self::Y444),
            (ChromaFormat::Yuv444, 10 | 12) => Some(Self::Y444_16),
            _ => None,
        }
    }

    pub fn chroma(self) -> ChromaFormat {
        match self {
            Self::Nv12 | Self::P010 | Self::P012 => ChromaFormat::Yuv420,
            Self::Y444 | Self::Y444_16 => ChromaFormat::Yuv444,
        }
    }

    /// Nominal bit depth of the samples.
    pub fn bit_depth(self) -> u32 {
        match self {
            Self::Nv12 | Self::Y444 => 8,
            Self::P010 => 10,
            Self::P012 => 12,
            Self::Y444_16 => 16,
        }
    }

    /// Bytes per stored sample (8-bit or 16-bit container).
    pub fn bytes_per_sample(self) -> u32 {
        match self {
            Self::Nv12 | Self::Y444 => 1,
            Self::P010 | Self::P012 | Self::Y444_16 => 2,
        }
    }

    pub fn plane_count(self) -> u32 {
        match self.chroma() {
            ChromaFormat::Yuv420 => 2,
            ChromaFormat::Yuv444 => 3,
        }
    }

    /// Rows in `plane` for a picture `height` rows tall.
    pub fn plane_height(self, plane: u32, height: u32) -> u32 {
        match (self.chroma(), plane) {
            (ChromaFormat::Yuv420, 1) => height.div_ceil(2),
            _ => height,
        }
    }

    /// Bytes in one row of any plane. The interleaved UV plane of 4:2:0
    /// formats is as wide as the luma plane.
    pub fn row_bytes(self, width: u32) -> u32 {
        width * self.bytes_per_sample()
    }
}
