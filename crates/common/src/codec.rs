//! Video codec identifiers accepted by the hardware decoder.

use serde::{Deserialize, Serialize};

/// Video codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    Mpeg1,
    Mpeg2,
    Mpeg4,
    Vc1,
    H264,
    Jpeg,
    H265,
    Vp8,
    Vp9,
    Av1,
}

impl VideoCodec {
    /// Every codec the decode engine knows about, in probe order.
    pub const ALL: [VideoCodec; 10] = [
        Self::Mpeg1,
        Self::Mpeg2,
        Self::Mpeg4,
        Self::Vc1,
        Self::H264,
        Self::Jpeg,
        Self::H265,
        Self::Vp8,
        Self::Vp9,
        Self::Av1,
    ];

    /// Human-readable name (for display/logging).
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Mpeg1 => "MPEG-1",
            Self::Mpeg2 => "MPEG-2",
            Self::Mpeg4 => "MPEG-4 Part 2",
            Self::Vc1 => "VC-1",
            Self::H264 => "H.264/AVC",
            Self::Jpeg => "JPEG",
            Self::H265 => "H.265/HEVC",
            Self::Vp8 => "VP8",
            Self::Vp9 => "VP9",
            Self::Av1 => "AV1",
        }
    }

    /// Decode surfaces to allocate on top of the parser's DPB requirement.
    ///
    /// H.264 needs one extra slot for the picture currently being decoded.
    pub fn extra_decode_surfaces(self) -> u32 {
        match self {
            Self::H264 => 1,
            _ => 0,
        }
    }
}
