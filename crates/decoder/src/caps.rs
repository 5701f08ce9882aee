//! Device capability cache.
//!
//! Probing decoder capabilities costs a driver round trip per (chroma, bit
//! depth) combination, so results are memoized per (device ordinal, codec).
//! The cache is an ordinary value owned by whoever creates decoders and
//! shared through `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use nvd_common::{
    ChromaFormat, DecodeDevice, DeviceError, PixelFormat, Resolution, VideoCodec,
};

/// Bit depths probed for every chroma format.
const PROBE_BIT_DEPTHS: [u32; 3] = [8, 10, 12];

/// What one device can decode for one codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecCaps {
    pub codec: VideoCodec,
    /// Smallest coded size accepted by any supported format.
    pub min: Resolution,
    /// Largest coded size accepted by any supported format.
    pub max: Resolution,
    /// Output formats, in probe order, without duplicates.
    pub formats: Vec<PixelFormat>,
}

impl CodecCaps {
    pub fn supports(&self, format: PixelFormat) -> bool {
        self.formats.contains(&format)
    }

    /// Whether a coded size is inside the device limits.
    pub fn accepts(&self, coded: Resolution) -> bool {
        coded.fits_within(self.max) && self.min.fits_within(coded)
    }
}

#[derive(Default)]
pub struct CapsCache {
    entries: RwLock<HashMap<(u32, VideoCodec), Arc<CodecCaps>>>,
}

impl std::fmt::Debug for CapsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsCache")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl CapsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached capabilities, probing the device on first use.
    pub fn get_or_probe(
        &self,
        device: &dyn DecodeDevice,
        ordinal: u32,
        codec: VideoCodec,
    ) -> Result<Arc<CodecCaps>, DeviceError> {
        let key = (ordinal, codec);
        if let Some(caps) = self.entries.read().get(&key) {
            return Ok(Arc::clone(caps));
        }

        let mut entries = self.entries.write();
        if let Some(caps) = entries.get(&key) {
            return Ok(Arc::clone(caps));
        }
        let caps = Arc::new(probe(device, ordinal, codec)?);
        entries.insert(key, Arc::clone(&caps));
        Ok(caps)
    }

    pub fn get(&self, ordinal: u32, codec: VideoCodec) -> Option<Arc<CodecCaps>> {
        self.entries.read().get(&(ordinal, codec)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

fn probe(device: &dyn DecodeDevice, ordinal: u32, codec: VideoCodec) -> Result<CodecCaps, DeviceError> {
    let mut min: Option<Resolution> = None;
    let mut max = Resolution::default();
    let mut formats = Vec::new();

    for chroma in ChromaFormat::ALL {
        for bit_depth in PROBE_BIT_DEPTHS {
            let caps = match device.decoder_caps(ordinal, codec, chroma, bit_depth) {
                Ok(caps) => caps,
                Err(status) => {
                    trace!(?codec, ?chroma, bit_depth, %status, "Caps query failed");
                    continue;
                }
            };
            if !caps.supported {
                continue;
            }
            min = Some(match min {
                Some(m) => Resolution::new(m.width.min(caps.min.width), m.height.min(caps.min.height)),
                None => caps.min,
            });
            max = max.max(caps.max);
            let native = PixelFormat::for_stream(chroma, bit_depth);
            for format in native.into_iter().chain(caps.output_formats) {
                if !formats.contains(&format) {
                    formats.push(format);
                }
            }
        }
    }

    let Some(min) = min else {
        return Err(DeviceError::Unsupported {
            codec,
            format: None,
            reason: format!("device {ordinal} reports no decode support"),
        });
    };

    debug!(?codec, ordinal, %min, %max, ?formats, "Probed decoder caps");
    Ok(CodecCaps {
        codec,
        min,
        max,
        formats,
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedDevice;

    #[test]
    fn probes_once_per_codec() {
        let device = EmulatedDevice::new();
        let cache = CapsCache::new();

        let caps = cache.get_or_probe(&device, 0, VideoCodec::H265).unwrap();
        assert!(caps.supports(PixelFormat::Nv12));
        assert!(caps.supports(PixelFormat::P010));
        assert!(caps.accepts(Resolution::UHD));
        let queries = device.counters().caps_queries;
        assert_eq!(queries, 6);

        let again = cache.get_or_probe(&device, 0, VideoCodec::H265).unwrap();
        assert!(Arc::ptr_eq(&caps, &again));
        assert_eq!(device.counters().caps_queries, queries);

        cache.get_or_probe(&device, 0, VideoCodec::Vp9).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn unsupported_codec() {
        let device = EmulatedDevice::new().with_codecs(&[VideoCodec::H264]);
        let cache = CapsCache::new();
        let err = cache.get_or_probe(&device, 0, VideoCodec::Av1).unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported { codec: VideoCodec::Av1, .. }));
        assert!(cache.is_empty());
    }
}
