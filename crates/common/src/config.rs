//! Decoder settings (user-tunable) and per-stream decoder configuration.

use serde::{Deserialize, Serialize};

use crate::codec::VideoCodec;
use crate::color::PixelFormat;
use crate::error::DeviceError;
use crate::types::Resolution;

/// Default headroom between downstream's minimum buffer count and the map budget.
pub const DEFAULT_OUTPUT_MARGIN: u32 = 2;

/// User-tunable decoder settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    /// CUDA device ordinal.
    pub device_ordinal: u32,
    /// Requested simultaneously-mapped output surfaces (0 = auto).
    pub num_output_surfaces: u32,
    /// Extra mapped surfaces on top of downstream's minimum in auto mode.
    pub output_margin: u32,
    /// Initial maximum width, so later resolution changes can reconfigure in place (0 = coded).
    pub init_max_width: u32,
    /// Initial maximum height (0 = coded).
    pub init_max_height: u32,
    /// Keep exporting zero-copy even when every output slot is in use,
    /// blocking until downstream returns one.
    pub wait_on_pool_full: bool,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            device_ordinal: 0,
            num_output_surfaces: 0,
            output_margin: DEFAULT_OUTPUT_MARGIN,
            init_max_width: 0,
            init_max_height: 0,
            wait_on_pool_full: false,
        }
    }
}

impl DecoderSettings {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn budget_policy(&self) -> OutputBudgetPolicy {
        OutputBudgetPolicy {
            requested: self.num_output_surfaces,
            margin: self.output_margin,
        }
    }
}

/// Resolves how many surfaces may be mapped at once.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBudgetPolicy {
    /// User-requested count (0 = auto).
    pub requested: u32,
    pub margin: u32,
}

impl Default for OutputBudgetPolicy {
    fn default() -> Self {
        Self {
            requested: 0,
            margin: DEFAULT_OUTPUT_MARGIN,
        }
    }
}

impl OutputBudgetPolicy {
    /// The larger of the user's request and `downstream_min + margin`, never below 1.
    pub fn resolve(&self, downstream_min: u32) -> u32 {
        self.requested
            .max(downstream_min.saturating_add(self.margin))
            .max(1)
    }
}

/// Per-stream decoder configuration, as produced by the bitstream parser.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub codec: VideoCodec,
    pub format: PixelFormat,
    /// Visible picture size.
    pub display: Resolution,
    /// Coded (macroblock-aligned) picture size.
    pub coded: Resolution,
    pub coded_bit_depth: u32,
    /// Decode surfaces the stream needs (DPB size plus current picture).
    pub pool_size: u32,
    /// Allocate a second, decode-only surface per picture (film grain, etc.).
    pub alloc_aux_frame: bool,
}

impl DecoderConfig {
    pub fn new(codec: VideoCodec, format: PixelFormat, display: Resolution) -> Self {
        Self {
            codec,
            format,
            display,
            coded: display,
            coded_bit_depth: format.bit_depth().min(12),
            pool_size: 8,
            alloc_aux_frame: false,
        }
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.pool_size == 0 {
            return Err(DeviceError::InvalidConfig("pool size must be > 0".into()));
        }
        if self.display.is_empty() {
            return Err(DeviceError::InvalidConfig(format!(
                "empty display size {}",
                self.display
            )));
        }
        if !self.display.fits_within(self.coded) {
            return Err(DeviceError::InvalidConfig(format!(
                "coded size {} smaller than display size {}",
                self.coded, self.display
            )));
        }
        if self.coded_bit_depth < 8 {
            return Err(DeviceError::InvalidConfig(format!(
                "invalid coded bit depth {}",
                self.coded_bit_depth
            )));
        }
        Ok(())
    }

    /// Decode surfaces to allocate: pool size plus codec extras, doubled for aux frames.
    pub fn decode_surface_count(&self) -> u32 {
        let base = self.pool_size + self.codec.extra_decode_surfaces();
        if self.alloc_aux_frame {
            base * 2
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_and_json() {
        let s = DecoderSettings::default();
        assert_eq!(s.output_margin, 2);
        assert_eq!(s.num_output_surfaces, 0);

        let s = DecoderSettings::from_json(r#"{"num_output_surfaces": 6, "wait_on_pool_full": true}"#)
            .unwrap();
        assert_eq!(s.num_output_surfaces, 6);
        assert!(s.wait_on_pool_full);
        assert_eq!(s.output_margin, 2);

        let back = DecoderSettings::from_json(&s.to_json().unwrap()).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn budget_policy() {
        let auto = OutputBudgetPolicy::default();
        assert_eq!(auto.resolve(0), 2);
        assert_eq!(auto.resolve(4), 6);

        let fixed = OutputBudgetPolicy { requested: 8, margin: 2 };
        assert_eq!(fixed.resolve(3), 8);
        assert_eq!(fixed.resolve(10), 12);

        let none = OutputBudgetPolicy { requested: 0, margin: 0 };
        assert_eq!(none.resolve(0), 1);
    }

    #[test]
    fn config_validation() {
        let mut cfg = DecoderConfig::new(VideoCodec::H264, PixelFormat::Nv12, Resolution::HD);
        cfg.coded = Resolution::new(1920, 1088);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.decode_surface_count(), 9);

        cfg.alloc_aux_frame = true;
        assert_eq!(cfg.decode_surface_count(), 18);

        cfg.coded = Resolution::new(1280, 720);
        assert!(matches!(cfg.validate(), Err(DeviceError::InvalidConfig(_))));

        let mut cfg = DecoderConfig::new(VideoCodec::Vp9, PixelFormat::Nv12, Resolution::HD);
        cfg.pool_size = 0;
        assert!(cfg.validate().is_err());
    }
}
