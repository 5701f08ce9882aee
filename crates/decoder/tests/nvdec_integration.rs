//! Hardware tests for the NVDEC backend.
//!
//! These need an NVIDIA GPU and driver, so they are marked `#[ignore]` and
//! skip themselves when the libraries cannot be loaded:
//!
//! ```bash
//! cargo test -p nvd-decoder --test nvdec_integration -- --ignored
//! ```
//!
//! The non-ignored tests cover library loading behavior that works on any
//! machine.

use std::sync::Arc;

use nvd_common::{
    DecodeDevice, DecoderConfig, DecoderSettings, PixelFormat, Resolution, VideoCodec,
};
use nvd_decoder::nvdec::NvdecDevice;
use nvd_decoder::{CapsCache, DecoderContext, NvDecoder, OutputKind};

fn device_or_skip() -> Option<Arc<NvdecDevice>> {
    match NvdecDevice::load() {
        Ok(device) => Some(Arc::new(device)),
        Err(e) => {
            eprintln!("Skipping: NVDEC unavailable ({e})");
            None
        }
    }
}

#[test]
fn load_reports_a_typed_error_without_driver() {
    // Either outcome is fine; loading must not panic.
    match NvdecDevice::load() {
        Ok(device) => assert_eq!(device.name(), "nvdec"),
        Err(e) => assert!(!e.to_string().is_empty()),
    }
}

#[test]
#[ignore = "requires NVIDIA GPU"]
fn context_opens_and_closes() {
    let Some(device) = device_or_skip() else {
        return;
    };
    let context = DecoderContext::create(device, 0).expect("context");
    assert!(context.is_open());
    context.destroy();
    assert!(!context.is_open());
    context.destroy();
}

#[test]
#[ignore = "requires NVIDIA GPU"]
fn h264_caps_include_nv12() {
    let Some(device) = device_or_skip() else {
        return;
    };
    let caps = CapsCache::new();
    let h264 = caps.get_or_probe(device.as_ref(), 0, VideoCodec::H264).expect("caps");
    assert!(h264.supports(PixelFormat::Nv12));
    assert!(h264.accepts(Resolution::HD));

    // Second lookup is served from the cache.
    let again = caps.get_or_probe(device.as_ref(), 0, VideoCodec::H264).unwrap();
    assert!(Arc::ptr_eq(&h264, &again));
}

#[test]
#[ignore = "requires NVIDIA GPU"]
fn pool_maps_within_budget_on_hardware() {
    let Some(device) = device_or_skip() else {
        return;
    };
    let decoder = NvDecoder::new(device, Arc::new(CapsCache::new()), DecoderSettings::default());
    decoder.open().expect("open");
    decoder.set_output_kind(OutputKind::Device);
    decoder
        .configure(&DecoderConfig::new(VideoCodec::H264, PixelFormat::Nv12, Resolution::HD))
        .expect("configure");

    // Without a decoded picture the map itself may fail; the pool must
    // still account for every surface afterwards.
    let surface = decoder.new_picture().expect("new_picture");
    let _ = decoder.output_picture(surface);
    let stats = decoder.stats().expect("pool");
    assert_eq!(stats.mapped, stats.exported);
    decoder.close();
}
