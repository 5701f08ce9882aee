//! Decode Driver — owns one hardware decoder instance on a [`DecoderContext`].
//!
//! All calls go through the context's device lock. The driver keeps no
//! mutable state of its own; the surface pool tracks what is decoded,
//! mapped, or exported.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use nvd_common::{
    DecodeError, DecoderCreateInfo, DecoderHandle, DeviceCopy, DeviceError, DevicePtr,
    DriverStatus, PictureParams, ReconfigureInfo,
};

use crate::context::DecoderContext;

pub struct DecodeDriver {
    context: Arc<DecoderContext>,
    handle: DecoderHandle,
}

impl std::fmt::Debug for DecodeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeDriver")
            .field("handle", &self.handle)
            .field("context", &self.context)
            .finish()
    }
}

impl DecodeDriver {
    /// Create the hardware decoder described by `info`.
    pub fn create(context: Arc<DecoderContext>, info: &DecoderCreateInfo) -> Result<Self, DeviceError> {
        let handle = context
            .locked(|dev, ctx, _| dev.create_decoder(ctx, info))
            .map_err(|status| match status {
                DriverStatus::INVALID_CONTEXT => DeviceError::ContextClosed,
                status => DeviceError::DecoderCreation {
                    codec: info.codec,
                    status,
                },
            })?;

        info!(
            codec = info.codec.display_name(),
            format = ?info.format,
            coded = %info.coded,
            max = %info.max,
            decode_surfaces = info.num_decode_surfaces,
            output_surfaces = info.num_output_surfaces,
            "Hardware decoder created"
        );

        Ok(Self { context, handle })
    }

    pub fn context(&self) -> &Arc<DecoderContext> {
        &self.context
    }

    /// Submit a picture into decode slot `slot` for surface `index`.
    pub fn decode(&self, index: u32, slot: u32, params: &PictureParams) -> Result<(), DecodeError> {
        trace!(index, slot, bytes = params.bitstream.len(), "Decode picture");
        self.context
            .locked(|dev, ctx, _| dev.decode_picture(ctx, self.handle, slot, params))
            .map_err(|status| DecodeError::DecodeFailed { index, status })
    }

    pub fn supports_reconfigure(&self) -> bool {
        self.context.device().supports_reconfigure()
    }

    pub fn reconfigure(&self, info: &ReconfigureInfo) -> Result<(), DriverStatus> {
        self.context
            .locked(|dev, ctx, _| dev.reconfigure_decoder(ctx, self.handle, info))
    }

    /// Map decode slot `slot`; returns pointer and pitch.
    pub fn map(&self, slot: u32) -> Result<(DevicePtr, u32), DriverStatus> {
        self.context
            .locked(|dev, ctx, stream| dev.map_frame(ctx, self.handle, slot, stream))
    }

    pub fn unmap(&self, ptr: DevicePtr) -> Result<(), DriverStatus> {
        self.context
            .locked(|dev, ctx, _| dev.unmap_frame(ctx, self.handle, ptr))
    }

    /// Copy every plane in `copies` into `dst` and wait for completion.
    pub fn copy_to_host(&self, copies: &[DeviceCopy], dst: &mut [u8]) -> Result<(), DriverStatus> {
        self.context.locked(|dev, ctx, stream| {
            for copy in copies {
                dev.copy_to_host(ctx, stream, copy, dst)?;
            }
            dev.synchronize(ctx, stream)
        })
    }
}

impl Drop for DecodeDriver {
    fn drop(&mut self) {
        match self
            .context
            .locked(|dev, ctx, _| dev.destroy_decoder(ctx, self.handle))
        {
            Ok(()) => debug!(handle = ?self.handle, "Hardware decoder destroyed"),
            Err(status) => warn!(handle = ?self.handle, %status, "Failed to destroy hardware decoder"),
        }
    }
}

// ── Tests ──
