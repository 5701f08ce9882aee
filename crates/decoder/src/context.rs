//! Decoder Context — one device context, one stream, and the device lock.
//!
//! Every hardware call on a context runs inside [`DecoderContext::locked`],
//! which holds the context's mutex for the duration of the call. The surface
//! pool may call in while holding its own lock; the context never calls back
//! into the pool, so the lock order is always pool → context.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use nvd_common::{ContextHandle, DecodeDevice, DeviceError, DriverStatus, StreamHandle};

#[derive(Clone, Copy, Debug)]
struct Handles {
    ctx: ContextHandle,
    stream: StreamHandle,
}

/// A device context bound to one ordinal, shared by the decode driver, the
/// surface pool, and every exported memory object.
pub struct DecoderContext {
    device: Arc<dyn DecodeDevice>,
    ordinal: u32,
    /// `None` once destroyed.
    handles: Mutex<Option<Handles>>,
}

impl std::fmt::Debug for DecoderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderContext")
            .field("device", &self.device.name())
            .field("ordinal", &self.ordinal)
            .field("open", &self.is_open())
            .finish()
    }
}

impl DecoderContext {
    /// Open a context and a stream on device `ordinal`.
    pub fn create(device: Arc<dyn DecodeDevice>, ordinal: u32) -> Result<Arc<Self>, DeviceError> {
        let ctx = device
            .open_context(ordinal)
            .map_err(|status| DeviceError::DeviceUnavailable { ordinal, status })?;

        let stream = match device.create_stream(ctx) {
            Ok(stream) => stream,
            Err(status) => {
                if let Err(e) = device.close_context(ctx) {
                    warn!(ordinal, status = %e, "Failed to close context after stream failure");
                }
                return Err(DeviceError::StreamCreation(status));
            }
        };

        info!(device = device.name(), ordinal, "Decoder context created");

        Ok(Arc::new(Self {
            device,
            ordinal,
            handles: Mutex::new(Some(Handles { ctx, stream })),
        }))
    }

    pub fn device(&self) -> &Arc<dyn DecodeDevice> {
        &self.device
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn is_open(&self) -> bool {
        self.handles.lock().is_some()
    }

    /// Run `f` with the device lock held and the context's handles.
    ///
    /// Fails with `INVALID_CONTEXT` once the context has been destroyed.
    pub fn locked<R>(
        &self,
        f: impl FnOnce(&dyn DecodeDevice, ContextHandle, StreamHandle) -> Result<R, DriverStatus>,
    ) -> Result<R, DriverStatus> {
        let guard = self.handles.lock();
        let handles = guard.as_ref().ok_or(DriverStatus::INVALID_CONTEXT)?;
        f(self.device.as_ref(), handles.ctx, handles.stream)
    }

    /// Release the stream and context. Idempotent.
    pub fn destroy(&self) {
        let mut guard = self.handles.lock();
        let Some(handles) = guard.take() else {
            return;
        };
        if let Err(status) = self.device.destroy_stream(handles.ctx, handles.stream) {
            warn!(ordinal = self.ordinal, %status, "Failed to destroy stream");
        }
        if let Err(status) = self.device.close_context(handles.ctx) {
            warn!(ordinal = self.ordinal, %status, "Failed to destroy context");
        }
        debug!(ordinal = self.ordinal, "Decoder context destroyed");
    }
}

impl Drop for DecoderContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ── Tests ──
