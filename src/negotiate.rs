//! One-time output plane setup after the resolution-change event.

use crate::{
    ColorFormat, DecodeError, DeviceControl, DeviceEvent, PlaneFormat, QueueRequest,
    SurfaceHandle, SurfaceLayout, SurfaceSpec,
};
use crate::session::DecodeSession;

/// Persistent destination surface every decoded frame is transformed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSurface {
    pub handle: SurfaceHandle,
    pub width: u32,
    pub height: u32,
    pub color: ColorFormat,
}

/// Outcome of negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Format the device decodes into.
    pub format: PlaneFormat,
    /// Dimensions of frames handed to the caller.
    pub width: u32,
    pub height: u32,
    /// Decoded surface buffers granted by the device.
    pub output_buffers: u32,
}

impl<D: DeviceControl> DecodeSession<D> {
    /// Block until the device reports the stream format, then build the
    /// transfer surface and the decoded-surface pool.
    ///
    /// Runs at most once per session. A failure leaves whatever was already
    /// allocated in place for teardown to release, and the caller marks the
    /// session failed.
    pub(crate) fn negotiate(&mut self) -> Result<Negotiated, DecodeError> {
        loop {
            match self.device.wait_event(self.config.event_timeout) {
                Ok(Some(DeviceEvent::ResolutionChange)) => break,
                Ok(Some(other)) => tracing::debug!("Ignoring device event {:?}", other),
                Ok(None) => tracing::debug!(
                    "No resolution change within {:?}, waiting again",
                    self.config.event_timeout
                ),
                Err(e) => return Err(DecodeError::EventWait(e)),
            }
        }

        let output_kind = self.output.kind();
        let format = self
            .device
            .query_format(output_kind)
            .map_err(DecodeError::FormatQuery)?;
        let crop = self
            .device
            .query_crop(output_kind)
            .map_err(DecodeError::CropQuery)?;

        let width = self.config.width.unwrap_or(crop.width);
        let height = self.config.height.unwrap_or(crop.height);

        let spec = SurfaceSpec {
            width,
            height,
            layout: SurfaceLayout::Pitch,
            color: ColorFormat::Yuv420,
        };
        if let Some(stale) = self.transfer.take() {
            self.device
                .destroy_surface(stale.handle)
                .map_err(DecodeError::SurfaceAlloc)?;
        }
        let handle = self
            .device
            .allocate_surface(&spec)
            .map_err(DecodeError::SurfaceAlloc)?;
        self.transfer = Some(TransferSurface {
            handle,
            width,
            height,
            color: spec.color,
        });

        self.output
            .release_pool(&mut self.device)
            .map_err(DecodeError::PlaneSetup)?;
        let min_buffers = self
            .device
            .query_min_buffers(output_kind)
            .map_err(DecodeError::MinBuffersQuery)?;

        self.output
            .set_format(
                &mut self.device,
                PlaneFormat::raw(format.pixel_format, format.width, format.height),
            )
            .map_err(DecodeError::PlaneFormat)?;
        let granted = self
            .output
            .setup_pool(&mut self.device, min_buffers)
            .map_err(DecodeError::PlaneSetup)?;
        self.output
            .set_stream_status(&mut self.device, true)
            .map_err(DecodeError::StreamOn)?;

        for index in 0..granted {
            self.output
                .enqueue(&mut self.device, &QueueRequest::empty(index))
                .map_err(DecodeError::Requeue)?;
        }

        self.resolution_known = true;
        tracing::info!(
            "Negotiated {} {}x{} (crop {}x{}), output {}x{} with {} surfaces",
            format.pixel_format,
            format.width,
            format.height,
            crop.width,
            crop.height,
            width,
            height,
            granted
        );

        let negotiated = Negotiated {
            format,
            width,
            height,
            output_buffers: granted,
        };
        self.negotiated = Some(negotiated);
        Ok(negotiated)
    }
}
