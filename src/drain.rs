//! Collection of decoded surfaces from the output plane.

use crate::session::DecodeSession;
use crate::{
    readback, BufferFlags, DecodeError, DecodedFrame, DeviceControl, PixelFormat, QueueRequest,
    TransformSpec,
};

impl<D: DeviceControl> DecodeSession<D> {
    /// Collect every decoded frame the device has ready, in dequeue order.
    ///
    /// Polling continues past an empty dequeue while every bitstream buffer
    /// is in flight and nothing came out yet, and after end-of-stream until
    /// the device's last buffer shows up. Afterwards completed bitstream
    /// buffers are reclaimed.
    ///
    /// Fails with [`DecodeError::SessionFailed`] after a failed negotiation.
    pub fn drain(&mut self) -> Result<Vec<DecodedFrame>, DecodeError> {
        self.ensure_usable()?;
        let mut frames = Vec::new();

        if self.resolution_known && self.output.is_streaming() {
            loop {
                let dequeued = self
                    .output
                    .dequeue(&mut self.device, self.config.dequeue_timeout)
                    .map_err(DecodeError::Drain)?;

                let Some(buffer) = dequeued else {
                    if self.input.is_saturated() && frames.is_empty() {
                        continue;
                    }
                    if self.eos && !self.last_seen {
                        continue;
                    }
                    break;
                };

                let is_last = buffer.flags.contains(BufferFlags::LAST);
                if let Some(frame) = self.process_buffer(&buffer)? {
                    frames.push(frame);
                }
                if is_last {
                    self.last_seen = true;
                    tracing::debug!("Last buffer received after {} frames", self.frame_index);
                    break;
                }
            }
        }

        self.input.reclaim(&mut self.device)?;
        Ok(frames)
    }

    /// Transform one dequeued surface into the transfer surface, hand the
    /// buffer straight back to the device and read the result out.
    ///
    /// An empty buffer (the bare end-of-stream marker) is only recycled.
    fn process_buffer(
        &mut self,
        buffer: &crate::DequeuedBuffer,
    ) -> Result<Option<DecodedFrame>, DecodeError> {
        let (Some(transfer), Some(source)) = (self.transfer, buffer.surface) else {
            self.requeue(buffer.index)?;
            return Ok(None);
        };
        if buffer.bytes_used == 0 {
            self.requeue(buffer.index)?;
            return Ok(None);
        }

        self.device
            .transform_surface(source, transfer.handle, &TransformSpec::default())
            .map_err(DecodeError::Transform)?;
        self.requeue(buffer.index)?;

        let data = readback(
            &mut self.device,
            transfer.handle,
            transfer.color.plane_count(),
        )?;

        let frame_index = self.frame_index;
        self.frame_index += 1;
        Ok(Some(DecodedFrame::new(
            data,
            transfer.width,
            transfer.height,
            PixelFormat::I420,
            buffer.timestamp.as_micros(),
            frame_index,
        )))
    }

    fn requeue(&mut self, index: u32) -> Result<(), DecodeError> {
        self.output
            .enqueue(&mut self.device, &QueueRequest::empty(index))
            .map_err(DecodeError::Requeue)
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use crate::sim::{SimConfig, SimDevice, SimFault};
    use crate::{DecodeError, DecodeSession, DecoderConfig};

    fn session(sim: SimConfig) -> DecodeSession<SimDevice> {
        DecodeSession::with_device(SimDevice::new(sim), DecoderConfig::default()).unwrap()
    }

    #[test]
    fn test_drain_before_submit_is_empty() {
        let mut s = session(SimConfig::default());
        assert!(s.drain().unwrap().is_empty());
    }

    #[test]
    fn test_drain_terminates_when_nothing_ready() {
        let mut s = session(SimConfig::default().crop(16, 16).latency(3));
        s.submit(&[1, 2, 3], 0).unwrap();
        for _ in 0..3 {
            assert!(s.drain().unwrap().is_empty());
        }
        let polls = s.device().stats().output_dequeue_calls;
        assert!(polls <= 3, "drain polled {} times", polls);
    }

    #[test]
    fn test_drain_waits_while_saturated() {
        // Two input slots, both in flight, and the device holds frames back
        // for four dequeue polls before releasing one.
        let sim = SimConfig::default()
            .crop(16, 16)
            .latency(0)
            .reclaim_input(false)
            .output_delay_polls(4);
        let mut s = DecodeSession::with_device(
            SimDevice::new(sim),
            DecoderConfig::default().input_buffers(2),
        )
        .unwrap();
        s.submit(&[1], 10).unwrap();
        s.submit(&[2], 20).unwrap();
        assert_eq!(s.inputs_in_flight(), 2);

        let frames = s.drain().unwrap();
        assert!(!frames.is_empty());
        assert_eq!(frames[0].pts_us, 10);
        assert!(s.device().stats().output_dequeue_calls >= 5);
    }

    #[test]
    fn test_buffers_recycled_immediately() {
        let mut s = session(SimConfig::default().crop(16, 16).latency(0).min_output_buffers(2));
        for n in 0..8i64 {
            let frames = s.decode(&[n as u8 + 1], n).unwrap();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].pts_us, n);
            assert_eq!(s.output_plane().queued_count(), 2);
        }
    }

    #[test]
    fn test_reorder_preserves_device_order() {
        let sim = SimConfig::default().crop(16, 16).latency(0).swap_pairs(true);
        let mut s = session(sim);
        let mut pts = Vec::new();
        for n in 0..4i64 {
            s.submit(&[n as u8 + 1], n * 100).unwrap();
        }
        pts.extend(s.drain().unwrap().iter().map(|f| f.pts_us));
        pts.extend(s.flush().unwrap().iter().map(|f| f.pts_us));
        assert_eq!(pts, vec![100, 0, 300, 200]);
    }

    #[test]
    fn test_frame_index_increments() {
        let mut s = session(SimConfig::default().crop(16, 16).latency(0));
        let mut indices = Vec::new();
        for n in 0..3 {
            indices.extend(s.decode(&[1], n).unwrap().iter().map(|f| f.frame_index));
        }
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_transform_failure() {
        let mut s = session(SimConfig::default().crop(16, 16).latency(0).fault(SimFault::Transform));
        s.submit(&[1], 0).unwrap();
        assert!(matches!(s.drain(), Err(DecodeError::Transform(_))));
    }

    #[test]
    fn test_dequeue_failure() {
        let mut s = session(SimConfig::default().crop(16, 16).fault(SimFault::DequeueOutput));
        s.submit(&[1], 0).unwrap();
        let err = s.drain().unwrap_err();
        assert!(matches!(err, DecodeError::Drain(_)));
        assert_eq!(err.step(), "dequeue");
    }

    #[test]
    fn test_requeue_failure() {
        let mut s = session(SimConfig::default().crop(16, 16).latency(0).fault(SimFault::RequeueOutput));
        s.submit(&[1], 0).unwrap();
        assert!(matches!(s.drain(), Err(DecodeError::Requeue(_))));
    }

    #[test]
    fn test_input_reclaim_failure() {
        let mut s = session(SimConfig::default().crop(16, 16).latency(0).fault(SimFault::DequeueInput));
        s.submit(&[1], 0).unwrap();
        assert!(matches!(s.drain(), Err(DecodeError::InputReclaim(_))));
    }

    #[test]
    fn test_no_frames_lost_between_drain_and_flush() {
        let mut s = session(SimConfig::default().crop(16, 16).latency(1));
        let mut pts = Vec::new();
        for n in 0..10i64 {
            s.submit(&[1], n).unwrap();
            if n % 3 == 0 {
                pts.extend(s.drain().unwrap().iter().map(|f| f.pts_us));
            }
        }
        pts.extend(s.flush().unwrap().iter().map(|f| f.pts_us));
        assert_eq!(pts, (0..10).collect::<Vec<_>>());
    }
}
