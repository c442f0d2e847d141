//! Decode session lifecycle: construction, submission, flush and teardown.

use crate::negotiate::{Negotiated, TransferSurface};
use crate::{
    Codec, ConstructionStep, DecodeError, DecodedFrame, DecoderConfig, DeviceControl,
    DeviceError, DeviceEvent, InputQueue, MemoryType, OpenFlags, PixelFormat, Plane,
    PlaneFormat, PlaneKind, VideoDecoder,
};

/// A single decode session bound to one hardware decoder.
///
/// The session owns the device, both planes and the transfer surface.
/// Dropping it tears everything down; [`destroy`](Self::destroy) does the
/// same but reports errors.
///
/// Not safe for concurrent use: every call runs a serial sequence of device
/// requests.
pub struct DecodeSession<D: DeviceControl> {
    pub(crate) device: D,
    pub(crate) config: DecoderConfig,
    pub(crate) input: InputQueue,
    pub(crate) output: Plane,
    pub(crate) transfer: Option<TransferSurface>,
    pub(crate) negotiated: Option<Negotiated>,
    pub(crate) resolution_known: bool,
    /// Set once negotiation fails; only teardown is allowed afterwards.
    pub(crate) failed: bool,
    pub(crate) eos: bool,
    pub(crate) last_seen: bool,
    pub(crate) frame_index: u64,
    torn_down: bool,
}

impl<D: DeviceControl> DecodeSession<D> {
    /// Open the configured device with `open` and build a session on it.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Construction`] naming the step that failed.
    /// Everything allocated before the failure is released.
    pub fn create<F>(config: DecoderConfig, open: F) -> Result<Self, DecodeError>
    where
        F: FnOnce(&str, OpenFlags) -> Result<D, DeviceError>,
    {
        config.validate()?;
        let device = open(&config.device, OpenFlags { nonblocking: true }).map_err(|source| {
            DecodeError::Construction {
                step: ConstructionStep::Open,
                source,
            }
        })?;
        tracing::info!("Opened decoder device: {}", config.device);
        Self::with_device(device, config)
    }

    /// Build a session on an already opened device.
    pub fn with_device(device: D, config: DecoderConfig) -> Result<Self, DecodeError> {
        config.validate()?;
        let mut session = Self {
            device,
            config,
            input: InputQueue::new(),
            output: Plane::new(PlaneKind::Output, MemoryType::Mmap),
            transfer: None,
            negotiated: None,
            resolution_known: false,
            failed: false,
            eos: false,
            last_seen: false,
            frame_index: 0,
            torn_down: false,
        };

        if let Err(e) = session.init() {
            if let Err(cleanup) = session.teardown() {
                tracing::warn!("Cleanup after failed construction: {}", cleanup);
            }
            return Err(e);
        }
        Ok(session)
    }

    fn init(&mut self) -> Result<(), DecodeError> {
        self.device
            .subscribe_event(DeviceEvent::ResolutionChange)
            .map_err(construction(ConstructionStep::Subscribe))?;

        let format = PlaneFormat::bitstream(self.config.codec.fourcc(), self.config.chunk_size);
        self.input
            .plane_mut()
            .set_format(&mut self.device, format)
            .map_err(construction(ConstructionStep::InputPlaneFormat))?;

        self.device
            .set_frame_input_mode(self.config.frame_input)
            .map_err(construction(ConstructionStep::FrameInputMode))?;

        let granted = self
            .input
            .plane_mut()
            .setup_pool(&mut self.device, self.config.input_buffers)
            .map_err(construction(ConstructionStep::InputPlaneSetup))?;
        self.input.set_capacity(self.config.chunk_size);

        self.input
            .plane_mut()
            .set_stream_status(&mut self.device, true)
            .map_err(construction(ConstructionStep::InputStreamOn))?;

        tracing::debug!(
            "Input plane ready: {} x {} byte {} buffers",
            granted,
            self.config.chunk_size,
            self.config.codec
        );
        Ok(())
    }

    /// Queue one bitstream chunk. The first chunk also blocks until the
    /// device reports the stream format and the output plane is built.
    ///
    /// Empty chunks are ignored: an empty buffer would be read by the device
    /// as end-of-stream.
    pub fn submit(&mut self, chunk: &[u8], pts_us: i64) -> Result<(), DecodeError> {
        self.ensure_usable()?;
        if chunk.is_empty() {
            tracing::debug!("Ignoring empty chunk at {} us", pts_us);
            return Ok(());
        }
        self.enqueue_chunk(Some(chunk), pts_us)
    }

    fn enqueue_chunk(&mut self, chunk: Option<&[u8]>, pts_us: i64) -> Result<(), DecodeError> {
        if self.eos && chunk.is_some() {
            return Err(DecodeError::EndOfStream);
        }
        self.input.submit(&mut self.device, chunk, pts_us)?;

        // The device can only report a format once it has seen stream headers.
        if !self.resolution_known && chunk.is_some() {
            if let Err(e) = self.negotiate() {
                self.failed = true;
                tracing::warn!("Negotiation failed, session must be destroyed: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn ensure_usable(&self) -> Result<(), DecodeError> {
        if self.failed {
            return Err(DecodeError::SessionFailed);
        }
        Ok(())
    }

    /// Submit a chunk and collect every frame that is ready.
    pub fn decode(&mut self, chunk: &[u8], pts_us: i64) -> Result<Vec<DecodedFrame>, DecodeError> {
        self.submit(chunk, pts_us)?;
        self.drain()
    }

    /// Signal end-of-stream and collect every remaining frame, up to and
    /// including the device's last buffer.
    ///
    /// Calling it again only drains; further [`submit`](Self::submit) calls
    /// fail with [`DecodeError::EndOfStream`].
    ///
    /// If the end-of-stream marker cannot be queued (every bitstream buffer
    /// still in flight), the session stays open for more data and `flush`
    /// can be retried.
    pub fn flush(&mut self) -> Result<Vec<DecodedFrame>, DecodeError> {
        self.ensure_usable()?;
        if !self.eos {
            self.enqueue_chunk(None, 0)?;
            self.eos = true;
            tracing::debug!("End of stream queued");
        }
        let frames = self.drain()?;
        self.input.reclaim(&mut self.device)?;
        Ok(frames)
    }

    /// Tear the session down and report the first error.
    pub fn destroy(mut self) -> Result<(), DecodeError> {
        self.teardown()
    }

    /// Return every bitstream buffer, free the transfer surface and stop
    /// both planes. Safe to run on a partially built session and more than
    /// once; the device handle itself is closed when the session is dropped.
    fn teardown(&mut self) -> Result<(), DecodeError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let mut first_error = None;

        if self.input.plane().pool_size() > 0 {
            match self.input.reclaim_blocking(
                &mut self.device,
                self.config.reclaim_timeout,
                self.config.reclaim_attempts,
            ) {
                Ok(0) => {}
                Ok(left) => tracing::warn!(
                    "{} input buffers still in flight, forcing stream off",
                    left
                ),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.output.release_pool(&mut self.device) {
            first_error.get_or_insert(DecodeError::Teardown(e));
        }
        if let Err(e) = self.input.plane_mut().release_pool(&mut self.device) {
            first_error.get_or_insert(DecodeError::Teardown(e));
        }

        if let Some(transfer) = self.transfer.take() {
            if let Err(e) = self.device.destroy_surface(transfer.handle) {
                first_error.get_or_insert(DecodeError::Teardown(e));
            }
        }

        tracing::debug!("Decode session torn down after {} frames", self.frame_index);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dimensions of returned frames, once negotiated.
    #[must_use]
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.transfer.as_ref().map(|t| (t.width, t.height))
    }

    /// Whether the output plane has been built.
    #[must_use]
    pub fn is_negotiated(&self) -> bool {
        self.resolution_known
    }

    /// Outcome of negotiation, once it succeeded.
    #[must_use]
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Whether a failed negotiation left the session unusable.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Whether end-of-stream has been signalled.
    #[must_use]
    pub fn is_eos(&self) -> bool {
        self.eos
    }

    /// Input slot the next chunk goes to.
    #[must_use]
    pub fn input_cursor(&self) -> u32 {
        self.input.cursor()
    }

    /// Bitstream buffers currently owned by the device.
    #[must_use]
    pub fn inputs_in_flight(&self) -> u32 {
        self.input.in_flight()
    }

    #[must_use]
    pub fn transfer_surface(&self) -> Option<&TransferSurface> {
        self.transfer.as_ref()
    }

    #[must_use]
    pub fn input_plane(&self) -> &Plane {
        self.input.plane()
    }

    #[must_use]
    pub fn output_plane(&self) -> &Plane {
        &self.output
    }

    #[must_use]
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }
}

fn construction(step: ConstructionStep) -> impl FnOnce(DeviceError) -> DecodeError {
    move |source| DecodeError::Construction { step, source }
}

impl<D: DeviceControl> Drop for DecodeSession<D> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!("Decode session teardown failed: {}", e);
        }
    }
}

impl<D: DeviceControl> VideoDecoder for DecodeSession<D> {
    fn decode(&mut self, chunk: &[u8], pts_us: i64) -> Result<Vec<DecodedFrame>, DecodeError> {
        DecodeSession::decode(self, chunk, pts_us)
    }

    fn flush(&mut self) -> Result<Vec<DecodedFrame>, DecodeError> {
        DecodeSession::flush(self)
    }

    fn codec(&self) -> Codec {
        self.config.codec
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        DecodeSession::dimensions(self)
    }

    fn output_format(&self) -> PixelFormat {
        PixelFormat::I420
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimDevice, SimFault};
    use crate::{expected_frame_size, BufferFlags, FrameInputMode};

    fn open(sim: SimConfig) -> impl FnOnce(&str, OpenFlags) -> Result<SimDevice, DeviceError> {
        move |path, flags| {
            assert!(flags.nonblocking);
            Ok(SimDevice::open(path, sim))
        }
    }

    fn chunk(n: u8) -> Vec<u8> {
        vec![0, 0, 0, 1, 0x65, n, n, n]
    }

    #[test]
    fn test_create_initial_state() {
        let s = DecodeSession::create(DecoderConfig::default(), open(SimConfig::default())).unwrap();
        assert!(!s.is_negotiated());
        assert!(!s.is_eos());
        assert_eq!(s.input_cursor(), 0);
        assert_eq!(s.input_plane().pool_size(), 10);
        assert!(s.input_plane().is_streaming());
        assert_eq!(
            s.input_plane().format().unwrap().size_image,
            crate::DEFAULT_CHUNK_SIZE
        );
        assert!(s.dimensions().is_none());
        assert_eq!(s.device().opened_path(), Some("/dev/nvhost-nvdec"));
    }

    #[test]
    fn test_create_uses_configured_device() {
        let config = DecoderConfig::new(Codec::Hevc).device("/dev/video-dec1");
        let s = DecodeSession::create(config, open(SimConfig::default())).unwrap();
        assert_eq!(s.device().opened_path(), Some("/dev/video-dec1"));
        assert_eq!(
            s.input_plane().format().unwrap().pixel_format,
            Codec::Hevc.fourcc()
        );
    }

    #[test]
    fn test_create_open_failure() {
        let result = DecodeSession::<SimDevice>::create(DecoderConfig::default(), |path, _| {
            Err(DeviceError::rejected(format!("no device at {}", path)))
        });
        let err = result.err().unwrap();
        assert!(matches!(
            err,
            DecodeError::Construction {
                step: ConstructionStep::Open,
                ..
            }
        ));
    }

    #[test]
    fn test_create_failure_releases_everything() {
        let cases = [
            (SimFault::Subscribe, ConstructionStep::Subscribe),
            (SimFault::InputFormat, ConstructionStep::InputPlaneFormat),
            (SimFault::FrameInputMode, ConstructionStep::FrameInputMode),
            (SimFault::InputPool, ConstructionStep::InputPlaneSetup),
            (SimFault::InputStreamOn, ConstructionStep::InputStreamOn),
        ];
        for (fault, expected) in cases {
            let sim = SimConfig::default().fault(fault);
            let stats = sim.stats_handle();
            let err = DecodeSession::create(DecoderConfig::default(), open(sim))
                .err()
                .unwrap();
            match err {
                DecodeError::Construction { step, .. } => assert_eq!(step, expected),
                other => panic!("unexpected error {:?}", other),
            }
            let stats = stats.snapshot();
            assert!(stats.closed, "{:?}", fault);
            assert_eq!(stats.live_pools, 0, "{:?}", fault);
        }
    }

    #[test]
    fn test_invalid_config_never_opens() {
        let config = DecoderConfig::default().input_buffers(0);
        let result = DecodeSession::<SimDevice>::create(config, |_, _| {
            panic!("device must not be opened")
        });
        assert!(matches!(result, Err(DecodeError::InvalidConfig(_))));
    }

    #[test]
    fn test_first_submit_negotiates_1080p() {
        let mut s = DecodeSession::create(
            DecoderConfig::new(Codec::H264),
            open(SimConfig::default().crop(1920, 1080)),
        )
        .unwrap();
        s.submit(&chunk(1), 0).unwrap();
        assert!(s.is_negotiated());
        assert_eq!(s.dimensions(), Some((1920, 1080)));
        assert_eq!(s.transfer_surface().unwrap().width, 1920);
    }

    #[test]
    fn test_cursor_advances_mod_pool() {
        let mut s =
            DecodeSession::create(DecoderConfig::default().input_buffers(4), open(SimConfig::default()))
                .unwrap();
        for n in 1..=12u32 {
            s.decode(&chunk(n as u8), n as i64 * 1000).unwrap();
            assert_eq!(s.input_cursor(), n % 4);
        }
    }

    #[test]
    fn test_eleventh_submit_fails_without_reclaim() {
        let sim = SimConfig::default().reclaim_input(false);
        let mut s = DecodeSession::create(DecoderConfig::default(), open(sim)).unwrap();
        for n in 0..10u8 {
            s.submit(&chunk(n), n as i64).unwrap();
        }
        assert_eq!(s.inputs_in_flight(), 10);
        assert_eq!(s.input_cursor(), 0);

        let err = s.submit(&chunk(10), 10).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Enqueue(DeviceError::SlotInFlight { index: 0 })
        ));
        assert_eq!(s.device().stats().inputs_enqueued, 10);
    }

    #[test]
    fn test_frames_carry_timestamps_and_size() {
        let mut s = DecodeSession::create(
            DecoderConfig::default(),
            open(SimConfig::default().crop(64, 48).latency(0)),
        )
        .unwrap();
        let frames = s.decode(&chunk(3), 1_500_000).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.pts_us, 1_500_000);
        assert_eq!(frame.data.len(), expected_frame_size(64, 48, PixelFormat::I420));
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(frame.frame_index, 0);
    }

    #[test]
    fn test_negative_timestamp_survives() {
        let mut s = DecodeSession::create(
            DecoderConfig::default(),
            open(SimConfig::default().crop(16, 16).latency(0)),
        )
        .unwrap();
        let frames = s.decode(&chunk(1), -1_000_001).unwrap();
        assert_eq!(frames[0].pts_us, -1_000_001);
    }

    #[test]
    fn test_flush_ends_with_last_buffer() {
        let mut s = DecodeSession::create(
            DecoderConfig::default(),
            open(SimConfig::default().crop(32, 32).latency(2)),
        )
        .unwrap();
        let mut seen = Vec::new();
        for n in 0..6i64 {
            for frame in s.decode(&chunk(n as u8), n * 40_000).unwrap() {
                seen.push(frame.pts_us);
            }
        }
        let tail = s.flush().unwrap();
        assert!(!tail.is_empty());
        let last_pts = tail.last().unwrap().pts_us;
        seen.extend(tail.iter().map(|f| f.pts_us));

        assert_eq!(seen, (0..6).map(|n| n * 40_000).collect::<Vec<_>>());
        assert_eq!(Some(last_pts), s.device().last_flagged_pts());
        assert!(s.device().stats().last_flags_sent == 1);
        assert_eq!(s.inputs_in_flight(), 0);
    }

    #[test]
    fn test_flush_without_output() {
        let mut s =
            DecodeSession::create(DecoderConfig::default(), open(SimConfig::default())).unwrap();
        let frames = s.flush().unwrap();
        assert!(frames.is_empty());
        assert!(s.is_eos());
        assert!(!s.is_negotiated());
        assert!(matches!(s.submit(&chunk(1), 0), Err(DecodeError::EndOfStream)));
        s.destroy().unwrap();
    }

    #[test]
    fn test_flush_retry_after_saturated_input() {
        let sim = SimConfig::default().crop(32, 32).reclaim_input(false);
        let mut s = DecodeSession::create(DecoderConfig::default(), open(sim)).unwrap();
        for n in 0..10u8 {
            s.submit(&chunk(n), n as i64).unwrap();
        }

        let err = s.flush().unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Enqueue(DeviceError::SlotInFlight { index: 0 })
        ));
        assert!(!s.is_eos());
        assert!(matches!(
            s.submit(&chunk(10), 10),
            Err(DecodeError::Enqueue(DeviceError::SlotInFlight { .. }))
        ));

        s.device.complete_input();
        let tail = s.flush().unwrap();
        assert!(s.is_eos());
        let pts: Vec<i64> = tail.iter().map(|f| f.pts_us).collect();
        assert_eq!(pts, (0..10).collect::<Vec<_>>());
        assert_eq!(s.device().stats().last_flags_sent, 1);
    }

    #[test]
    fn test_failed_negotiation_poisons_session() {
        for fault in [SimFault::QueryMinBuffers, SimFault::OutputStreamOn] {
            let sim = SimConfig::default().crop(32, 32).fault(fault);
            let stats = sim.stats_handle();
            let mut s = DecodeSession::create(DecoderConfig::default(), open(sim)).unwrap();

            assert!(s.submit(&chunk(1), 0).is_err(), "{:?}", fault);
            assert!(s.is_failed());
            assert!(!s.is_negotiated());
            assert!(matches!(s.drain(), Err(DecodeError::SessionFailed)));
            assert!(matches!(s.flush(), Err(DecodeError::SessionFailed)));
            assert!(matches!(s.decode(&chunk(2), 1), Err(DecodeError::SessionFailed)));
            assert!(!s.is_eos());
            assert_eq!(s.device().stats().inputs_enqueued, 1, "{:?}", fault);

            s.destroy().unwrap();
            let stats = stats.snapshot();
            assert!(stats.closed, "{:?}", fault);
            assert_eq!(stats.live_host_surfaces(), 0, "{:?}", fault);
            assert_eq!(stats.live_pools, 0, "{:?}", fault);
        }
    }

    #[test]
    fn test_chunk_input_mode_reaches_device() {
        let config = DecoderConfig::default().frame_input(FrameInputMode::Chunks);
        let s = DecodeSession::create(config, open(SimConfig::default())).unwrap();
        assert_eq!(s.device().frame_input_mode(), FrameInputMode::Chunks);

        let s = DecodeSession::create(DecoderConfig::default(), open(SimConfig::default())).unwrap();
        assert_eq!(s.device().frame_input_mode(), FrameInputMode::CompleteFrames);
    }

    #[test]
    fn test_flush_when_device_produces_nothing() {
        let sim = SimConfig::default().produce_frames(false);
        let mut s = DecodeSession::create(DecoderConfig::default(), open(sim)).unwrap();
        s.submit(&chunk(1), 0).unwrap();
        assert!(s.drain().unwrap().is_empty());
        assert!(s.flush().unwrap().is_empty());
        assert!(s.flush().unwrap().is_empty());
    }

    #[test]
    fn test_destroy_releases_everything() {
        let sim = SimConfig::default().crop(32, 32);
        let stats = sim.stats_handle();
        let mut s = DecodeSession::create(DecoderConfig::default(), open(sim)).unwrap();
        for n in 0..3 {
            s.submit(&chunk(n), n as i64).unwrap();
        }
        s.destroy().unwrap();

        let stats = stats.snapshot();
        assert!(stats.closed);
        assert_eq!(stats.live_host_surfaces(), 0);
        assert_eq!(stats.live_pools, 0);
        assert_eq!(stats.inputs_in_flight, 0);
    }

    #[test]
    fn test_drop_forces_back_stuck_inputs() {
        let sim = SimConfig::default().reclaim_input(false);
        let stats = sim.stats_handle();
        {
            let config = DecoderConfig::default().reclaim(std::time::Duration::ZERO, 2);
            let mut s = DecodeSession::create(config, open(sim)).unwrap();
            for n in 0..5 {
                s.submit(&chunk(n), 0).unwrap();
            }
        }
        let stats = stats.snapshot();
        assert!(stats.closed);
        assert_eq!(stats.inputs_in_flight, 0);
        assert_eq!(stats.live_host_surfaces(), 0);
    }

    #[test]
    fn test_last_flag_constant_matches_v4l2() {
        assert_eq!(BufferFlags::LAST.bits(), 0x0010_0000);
    }

    #[test]
    fn test_video_decoder_trait() {
        fn run(decoder: &mut dyn VideoDecoder) -> usize {
            let mut count = 0;
            for n in 0..4u8 {
                count += decoder.decode(&chunk(n), n as i64).unwrap().len();
            }
            count + decoder.flush().unwrap().len()
        }
        let mut s = DecodeSession::create(
            DecoderConfig::new(Codec::Hevc),
            open(SimConfig::default().crop(16, 16)),
        )
        .unwrap();
        assert_eq!(run(&mut s), 4);
        assert_eq!(VideoDecoder::codec(&s), Codec::Hevc);
        assert_eq!(s.output_format(), PixelFormat::I420);
        assert_eq!(VideoDecoder::dimensions(&s), Some((16, 16)));
    }
}
