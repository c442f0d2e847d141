//! Core types for decode sessions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::DecodeError;

/// Microseconds in one second, the unit split of wire timestamps.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Default number of bitstream buffers in the input pool.
pub const DEFAULT_INPUT_BUFFERS: u32 = 10;

/// Default capacity of one bitstream buffer in bytes.
pub const DEFAULT_CHUNK_SIZE: u32 = 4_000_000;

/// Default decoder device node.
pub const DEFAULT_DEVICE: &str = "/dev/nvhost-nvdec";

/// Compressed bitstream codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// H.264/AVC codec.
    H264,
    /// H.265/HEVC codec.
    Hevc,
}

impl Codec {
    /// Input plane pixel format carrying this bitstream.
    #[must_use]
    pub fn fourcc(&self) -> FourCc {
        match self {
            Self::H264 => FourCc::H264,
            Self::Hevc => FourCc::H265,
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::H264
    }
}

impl FromStr for Codec {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "H264" | "AVC" => Ok(Self::H264),
            "H265" | "HEVC" => Ok(Self::Hevc),
            _ => Err(DecodeError::unsupported_codec(s)),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => f.write_str("H264"),
            Self::Hevc => f.write_str("H265"),
        }
    }
}

/// Four-character pixel format code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const H264: FourCc = FourCc(*b"H264");
    pub const H265: FourCc = FourCc(*b"H265");
    /// NV12 with separate luma and chroma memory planes.
    pub const NV12M: FourCc = FourCc(*b"NM12");

    /// Build a code from its four bytes.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Little-endian numeric value, as used by V4L2.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self)
    }
}

/// Pixel format of frames handed to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// NV12 (YUV 4:2:0, planar Y + interleaved UV).
    Nv12,
    /// I420/YUV420P (YUV 4:2:0, planar Y + U + V).
    I420,
}

impl PixelFormat {
    /// Returns the average number of bytes per pixel.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> f32 {
        match self {
            Self::Nv12 | Self::I420 => 1.5, // YUV 4:2:0
        }
    }

    /// Number of memory planes in a surface of this format.
    #[must_use]
    pub fn plane_count(&self) -> u32 {
        match self {
            Self::Nv12 => 2,
            Self::I420 => 3,
        }
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::I420
    }
}

/// Expected byte size of a frame with the given dimensions and format.
#[must_use]
pub fn expected_frame_size(width: u32, height: u32, format: PixelFormat) -> usize {
    let w = width as usize;
    let h = height as usize;
    match format {
        PixelFormat::Nv12 | PixelFormat::I420 => w * h + (w * h) / 2,
    }
}

/// Presentation timestamp in its wire form: whole seconds plus the
/// remaining microseconds.
///
/// Splitting uses truncating division, so negative timestamps keep the sign
/// on both fields and `as_micros(from_micros(t)) == t` for every `t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: i64,
}

impl Timestamp {
    #[must_use]
    pub fn from_micros(us: i64) -> Self {
        Self {
            sec: us / MICROS_PER_SECOND,
            usec: us % MICROS_PER_SECOND,
        }
    }

    #[must_use]
    pub fn as_micros(&self) -> i64 {
        self.sec * MICROS_PER_SECOND + self.usec
    }
}

/// How the decoder expects bitstream buffers to be cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameInputMode {
    /// Each buffer holds exactly one complete access unit.
    CompleteFrames,
    /// Buffers hold arbitrary slices of the stream.
    Chunks,
}

impl Default for FrameInputMode {
    fn default() -> Self {
        Self::CompleteFrames
    }
}

/// Configuration for creating a decode session.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Decoder device node to open.
    pub device: String,
    /// Bitstream codec.
    pub codec: Codec,
    /// Output width (None = use the device-reported crop width).
    pub width: Option<u32>,
    /// Output height (None = use the device-reported crop height).
    pub height: Option<u32>,
    /// Number of bitstream buffers in the input pool.
    pub input_buffers: u32,
    /// Capacity of one bitstream buffer in bytes.
    pub chunk_size: u32,
    /// Bitstream framing expected by the decoder.
    pub frame_input: FrameInputMode,
    /// Bound of a single wait for the resolution-change event.
    pub event_timeout: Duration,
    /// Bound of a single decoded-surface dequeue attempt.
    pub dequeue_timeout: Duration,
    /// Bound of a single input reclaim attempt during teardown.
    pub reclaim_timeout: Duration,
    /// Reclaim attempts during teardown before streaming is forced off.
    pub reclaim_attempts: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            codec: Codec::H264,
            width: None,
            height: None,
            input_buffers: DEFAULT_INPUT_BUFFERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            frame_input: FrameInputMode::CompleteFrames,
            event_timeout: Duration::from_millis(1000),
            dequeue_timeout: Duration::from_millis(10),
            reclaim_timeout: Duration::from_millis(100),
            reclaim_attempts: 10,
        }
    }
}

impl DecoderConfig {
    /// Create a new decoder configuration for the given codec.
    #[must_use]
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            ..Default::default()
        }
    }

    /// Set the device node.
    #[must_use]
    pub fn device(mut self, path: impl Into<String>) -> Self {
        self.device = path.into();
        self
    }

    /// Force the output dimensions instead of deferring to the device crop.
    #[must_use]
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Force only the output width.
    #[must_use]
    pub fn width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    /// Force only the output height.
    #[must_use]
    pub fn height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    /// Set the input pool size.
    #[must_use]
    pub fn input_buffers(mut self, count: u32) -> Self {
        self.input_buffers = count;
        self
    }

    /// Set the capacity of one bitstream buffer.
    #[must_use]
    pub fn chunk_size(mut self, bytes: u32) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the bitstream framing mode.
    #[must_use]
    pub fn frame_input(mut self, mode: FrameInputMode) -> Self {
        self.frame_input = mode;
        self
    }

    /// Set the per-attempt resolution event wait.
    #[must_use]
    pub fn event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    /// Set the per-attempt decoded surface dequeue wait.
    #[must_use]
    pub fn dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Set the teardown reclaim policy.
    #[must_use]
    pub fn reclaim(mut self, timeout: Duration, attempts: u32) -> Self {
        self.reclaim_timeout = timeout;
        self.reclaim_attempts = attempts;
        self
    }

    /// Check the configuration for values the device can never accept.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.device.is_empty() {
            return Err(DecodeError::invalid_config("device path is empty"));
        }
        if self.input_buffers == 0 {
            return Err(DecodeError::invalid_config("input pool needs at least one buffer"));
        }
        if self.chunk_size == 0 {
            return Err(DecodeError::invalid_config("chunk size must be non-zero"));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(DecodeError::invalid_config("output dimensions must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let samples = [
            0,
            1,
            999_999,
            1_000_000,
            1_000_001,
            33_366_666,
            -1,
            -999_999,
            -1_000_000,
            -1_000_001,
            i64::MAX,
            i64::MIN,
        ];
        for t in samples {
            let ts = Timestamp::from_micros(t);
            assert_eq!(ts.as_micros(), t, "round trip of {}", t);
            assert!(ts.usec.abs() < MICROS_PER_SECOND);
        }
    }

    #[test]
    fn test_timestamp_split() {
        let ts = Timestamp::from_micros(2_500_000);
        assert_eq!(ts, Timestamp { sec: 2, usec: 500_000 });

        let ts = Timestamp::from_micros(999_999);
        assert_eq!(ts, Timestamp { sec: 0, usec: 999_999 });
    }

    #[test]
    fn test_codec_from_str() {
        assert_eq!("H264".parse::<Codec>().unwrap(), Codec::H264);
        assert_eq!("h265".parse::<Codec>().unwrap(), Codec::Hevc);
        assert_eq!("HEVC".parse::<Codec>().unwrap(), Codec::Hevc);
        assert!(matches!(
            "VP9".parse::<Codec>(),
            Err(DecodeError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn test_fourcc() {
        assert_eq!(Codec::H264.fourcc().to_string(), "H264");
        assert_eq!(Codec::Hevc.fourcc(), FourCc::new(b"H265"));
        // v4l2_fourcc('N', 'M', '1', '2')
        assert_eq!(FourCc::NV12M.as_u32(), 0x3231_4d4e);
    }

    #[test]
    fn test_expected_frame_size() {
        assert_eq!(expected_frame_size(1920, 1080, PixelFormat::I420), 1920 * 1080 * 3 / 2);
        assert_eq!(expected_frame_size(640, 480, PixelFormat::Nv12), 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_config_validate() {
        assert!(DecoderConfig::default().validate().is_ok());
        assert!(DecoderConfig::new(Codec::Hevc).size(1280, 720).validate().is_ok());
        assert!(DecoderConfig::default().input_buffers(0).validate().is_err());
        assert!(DecoderConfig::default().chunk_size(0).validate().is_err());
        assert!(DecoderConfig::default().width(0).validate().is_err());
        assert!(DecoderConfig::default().device("").validate().is_err());
    }
}
