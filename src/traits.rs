//! Decoder-facing trait and frame type.

use crate::{Codec, DecodeError, PixelFormat};

/// A decoded frame copied out of the transfer surface.
///
/// The data is owned by the caller and never aliases device memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Packed planar pixel data, planes in Y, U, V order without padding.
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format of `data`.
    pub pixel_format: PixelFormat,
    /// Presentation timestamp in microseconds, as submitted with the chunk.
    pub pts_us: i64,
    /// Position of the frame in the session's output (monotonically increasing).
    pub frame_index: u64,
}

impl DecodedFrame {
    /// Create a new decoded frame.
    #[must_use]
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        pts_us: i64,
        frame_index: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            pixel_format,
            pts_us,
            frame_index,
        }
    }

    /// The `(bytes, timestamp)` pair handed to binding layers.
    #[must_use]
    pub fn into_parts(self) -> (Vec<u8>, i64) {
        (self.data, self.pts_us)
    }
}

/// Trait for video decoders.
///
/// # Example
///
/// ```ignore
/// use mmapi_decoder::{Codec, DecodeSession, DecoderConfig, VideoDecoder};
///
/// let config = DecoderConfig::new(Codec::H264);
/// let mut decoder = DecodeSession::create(config, open_device)?;
///
/// for (chunk, pts) in access_units {
///     for frame in decoder.decode(&chunk, pts)? {
///         // frame.data holds I420 pixels
///     }
/// }
///
/// // Collect frames still held by the hardware
/// for frame in decoder.flush()? {
///     // ...
/// }
/// ```
pub trait VideoDecoder {
    /// Submit one chunk of bitstream and return every frame that is ready.
    ///
    /// Hardware decoders hold frames back for reordering, so a chunk does
    /// not map to a frame one-to-one.
    fn decode(&mut self, chunk: &[u8], pts_us: i64) -> Result<Vec<DecodedFrame>, DecodeError>;

    /// Signal end of stream and return every remaining frame.
    fn flush(&mut self) -> Result<Vec<DecodedFrame>, DecodeError>;

    /// Returns the codec being decoded.
    fn codec(&self) -> Codec;

    /// Returns the output dimensions, if known.
    ///
    /// Dimensions are not known until the device has parsed the stream
    /// headers.
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// Returns the output pixel format.
    fn output_format(&self) -> PixelFormat;
}
