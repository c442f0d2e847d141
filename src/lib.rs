//! Hardware video decode sessions over a dual-queue buffer-plane protocol.
//!
//! A session drives a memory-to-memory hardware decoder (the V4L2 stateful
//! decoder model used by NVIDIA Jetson's MMAPI) through two queues:
//!
//! - the **input plane** takes compressed bitstream chunks,
//! - the **output plane** hands back decoded surfaces.
//!
//! The first chunk triggers a one-time negotiation: the session waits for
//! the device's resolution-change event, allocates a transfer surface and
//! builds the output pool. Every decoded surface is then transformed into
//! the transfer surface, recycled to the device and copied out as packed
//! I420 bytes.
//!
//! # Quick Start
//!
//! ```ignore
//! use mmapi_decoder::{Codec, DecodeSession, DecoderConfig};
//!
//! let config = DecoderConfig::new(Codec::H264);
//! let mut session = DecodeSession::create(config, |path, flags| MyDevice::open(path, flags))?;
//!
//! for (chunk, pts_us) in stream {
//!     for frame in session.decode(&chunk, pts_us)? {
//!         // frame.data: I420 pixels, frame.pts_us: timestamp
//!     }
//! }
//!
//! let tail = session.flush()?;
//! session.destroy()?;
//! ```
//!
//! # Feature Flags
//!
//! - `sim` (default) - in-memory [`sim::SimDevice`] implementing the whole
//!   device protocol, for tests and the `sim-decode` binary
//!
//! # Architecture
//!
//! The hardware is reached only through the [`DeviceControl`] trait, so the
//! session state machine is independent of the driver binding. Both queues
//! are [`Plane`]s that track which slots the device owns.

mod device;
mod drain;
mod error;
mod input;
mod negotiate;
mod plane;
mod readback;
mod session;
mod traits;
mod types;

#[cfg(feature = "sim")]
pub mod sim;

pub use device::{
    BufferFlags, ColorFormat, Crop, DequeuedBuffer, DeviceControl, DeviceEvent, MemoryType,
    OpenFlags, PlaneFormat, PlaneKind, PlaneLayout, QueueRequest, SurfaceHandle, SurfaceLayout,
    SurfaceSpec, TransformFilter, TransformSpec,
};
pub use error::{ConstructionStep, DecodeError, DeviceError};
pub use input::InputQueue;
pub use negotiate::{Negotiated, TransferSurface};
pub use plane::Plane;
pub use readback::{copy_plane_rows, readback};
pub use session::DecodeSession;
pub use traits::{DecodedFrame, VideoDecoder};
pub use types::{
    expected_frame_size, Codec, DecoderConfig, FourCc, FrameInputMode, PixelFormat, Timestamp,
    DEFAULT_CHUNK_SIZE, DEFAULT_DEVICE, DEFAULT_INPUT_BUFFERS, MICROS_PER_SECOND,
};
