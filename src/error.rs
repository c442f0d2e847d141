//! Error types for decode sessions.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors reported by a [`DeviceControl`](crate::DeviceControl) implementation.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Underlying system call failed.
    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),

    /// The device refused the request.
    #[error("device rejected request: {0}")]
    Rejected(String),

    /// The buffer slot is still owned by the device.
    #[error("buffer slot {index} is still in flight")]
    SlotInFlight { index: u32 },

    /// The plane is not in a state that allows the request.
    #[error("invalid plane state: {0}")]
    InvalidState(String),

    /// Unknown surface handle.
    #[error("unknown surface handle {0}")]
    UnknownSurface(i32),
}

impl DeviceError {
    /// Create a Rejected error with a message.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Create an InvalidState error with a message.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Session construction steps, reported by [`DecodeError::Construction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstructionStep {
    Open,
    Subscribe,
    InputPlaneFormat,
    FrameInputMode,
    InputPlaneSetup,
    InputStreamOn,
}

impl ConstructionStep {
    /// Short stable name of the step.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Subscribe => "subscribe",
            Self::InputPlaneFormat => "input_plane_format",
            Self::FrameInputMode => "frame_input_mode",
            Self::InputPlaneSetup => "input_plane_setup",
            Self::InputStreamOn => "input_stream_on",
        }
    }
}

impl fmt::Display for ConstructionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while creating or driving a decode session.
///
/// Every variant names the protocol step that failed. None of them is
/// recoverable mid-operation: the caller should destroy the session and
/// create a new one.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Codec name is not one of the supported bitstream formats.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Invalid session configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session construction failed.
    #[error("failed to create decoder at step {step}: {source}")]
    Construction {
        step: ConstructionStep,
        #[source]
        source: DeviceError,
    },

    /// Waiting for the resolution-change event failed.
    #[error("waiting for resolution change event failed: {0}")]
    EventWait(#[source] DeviceError),

    /// Querying the negotiated output format failed.
    #[error("failed to query output format: {0}")]
    FormatQuery(#[source] DeviceError),

    /// Querying the output crop rectangle failed.
    #[error("failed to query output crop: {0}")]
    CropQuery(#[source] DeviceError),

    /// Allocating the transfer surface failed.
    #[error("failed to allocate transfer surface: {0}")]
    SurfaceAlloc(#[source] DeviceError),

    /// Querying the minimum output buffer count failed.
    #[error("failed to query minimum output buffers: {0}")]
    MinBuffersQuery(#[source] DeviceError),

    /// Setting the output plane format failed.
    #[error("failed to set output plane format: {0}")]
    PlaneFormat(#[source] DeviceError),

    /// Requesting the output buffer pool failed.
    #[error("failed to set up output plane: {0}")]
    PlaneSetup(#[source] DeviceError),

    /// Turning on output streaming failed.
    #[error("failed to start output streaming: {0}")]
    StreamOn(#[source] DeviceError),

    /// Enqueueing a buffer failed (includes input backpressure).
    #[error("failed to enqueue buffer: {0}")]
    Enqueue(#[source] DeviceError),

    /// Chunk does not fit in an input buffer.
    #[error("chunk of {size} bytes exceeds input buffer capacity of {capacity} bytes")]
    ChunkTooLarge { size: usize, capacity: u32 },

    /// Submission after end-of-stream was signalled.
    #[error("end of stream already signalled")]
    EndOfStream,

    /// Dequeueing a decoded surface failed.
    #[error("failed to dequeue decoded surface: {0}")]
    Drain(#[source] DeviceError),

    /// The surface transform failed.
    #[error("surface transform failed: {0}")]
    Transform(#[source] DeviceError),

    /// Returning an output buffer to the device failed.
    #[error("failed to requeue output buffer: {0}")]
    Requeue(#[source] DeviceError),

    /// Resolving a surface plane's layout failed.
    #[error("failed to resolve layout of surface plane {plane}: {source}")]
    SurfaceQuery {
        plane: u32,
        #[source]
        source: DeviceError,
    },

    /// Mapping a surface plane failed.
    #[error("failed to map surface plane {plane}: {source}")]
    Map {
        plane: u32,
        #[source]
        source: DeviceError,
    },

    /// Unmapping a surface plane failed.
    #[error("failed to unmap surface plane {plane}: {source}")]
    Unmap {
        plane: u32,
        #[source]
        source: DeviceError,
    },

    /// Reclaiming completed input buffers failed.
    #[error("failed to reclaim input buffers: {0}")]
    InputReclaim(#[source] DeviceError),

    /// Negotiation failed earlier; the session can only be destroyed.
    #[error("session unusable after failed negotiation")]
    SessionFailed,

    /// Turning off streaming or releasing a pool during teardown failed.
    #[error("teardown failed: {0}")]
    Teardown(#[source] DeviceError),
}

impl DecodeError {
    /// Create an UnsupportedCodec error with a message.
    pub fn unsupported_codec(msg: impl Into<String>) -> Self {
        Self::UnsupportedCodec(msg.into())
    }

    /// Create an InvalidConfig error with a message.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Short stable name of the failing step, for binding layers that map
    /// errors onto their own representation.
    #[must_use]
    pub fn step(&self) -> &'static str {
        match self {
            Self::UnsupportedCodec(_) => "codec",
            Self::InvalidConfig(_) => "config",
            Self::Construction { step, .. } => step.as_str(),
            Self::EventWait(_) => "event_wait",
            Self::FormatQuery(_) => "format_query",
            Self::CropQuery(_) => "crop_query",
            Self::SurfaceAlloc(_) => "surface_alloc",
            Self::MinBuffersQuery(_) => "min_buffers_query",
            Self::PlaneFormat(_) => "plane_format",
            Self::PlaneSetup(_) => "plane_setup",
            Self::StreamOn(_) => "stream_on",
            Self::Enqueue(_) | Self::ChunkTooLarge { .. } | Self::EndOfStream => "enqueue",
            Self::Drain(_) => "dequeue",
            Self::Transform(_) => "transform",
            Self::Requeue(_) => "requeue",
            Self::SurfaceQuery { .. } | Self::Map { .. } => "map",
            Self::Unmap { .. } => "unmap",
            Self::InputReclaim(_) => "input_reclaim",
            Self::SessionFailed => "session_failed",
            Self::Teardown(_) => "teardown",
        }
    }

    /// Whether the failure happened while building the session.
    #[must_use]
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Self::Construction { .. } | Self::UnsupportedCodec(_) | Self::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_display_names_step() {
        let err = DecodeError::Construction {
            step: ConstructionStep::Subscribe,
            source: DeviceError::rejected("no such event"),
        };
        assert_eq!(err.step(), "subscribe");
        assert!(err.is_construction());
        assert!(err.to_string().contains("subscribe"));
    }

    #[test]
    fn test_backpressure_is_an_enqueue_failure() {
        let err = DecodeError::Enqueue(DeviceError::SlotInFlight { index: 3 });
        assert_eq!(err.step(), "enqueue");
        assert!(!err.is_construction());
        assert!(err.to_string().contains("slot 3"));
    }

    #[test]
    fn test_failed_session_step() {
        assert_eq!(DecodeError::SessionFailed.step(), "session_failed");
        assert!(!DecodeError::SessionFailed.is_construction());
    }
}
