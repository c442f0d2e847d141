//! Hardware-control protocol consumed by decode sessions.
//!
//! [`DeviceControl`] is the seam between the session state machine and the
//! driver binding. A V4L2 memory-to-memory decoder maps onto it directly:
//! the input plane is the OUTPUT_MPLANE queue, the output plane is the
//! CAPTURE_MPLANE queue, and surfaces are dmabuf-backed hardware buffers.

use std::time::Duration;

use bitflags::bitflags;

use crate::{DeviceError, FourCc, FrameInputMode, Timestamp};

/// Which of the two queues a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
    /// Compressed bitstream queue.
    Input,
    /// Decoded surface queue.
    Output,
}

/// Buffer memory model of a plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Payload supplied by the caller on every enqueue.
    UserPtr,
    /// Buffers owned and mapped by the device.
    Mmap,
}

bitflags! {
    /// Per-buffer flags exchanged on enqueue and dequeue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// The buffer is the final one of the stream.
        const LAST = 0x0010_0000;
        /// The timestamp is copied from input to output.
        const TIMESTAMP_COPY = 0x0000_4000;
    }
}

/// Flags used when opening the device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags {
    /// Dequeue calls return instead of blocking when nothing is ready.
    pub nonblocking: bool,
}

/// Asynchronous device notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    /// Output format and dimensions are known or changed.
    ResolutionChange,
    /// The decoder finished the stream.
    EndOfStream,
    /// Any other event the device reports.
    Other(u32),
}

/// Pixel format and geometry of a plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaneFormat {
    pub pixel_format: FourCc,
    pub width: u32,
    pub height: u32,
    /// Per-buffer capacity for compressed formats (0 for raw formats).
    pub size_image: u32,
}

impl PlaneFormat {
    /// Format of a compressed bitstream plane.
    #[must_use]
    pub fn bitstream(pixel_format: FourCc, size_image: u32) -> Self {
        Self {
            pixel_format,
            width: 0,
            height: 0,
            size_image,
        }
    }

    /// Format of a raw surface plane.
    #[must_use]
    pub fn raw(pixel_format: FourCc, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
            size_image: 0,
        }
    }
}

/// Visible rectangle inside the decoded surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Crop {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Opaque handle of a hardware surface (a dmabuf descriptor on Linux).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub i32);

/// Memory layout of a hardware surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceLayout {
    Pitch,
    BlockLinear,
}

/// Color format of a hardware surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    /// Planar Y, U, V with 2x2 chroma subsampling.
    Yuv420,
    /// Y plane followed by an interleaved UV plane.
    Nv12,
}

impl ColorFormat {
    /// Number of memory planes.
    #[must_use]
    pub fn plane_count(&self) -> u32 {
        match self {
            Self::Yuv420 => 3,
            Self::Nv12 => 2,
        }
    }
}

/// Allocation request for a hardware surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceSpec {
    pub width: u32,
    pub height: u32,
    pub layout: SurfaceLayout,
    pub color: ColorFormat,
}

/// Geometry of one plane of a hardware surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
    /// Distance in bytes between the starts of two rows.
    pub pitch: u32,
    pub bytes_per_pixel: u32,
}

impl PlaneLayout {
    /// Bytes of pixel data in one row, without padding.
    #[must_use]
    pub fn row_size(&self) -> usize {
        self.width as usize * self.bytes_per_pixel as usize
    }

    /// Bytes of pixel data in the whole plane, without padding.
    #[must_use]
    pub fn packed_size(&self) -> usize {
        self.row_size() * self.height as usize
    }
}

/// Scaling filter of a surface transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransformFilter {
    /// Nearest-neighbor sampling.
    #[default]
    Nearest,
}

/// Parameters of a surface-to-surface transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransformSpec {
    pub filter: TransformFilter,
}

/// A buffer handed to the device.
#[derive(Debug, Clone, Copy)]
pub struct QueueRequest<'a> {
    pub index: u32,
    /// Bitstream bytes for input buffers; `None` for empty output buffers
    /// and for the end-of-stream marker.
    pub payload: Option<&'a [u8]>,
    pub timestamp: Timestamp,
    pub flags: BufferFlags,
}

impl<'a> QueueRequest<'a> {
    /// Empty buffer handed back for the device to fill.
    #[must_use]
    pub fn empty(index: u32) -> Self {
        Self {
            index,
            payload: None,
            timestamp: Timestamp::default(),
            flags: BufferFlags::empty(),
        }
    }

    /// Number of payload bytes the device should consume.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.payload.map_or(0, <[u8]>::len)
    }
}

/// A buffer returned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    /// Backing surface of output buffers.
    pub surface: Option<SurfaceHandle>,
    pub flags: BufferFlags,
    pub timestamp: Timestamp,
    pub bytes_used: u32,
}

/// Device-control operations a decode session is built on.
///
/// Implementations are driven from a single thread. Errors carry whatever the
/// driver reports; the session tags them with the step that failed.
pub trait DeviceControl {
    /// Subscribe to an asynchronous event kind.
    fn subscribe_event(&mut self, event: DeviceEvent) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for an event. `Ok(None)` means the wait timed out.
    fn wait_event(&mut self, timeout: Duration) -> Result<Option<DeviceEvent>, DeviceError>;

    /// Set the format of a plane. Must precede buffer pool setup.
    fn set_plane_format(&mut self, plane: PlaneKind, format: &PlaneFormat)
        -> Result<(), DeviceError>;

    /// Select how the decoder expects bitstream buffers to be framed.
    fn set_frame_input_mode(&mut self, mode: FrameInputMode) -> Result<(), DeviceError>;

    /// Query the current format of a plane.
    fn query_format(&mut self, plane: PlaneKind) -> Result<PlaneFormat, DeviceError>;

    /// Query the visible rectangle of a plane.
    fn query_crop(&mut self, plane: PlaneKind) -> Result<Crop, DeviceError>;

    /// Query the minimum number of buffers the plane needs.
    fn query_min_buffers(&mut self, plane: PlaneKind) -> Result<u32, DeviceError>;

    /// Request a buffer pool. Returns the number of buffers granted.
    fn setup_buffer_pool(
        &mut self,
        plane: PlaneKind,
        memory: MemoryType,
        count: u32,
    ) -> Result<u32, DeviceError>;

    /// Release a plane's buffer pool.
    fn release_buffer_pool(&mut self, plane: PlaneKind) -> Result<(), DeviceError>;

    /// Turn streaming on or off. Turning it off returns every queued buffer.
    fn set_stream_status(&mut self, plane: PlaneKind, on: bool) -> Result<(), DeviceError>;

    /// Hand a buffer to the device.
    fn enqueue_buffer(&mut self, plane: PlaneKind, request: &QueueRequest<'_>)
        -> Result<(), DeviceError>;

    /// Take back a buffer the device is done with. `Ok(None)` means nothing
    /// became ready within `timeout`.
    fn dequeue_buffer(
        &mut self,
        plane: PlaneKind,
        timeout: Duration,
    ) -> Result<Option<DequeuedBuffer>, DeviceError>;

    /// Allocate a hardware surface.
    fn allocate_surface(&mut self, spec: &SurfaceSpec) -> Result<SurfaceHandle, DeviceError>;

    /// Free a hardware surface.
    fn destroy_surface(&mut self, surface: SurfaceHandle) -> Result<(), DeviceError>;

    /// Convert/scale `src` into `dst` on the hardware.
    fn transform_surface(
        &mut self,
        src: SurfaceHandle,
        dst: SurfaceHandle,
        spec: &TransformSpec,
    ) -> Result<(), DeviceError>;

    /// Resolve the layout of one plane of a surface.
    fn surface_plane_layout(
        &self,
        surface: SurfaceHandle,
        plane: u32,
    ) -> Result<PlaneLayout, DeviceError>;

    /// Map one plane of a surface for CPU access.
    fn map_surface_plane(&mut self, surface: SurfaceHandle, plane: u32)
        -> Result<(), DeviceError>;

    /// Make pending device writes to a mapped plane visible to the CPU.
    fn sync_for_cpu(&mut self, surface: SurfaceHandle, plane: u32) -> Result<(), DeviceError>;

    /// Bytes of a mapped plane, `pitch * height` long.
    fn mapped_plane(&self, surface: SurfaceHandle, plane: u32) -> Result<&[u8], DeviceError>;

    /// Unmap a previously mapped plane.
    fn unmap_surface_plane(&mut self, surface: SurfaceHandle, plane: u32)
        -> Result<(), DeviceError>;
}
