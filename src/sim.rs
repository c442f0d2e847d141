//! In-memory decoder device.
//!
//! [`SimDevice`] follows the stateful memory-to-memory decoder protocol
//! closely enough to drive every session path without hardware:
//!
//! - the resolution-change event is raised by the first non-empty bitstream
//!   buffer,
//! - bitstream buffers are consumed only while both planes stream,
//! - decoded pictures are held back by a configurable reorder latency and
//!   handed out through the output plane, the final one flagged
//!   [`BufferFlags::LAST`],
//! - hardware surfaces are byte buffers whose row padding is filled with
//!   [`SimDevice::PADDING_BYTE`].
//!
//! Every device request can be made to fail with a [`SimFault`], and
//! [`SimStats`] exposes what the device saw, also after it was dropped.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::{
    BufferFlags, ColorFormat, Crop, DequeuedBuffer, DeviceControl, DeviceError, DeviceEvent,
    FourCc, FrameInputMode, MemoryType, PlaneFormat, PlaneKind, PlaneLayout, QueueRequest,
    SurfaceHandle, SurfaceLayout, SurfaceSpec, Timestamp, TransformSpec,
};

/// Coded sizes are whole macroblocks.
const MACROBLOCK: u32 = 16;

/// Device requests that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimFault {
    Subscribe,
    InputFormat,
    FrameInputMode,
    InputPool,
    InputStreamOn,
    WaitEvent,
    QueryFormat,
    QueryCrop,
    AllocateSurface,
    QueryMinBuffers,
    OutputFormat,
    OutputPool,
    OutputStreamOn,
    DequeueOutput,
    /// Fails enqueues of output buffers the device already handed out once.
    RequeueOutput,
    DequeueInput,
    Transform,
    MapSurface,
    UnmapSurface,
}

/// Counters kept by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub events_delivered: u32,
    pub surfaces_allocated_by_host: u32,
    pub surfaces_destroyed_by_host: u32,
    /// Planes with a buffer pool.
    pub live_pools: u32,
    /// Bitstream buffers owned by the device.
    pub inputs_in_flight: u32,
    pub inputs_enqueued: u32,
    pub output_dequeue_calls: u32,
    pub last_flags_sent: u32,
    /// The device handle was dropped.
    pub closed: bool,
}

impl SimStats {
    /// Host-allocated surfaces not yet destroyed.
    #[must_use]
    pub fn live_host_surfaces(&self) -> u32 {
        self.surfaces_allocated_by_host
            .saturating_sub(self.surfaces_destroyed_by_host)
    }
}

/// Shared view of a device's [`SimStats`].
#[derive(Debug, Clone, Default)]
pub struct StatsHandle(Rc<RefCell<SimStats>>);

impl StatsHandle {
    #[must_use]
    pub fn snapshot(&self) -> SimStats {
        self.0.borrow().clone()
    }

    fn update(&self, f: impl FnOnce(&mut SimStats)) {
        f(&mut self.0.borrow_mut());
    }
}

/// Behavior of a [`SimDevice`].
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Visible stream size reported after the resolution change.
    pub crop: (u32, u32),
    /// Consumed bitstream buffers become dequeueable right away.
    pub reclaim_input: bool,
    /// Pictures held back before the oldest is released.
    pub latency: usize,
    /// Consumed bitstream produces pictures at all.
    pub produce_frames: bool,
    /// Row pitch alignment of surfaces, in bytes.
    pub pitch_align: u32,
    pub faults: Vec<SimFault>,
    /// Events queued when resolution changes are subscribed.
    pub noise_events: Vec<DeviceEvent>,
    /// Resolution changes queued after the first one.
    pub extra_resolution_events: usize,
    /// Empty output polls before each decoded buffer is handed out.
    pub output_delay_polls: u32,
    pub min_output_buffers: u32,
    /// Release pictures in swapped pairs, like B-frame reordering.
    pub swap_pairs: bool,
    stats: StatsHandle,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            crop: (1920, 1080),
            reclaim_input: true,
            latency: 1,
            produce_frames: true,
            pitch_align: 256,
            faults: Vec::new(),
            noise_events: Vec::new(),
            extra_resolution_events: 0,
            output_delay_polls: 0,
            min_output_buffers: 6,
            swap_pairs: false,
            stats: StatsHandle::default(),
        }
    }
}

impl SimConfig {
    #[must_use]
    pub fn crop(mut self, width: u32, height: u32) -> Self {
        self.crop = (width, height);
        self
    }

    #[must_use]
    pub fn reclaim_input(mut self, reclaim: bool) -> Self {
        self.reclaim_input = reclaim;
        self
    }

    #[must_use]
    pub fn latency(mut self, pictures: usize) -> Self {
        self.latency = pictures;
        self
    }

    #[must_use]
    pub fn produce_frames(mut self, produce: bool) -> Self {
        self.produce_frames = produce;
        self
    }

    #[must_use]
    pub fn pitch_align(mut self, align: u32) -> Self {
        self.pitch_align = align;
        self
    }

    #[must_use]
    pub fn fault(mut self, fault: SimFault) -> Self {
        self.faults.push(fault);
        self
    }

    #[must_use]
    pub fn noise_events(mut self, events: Vec<DeviceEvent>) -> Self {
        self.noise_events = events;
        self
    }

    #[must_use]
    pub fn extra_resolution_events(mut self, count: usize) -> Self {
        self.extra_resolution_events = count;
        self
    }

    #[must_use]
    pub fn output_delay_polls(mut self, polls: u32) -> Self {
        self.output_delay_polls = polls;
        self
    }

    #[must_use]
    pub fn min_output_buffers(mut self, count: u32) -> Self {
        self.min_output_buffers = count;
        self
    }

    #[must_use]
    pub fn swap_pairs(mut self, swap: bool) -> Self {
        self.swap_pairs = swap;
        self
    }

    /// Handle to the stats of every device built from this config.
    #[must_use]
    pub fn stats_handle(&self) -> StatsHandle {
        self.stats.clone()
    }
}

/// A bitstream buffer as the device received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedInput {
    pub index: u32,
    pub bytes_used: u32,
    pub timestamp: Timestamp,
    pub flags: BufferFlags,
    seed: u8,
}

#[derive(Debug, Clone, Copy)]
struct Picture {
    timestamp: Timestamp,
    fill: u8,
    last: bool,
    empty: bool,
}

impl Picture {
    fn decoded(input: &SubmittedInput) -> Self {
        Self {
            timestamp: input.timestamp,
            // Keep pixel values clear of the padding byte.
            fill: input.seed % 0xD0,
            last: false,
            empty: false,
        }
    }

    fn end_of_stream() -> Self {
        Self {
            timestamp: Timestamp::default(),
            fill: 0,
            last: true,
            empty: true,
        }
    }
}

#[derive(Debug)]
struct ReadyBuffer {
    index: u32,
    picture: Picture,
    delay: u32,
}

#[derive(Debug, Default)]
struct SimPlane {
    format: Option<PlaneFormat>,
    owned: Vec<bool>,
    streaming: bool,
}

impl SimPlane {
    fn pool(&self) -> u32 {
        self.owned.len() as u32
    }
}

#[derive(Debug)]
struct SimSurface {
    spec: SurfaceSpec,
    layouts: Vec<PlaneLayout>,
    /// Backing memory; empty for device-internal surfaces.
    planes: Vec<Vec<u8>>,
    fill: Option<u8>,
    host: bool,
}

impl SimSurface {
    fn paint(&mut self, value: u8) {
        for (n, (layout, bytes)) in self.layouts.iter().zip(self.planes.iter_mut()).enumerate() {
            let v = value.wrapping_add(n as u8);
            let pitch = layout.pitch as usize;
            let row_size = layout.row_size();
            for row in bytes.chunks_mut(pitch).take(layout.height as usize) {
                row[..row_size].fill(v);
            }
        }
        self.fill = Some(value);
    }
}

/// Simulated decoder device.
#[derive(Debug)]
pub struct SimDevice {
    config: SimConfig,
    path: Option<String>,
    subscribed: Vec<DeviceEvent>,
    events: VecDeque<DeviceEvent>,
    resolution_announced: bool,
    frame_input: FrameInputMode,
    input: SimPlane,
    output: SimPlane,
    input_pending: VecDeque<SubmittedInput>,
    input_consumed: Vec<SubmittedInput>,
    input_done: VecDeque<SubmittedInput>,
    last_input: Option<SubmittedInput>,
    held: VecDeque<Picture>,
    decoded: VecDeque<Picture>,
    free_outputs: VecDeque<u32>,
    ready: VecDeque<ReadyBuffer>,
    output_surfaces: Vec<SurfaceHandle>,
    outputs_dequeued: u64,
    eos_pending: bool,
    last_flagged_pts: Option<i64>,
    surfaces: HashMap<i32, SimSurface>,
    next_handle: i32,
    mapped: HashSet<(i32, u32)>,
}

impl SimDevice {
    /// Value of every row padding byte in host surfaces.
    pub const PADDING_BYTE: u8 = 0xEE;

    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            path: None,
            subscribed: Vec::new(),
            events: VecDeque::new(),
            resolution_announced: false,
            frame_input: FrameInputMode::default(),
            input: SimPlane::default(),
            output: SimPlane::default(),
            input_pending: VecDeque::new(),
            input_consumed: Vec::new(),
            input_done: VecDeque::new(),
            last_input: None,
            held: VecDeque::new(),
            decoded: VecDeque::new(),
            free_outputs: VecDeque::new(),
            ready: VecDeque::new(),
            output_surfaces: Vec::new(),
            outputs_dequeued: 0,
            eos_pending: false,
            last_flagged_pts: None,
            surfaces: HashMap::new(),
            next_handle: 100,
            mapped: HashSet::new(),
        }
    }

    /// A device that remembers the node path it was opened at.
    pub fn open(path: &str, config: SimConfig) -> Self {
        tracing::debug!("Simulated decoder opened at {}", path);
        let mut device = Self::new(config);
        device.path = Some(path.to_string());
        device
    }

    #[must_use]
    pub fn opened_path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn stats(&self) -> SimStats {
        self.config.stats.snapshot()
    }

    #[must_use]
    pub fn stats_handle(&self) -> StatsHandle {
        self.config.stats.clone()
    }

    /// Events queued but not yet delivered.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn surface_spec(&self, surface: SurfaceHandle) -> Option<SurfaceSpec> {
        self.surfaces.get(&surface.0).map(|s| s.spec)
    }

    /// Surface planes currently mapped for CPU access.
    #[must_use]
    pub fn mapped_count(&self) -> usize {
        self.mapped.len()
    }

    /// The most recent bitstream buffer enqueued.
    #[must_use]
    pub fn last_input(&self) -> Option<SubmittedInput> {
        self.last_input
    }

    /// Timestamp of the picture flagged as the last one.
    #[must_use]
    pub fn last_flagged_pts(&self) -> Option<i64> {
        self.last_flagged_pts
    }

    #[must_use]
    pub fn frame_input_mode(&self) -> FrameInputMode {
        self.frame_input
    }

    /// Hand every bitstream buffer the device owns back without decoding it.
    pub fn complete_input(&mut self) {
        let pending: Vec<_> = self.input_pending.drain(..).collect();
        self.input_done.extend(pending);
        self.input_done.extend(self.input_consumed.drain(..));
    }

    /// Fill the pixels of every plane of a host surface. Plane `n` gets
    /// `value + n`.
    pub fn paint_surface(&mut self, surface: SurfaceHandle, value: u8) {
        if let Some(s) = self.surfaces.get_mut(&surface.0) {
            s.paint(value);
        }
    }

    fn check(&self, fault: SimFault) -> Result<(), DeviceError> {
        if self.config.faults.contains(&fault) {
            return Err(DeviceError::rejected(format!("injected {:?} failure", fault)));
        }
        Ok(())
    }

    fn plane(&self, kind: PlaneKind) -> &SimPlane {
        match kind {
            PlaneKind::Input => &self.input,
            PlaneKind::Output => &self.output,
        }
    }

    fn plane_mut(&mut self, kind: PlaneKind) -> &mut SimPlane {
        match kind {
            PlaneKind::Input => &mut self.input,
            PlaneKind::Output => &mut self.output,
        }
    }

    fn coded_size(&self) -> (u32, u32) {
        let (width, height) = self.config.crop;
        (align_up(width, MACROBLOCK), align_up(height, MACROBLOCK))
    }

    fn plane_layouts(&self, width: u32, height: u32, color: ColorFormat) -> Vec<PlaneLayout> {
        let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
        let planes = match color {
            ColorFormat::Yuv420 => vec![(width, height, 1), (cw, ch, 1), (cw, ch, 1)],
            ColorFormat::Nv12 => vec![(width, height, 1), (cw, ch, 2)],
        };
        planes
            .into_iter()
            .map(|(w, h, bpp)| PlaneLayout {
                width: w,
                height: h,
                pitch: align_up(w * bpp, self.config.pitch_align),
                bytes_per_pixel: bpp,
            })
            .collect()
    }

    fn insert_surface(&mut self, spec: SurfaceSpec, host: bool) -> SurfaceHandle {
        let layouts = self.plane_layouts(spec.width, spec.height, spec.color);
        let planes = if host {
            layouts
                .iter()
                .map(|l| vec![Self::PADDING_BYTE; l.pitch as usize * l.height as usize])
                .collect()
        } else {
            Vec::new()
        };
        let handle = SurfaceHandle(self.next_handle);
        self.next_handle += 1;
        self.surfaces.insert(
            handle.0,
            SimSurface {
                spec,
                layouts,
                planes,
                fill: None,
                host,
            },
        );
        handle
    }

    fn announce_resolution(&mut self) {
        self.resolution_announced = true;
        if !self.subscribed.contains(&DeviceEvent::ResolutionChange) {
            return;
        }
        let (width, height) = self.config.crop;
        tracing::debug!("Stream headers parsed: {}x{}", width, height);
        self.events.push_back(DeviceEvent::ResolutionChange);
        for _ in 0..self.config.extra_resolution_events {
            self.events.push_back(DeviceEvent::ResolutionChange);
        }
    }

    /// Advance decoding as far as the queued buffers allow.
    fn pump(&mut self) {
        if !(self.input.streaming && self.output.streaming) {
            return;
        }

        while let Some(buffer) = self.input_pending.pop_front() {
            if buffer.bytes_used == 0 {
                self.eos_pending = true;
            } else if self.config.produce_frames {
                self.held.push_back(Picture::decoded(&buffer));
            }
            if self.config.reclaim_input {
                self.input_done.push_back(buffer);
            } else {
                self.input_consumed.push(buffer);
            }
        }

        self.release_pictures();
        self.fill_output_buffers();
    }

    fn release_pictures(&mut self) {
        let flushing = self.eos_pending;
        loop {
            let due = if flushing {
                !self.held.is_empty()
            } else {
                self.held.len() > self.config.latency
                    && (!self.config.swap_pairs || self.held.len() >= 2)
            };
            if !due {
                break;
            }
            if self.config.swap_pairs && self.held.len() >= 2 {
                if let (Some(first), Some(second)) = (self.held.pop_front(), self.held.pop_front())
                {
                    self.decoded.push_back(second);
                    self.decoded.push_back(first);
                }
            } else if let Some(picture) = self.held.pop_front() {
                self.decoded.push_back(picture);
            }
        }

        if !flushing {
            return;
        }
        self.eos_pending = false;
        if let Some(picture) = self.decoded.back_mut() {
            picture.last = true;
        } else if let Some(buffer) = self.ready.back_mut() {
            buffer.picture.last = true;
            let picture = buffer.picture;
            self.note_last(&picture);
        } else {
            self.decoded.push_back(Picture::end_of_stream());
        }
    }

    fn fill_output_buffers(&mut self) {
        while let Some(&index) = self.free_outputs.front() {
            let Some(picture) = self.decoded.pop_front() else {
                break;
            };
            self.free_outputs.pop_front();
            if picture.last {
                self.note_last(&picture);
            }
            self.ready.push_back(ReadyBuffer {
                index,
                picture,
                delay: self.config.output_delay_polls,
            });
        }
    }

    fn note_last(&mut self, picture: &Picture) {
        self.config.stats.update(|s| s.last_flags_sent += 1);
        if !picture.empty {
            self.last_flagged_pts = Some(picture.timestamp.as_micros());
        }
    }

    fn refresh_stats(&self) {
        let live_pools = [&self.input, &self.output]
            .iter()
            .filter(|p| p.pool() > 0)
            .count() as u32;
        let in_flight = self.input.owned.iter().filter(|o| **o).count() as u32;
        self.config.stats.update(|s| {
            s.live_pools = live_pools;
            s.inputs_in_flight = in_flight;
        });
    }

    fn dequeue_input(&mut self) -> Result<Option<DequeuedBuffer>, DeviceError> {
        self.check(SimFault::DequeueInput)?;
        self.pump();
        let Some(buffer) = self.input_done.pop_front() else {
            return Ok(None);
        };
        if let Some(owned) = self.input.owned.get_mut(buffer.index as usize) {
            *owned = false;
        }
        self.refresh_stats();
        Ok(Some(DequeuedBuffer {
            index: buffer.index,
            surface: None,
            flags: buffer.flags,
            timestamp: buffer.timestamp,
            bytes_used: buffer.bytes_used,
        }))
    }

    fn dequeue_output(&mut self) -> Result<Option<DequeuedBuffer>, DeviceError> {
        self.config.stats.update(|s| s.output_dequeue_calls += 1);
        self.check(SimFault::DequeueOutput)?;
        self.pump();

        match self.ready.front_mut() {
            None => return Ok(None),
            Some(buffer) if buffer.delay > 0 => {
                buffer.delay -= 1;
                return Ok(None);
            }
            Some(_) => {}
        }
        let Some(buffer) = self.ready.pop_front() else {
            return Ok(None);
        };

        let surface = self.output_surfaces.get(buffer.index as usize).copied();
        if let Some(s) = surface.and_then(|h| self.surfaces.get_mut(&h.0)) {
            s.fill = Some(buffer.picture.fill);
        }
        if let Some(owned) = self.output.owned.get_mut(buffer.index as usize) {
            *owned = false;
        }
        self.outputs_dequeued += 1;

        let mut flags = BufferFlags::empty();
        if buffer.picture.last {
            flags |= BufferFlags::LAST;
        }
        let bytes_used = if buffer.picture.empty {
            0
        } else {
            let (width, height) = self.coded_size();
            width * height * 3 / 2
        };
        Ok(Some(DequeuedBuffer {
            index: buffer.index,
            surface,
            flags,
            timestamp: buffer.picture.timestamp,
            bytes_used,
        }))
    }
}

impl DeviceControl for SimDevice {
    fn subscribe_event(&mut self, event: DeviceEvent) -> Result<(), DeviceError> {
        self.check(SimFault::Subscribe)?;
        if !self.subscribed.contains(&event) {
            self.subscribed.push(event);
            if event == DeviceEvent::ResolutionChange {
                self.events.extend(self.config.noise_events.iter().copied());
            }
        }
        Ok(())
    }

    fn wait_event(&mut self, _timeout: Duration) -> Result<Option<DeviceEvent>, DeviceError> {
        self.check(SimFault::WaitEvent)?;
        let event = self.events.pop_front();
        if event.is_some() {
            self.config.stats.update(|s| s.events_delivered += 1);
        }
        Ok(event)
    }

    fn set_plane_format(
        &mut self,
        plane: PlaneKind,
        format: &PlaneFormat,
    ) -> Result<(), DeviceError> {
        self.check(match plane {
            PlaneKind::Input => SimFault::InputFormat,
            PlaneKind::Output => SimFault::OutputFormat,
        })?;
        let state = self.plane_mut(plane);
        if state.pool() > 0 {
            return Err(DeviceError::rejected("format change with buffers allocated"));
        }
        state.format = Some(*format);
        Ok(())
    }

    fn set_frame_input_mode(&mut self, mode: FrameInputMode) -> Result<(), DeviceError> {
        self.check(SimFault::FrameInputMode)?;
        self.frame_input = mode;
        Ok(())
    }

    fn query_format(&mut self, plane: PlaneKind) -> Result<PlaneFormat, DeviceError> {
        self.check(SimFault::QueryFormat)?;
        match plane {
            PlaneKind::Input => self
                .input
                .format
                .ok_or_else(|| DeviceError::rejected("bitstream format not set")),
            PlaneKind::Output if self.resolution_announced => {
                let (width, height) = self.coded_size();
                Ok(PlaneFormat::raw(FourCc::NV12M, width, height))
            }
            PlaneKind::Output => Err(DeviceError::rejected("stream format not known yet")),
        }
    }

    fn query_crop(&mut self, plane: PlaneKind) -> Result<Crop, DeviceError> {
        self.check(SimFault::QueryCrop)?;
        if plane == PlaneKind::Input || !self.resolution_announced {
            return Err(DeviceError::rejected("no crop rectangle available"));
        }
        let (width, height) = self.config.crop;
        Ok(Crop {
            left: 0,
            top: 0,
            width,
            height,
        })
    }

    fn query_min_buffers(&mut self, plane: PlaneKind) -> Result<u32, DeviceError> {
        self.check(SimFault::QueryMinBuffers)?;
        Ok(match plane {
            PlaneKind::Input => 1,
            PlaneKind::Output => self.config.min_output_buffers,
        })
    }

    fn setup_buffer_pool(
        &mut self,
        plane: PlaneKind,
        memory: MemoryType,
        count: u32,
    ) -> Result<u32, DeviceError> {
        self.check(match plane {
            PlaneKind::Input => SimFault::InputPool,
            PlaneKind::Output => SimFault::OutputPool,
        })?;
        if count == 0 {
            self.release_buffer_pool(plane)?;
            return Ok(0);
        }
        let expected = match plane {
            PlaneKind::Input => MemoryType::UserPtr,
            PlaneKind::Output => MemoryType::Mmap,
        };
        if memory != expected {
            return Err(DeviceError::rejected(format!(
                "{:?} plane does not support {:?} memory",
                plane, memory
            )));
        }
        let state = self.plane(plane);
        if state.format.is_none() {
            return Err(DeviceError::rejected("buffer pool requested before format"));
        }
        if state.pool() > 0 {
            return Err(DeviceError::rejected("buffer pool already allocated"));
        }

        let granted = match plane {
            PlaneKind::Input => count,
            PlaneKind::Output => count.max(self.config.min_output_buffers),
        };
        if plane == PlaneKind::Output {
            let (width, height) = self.coded_size();
            let spec = SurfaceSpec {
                width,
                height,
                layout: SurfaceLayout::BlockLinear,
                color: ColorFormat::Nv12,
            };
            for _ in 0..granted {
                let handle = self.insert_surface(spec, false);
                self.output_surfaces.push(handle);
            }
        }
        self.plane_mut(plane).owned = vec![false; granted as usize];
        self.refresh_stats();
        tracing::trace!("{:?} pool: {} of {} buffers", plane, granted, count);
        Ok(granted)
    }

    fn release_buffer_pool(&mut self, plane: PlaneKind) -> Result<(), DeviceError> {
        if self.plane(plane).streaming {
            return Err(DeviceError::rejected("buffer pool released while streaming"));
        }
        self.plane_mut(plane).owned.clear();
        match plane {
            PlaneKind::Input => {
                self.input_pending.clear();
                self.input_consumed.clear();
                self.input_done.clear();
            }
            PlaneKind::Output => {
                for handle in self.output_surfaces.drain(..) {
                    self.surfaces.remove(&handle.0);
                }
                self.free_outputs.clear();
                self.ready.clear();
            }
        }
        self.refresh_stats();
        Ok(())
    }

    fn set_stream_status(&mut self, plane: PlaneKind, on: bool) -> Result<(), DeviceError> {
        if on {
            self.check(match plane {
                PlaneKind::Input => SimFault::InputStreamOn,
                PlaneKind::Output => SimFault::OutputStreamOn,
            })?;
            if self.plane(plane).pool() == 0 {
                return Err(DeviceError::rejected("stream on without buffers"));
            }
        }

        let state = self.plane_mut(plane);
        state.streaming = on;
        if !on {
            state.owned.iter_mut().for_each(|owned| *owned = false);
            match plane {
                PlaneKind::Input => {
                    self.input_pending.clear();
                    self.input_consumed.clear();
                    self.input_done.clear();
                }
                PlaneKind::Output => {
                    self.free_outputs.clear();
                    self.ready.clear();
                }
            }
        }
        self.pump();
        self.refresh_stats();
        Ok(())
    }

    fn enqueue_buffer(
        &mut self,
        plane: PlaneKind,
        request: &QueueRequest<'_>,
    ) -> Result<(), DeviceError> {
        let index = request.index as usize;
        match self.plane(plane).owned.get(index) {
            None => {
                return Err(DeviceError::rejected(format!(
                    "{:?} buffer {} outside pool",
                    plane, request.index
                )))
            }
            Some(true) => {
                return Err(DeviceError::rejected(format!(
                    "{:?} buffer {} already queued",
                    plane, request.index
                )))
            }
            Some(false) => {}
        }

        match plane {
            PlaneKind::Input => {
                let bytes_used = request.bytes_used();
                let capacity = self.input.format.map_or(0, |f| f.size_image) as usize;
                if bytes_used > capacity {
                    return Err(DeviceError::rejected(format!(
                        "{} bytes exceed buffer size {}",
                        bytes_used, capacity
                    )));
                }
                let buffer = SubmittedInput {
                    index: request.index,
                    bytes_used: bytes_used as u32,
                    timestamp: request.timestamp,
                    flags: request.flags,
                    seed: request.payload.and_then(|p| p.first().copied()).unwrap_or(0),
                };
                if bytes_used > 0 && !self.resolution_announced {
                    self.announce_resolution();
                }
                self.last_input = Some(buffer);
                self.input_pending.push_back(buffer);
                self.config.stats.update(|s| s.inputs_enqueued += 1);
            }
            PlaneKind::Output => {
                if self.outputs_dequeued > 0 {
                    self.check(SimFault::RequeueOutput)?;
                }
                self.free_outputs.push_back(request.index);
            }
        }

        if let Some(owned) = self.plane_mut(plane).owned.get_mut(index) {
            *owned = true;
        }
        self.pump();
        self.refresh_stats();
        Ok(())
    }

    fn dequeue_buffer(
        &mut self,
        plane: PlaneKind,
        _timeout: Duration,
    ) -> Result<Option<DequeuedBuffer>, DeviceError> {
        match plane {
            PlaneKind::Input => self.dequeue_input(),
            PlaneKind::Output => self.dequeue_output(),
        }
    }

    fn allocate_surface(&mut self, spec: &SurfaceSpec) -> Result<SurfaceHandle, DeviceError> {
        self.check(SimFault::AllocateSurface)?;
        if spec.width == 0 || spec.height == 0 {
            return Err(DeviceError::rejected("surface of zero size"));
        }
        let handle = self.insert_surface(*spec, true);
        self.config
            .stats
            .update(|s| s.surfaces_allocated_by_host += 1);
        Ok(handle)
    }

    fn destroy_surface(&mut self, surface: SurfaceHandle) -> Result<(), DeviceError> {
        match self.surfaces.get(&surface.0) {
            None => return Err(DeviceError::UnknownSurface(surface.0)),
            Some(s) if !s.host => {
                return Err(DeviceError::rejected("surface belongs to the output pool"))
            }
            Some(_) => {}
        }
        self.surfaces.remove(&surface.0);
        self.mapped.retain(|(handle, _)| *handle != surface.0);
        self.config
            .stats
            .update(|s| s.surfaces_destroyed_by_host += 1);
        Ok(())
    }

    fn transform_surface(
        &mut self,
        src: SurfaceHandle,
        dst: SurfaceHandle,
        _spec: &TransformSpec,
    ) -> Result<(), DeviceError> {
        self.check(SimFault::Transform)?;
        let fill = self
            .surfaces
            .get(&src.0)
            .ok_or(DeviceError::UnknownSurface(src.0))?
            .fill
            .unwrap_or(0);
        let target = self
            .surfaces
            .get_mut(&dst.0)
            .ok_or(DeviceError::UnknownSurface(dst.0))?;
        if !target.host {
            return Err(DeviceError::rejected("transform into an output pool surface"));
        }
        target.paint(fill);
        Ok(())
    }

    fn surface_plane_layout(
        &self,
        surface: SurfaceHandle,
        plane: u32,
    ) -> Result<PlaneLayout, DeviceError> {
        self.surfaces
            .get(&surface.0)
            .ok_or(DeviceError::UnknownSurface(surface.0))?
            .layouts
            .get(plane as usize)
            .copied()
            .ok_or_else(|| DeviceError::rejected(format!("surface has no plane {}", plane)))
    }

    fn map_surface_plane(&mut self, surface: SurfaceHandle, plane: u32) -> Result<(), DeviceError> {
        self.check(SimFault::MapSurface)?;
        let s = self
            .surfaces
            .get(&surface.0)
            .ok_or(DeviceError::UnknownSurface(surface.0))?;
        if plane as usize >= s.planes.len() {
            return Err(DeviceError::rejected(format!("plane {} is not mappable", plane)));
        }
        if !self.mapped.insert((surface.0, plane)) {
            return Err(DeviceError::rejected(format!("plane {} already mapped", plane)));
        }
        Ok(())
    }

    fn sync_for_cpu(&mut self, surface: SurfaceHandle, plane: u32) -> Result<(), DeviceError> {
        if !self.mapped.contains(&(surface.0, plane)) {
            return Err(DeviceError::rejected(format!("plane {} is not mapped", plane)));
        }
        Ok(())
    }

    fn mapped_plane(&self, surface: SurfaceHandle, plane: u32) -> Result<&[u8], DeviceError> {
        if !self.mapped.contains(&(surface.0, plane)) {
            return Err(DeviceError::rejected(format!("plane {} is not mapped", plane)));
        }
        self.surfaces
            .get(&surface.0)
            .ok_or(DeviceError::UnknownSurface(surface.0))?
            .planes
            .get(plane as usize)
            .map(Vec::as_slice)
            .ok_or_else(|| DeviceError::rejected(format!("plane {} has no memory", plane)))
    }

    fn unmap_surface_plane(
        &mut self,
        surface: SurfaceHandle,
        plane: u32,
    ) -> Result<(), DeviceError> {
        self.check(SimFault::UnmapSurface)?;
        if !self.mapped.remove(&(surface.0, plane)) {
            return Err(DeviceError::rejected(format!("plane {} is not mapped", plane)));
        }
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.config.stats.update(|s| s.closed = true);
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_device(config: SimConfig) -> SimDevice {
        let mut device = SimDevice::new(config);
        device.subscribe_event(DeviceEvent::ResolutionChange).unwrap();
        device
            .set_plane_format(PlaneKind::Input, &PlaneFormat::bitstream(FourCc::H264, 64))
            .unwrap();
        device
            .setup_buffer_pool(PlaneKind::Input, MemoryType::UserPtr, 4)
            .unwrap();
        device.set_stream_status(PlaneKind::Input, true).unwrap();
        device
    }

    fn chunk(index: u32, data: &[u8], us: i64) -> QueueRequest<'_> {
        QueueRequest {
            index,
            payload: Some(data),
            timestamp: Timestamp::from_micros(us),
            flags: BufferFlags::TIMESTAMP_COPY,
        }
    }

    #[test]
    fn test_resolution_event_after_first_chunk() {
        let mut device = streaming_device(SimConfig::default());
        assert_eq!(device.wait_event(Duration::ZERO).unwrap(), None);
        assert!(device.query_format(PlaneKind::Output).is_err());

        device
            .enqueue_buffer(PlaneKind::Input, &chunk(0, &[1, 2], 0))
            .unwrap();
        assert_eq!(
            device.wait_event(Duration::ZERO).unwrap(),
            Some(DeviceEvent::ResolutionChange)
        );
        let format = device.query_format(PlaneKind::Output).unwrap();
        assert_eq!((format.width, format.height), (1920, 1088));
        assert_eq!(device.query_crop(PlaneKind::Output).unwrap().height, 1080);
    }

    #[test]
    fn test_input_held_until_output_streams() {
        let mut device = streaming_device(SimConfig::default());
        device
            .enqueue_buffer(PlaneKind::Input, &chunk(0, &[1], 0))
            .unwrap();
        assert!(device
            .dequeue_buffer(PlaneKind::Input, Duration::ZERO)
            .unwrap()
            .is_none());
        device.complete_input();
        let buffer = device
            .dequeue_buffer(PlaneKind::Input, Duration::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(buffer.index, 0);
        assert_eq!(device.stats().inputs_in_flight, 0);
    }

    #[test]
    fn test_host_surface_padding() {
        let mut device = SimDevice::new(SimConfig::default().pitch_align(32));
        let surface = device
            .allocate_surface(&SurfaceSpec {
                width: 10,
                height: 4,
                layout: SurfaceLayout::Pitch,
                color: ColorFormat::Yuv420,
            })
            .unwrap();
        let chroma = device.surface_plane_layout(surface, 1).unwrap();
        assert_eq!((chroma.width, chroma.height, chroma.pitch), (5, 2, 32));

        device.paint_surface(surface, 7);
        device.map_surface_plane(surface, 0).unwrap();
        let luma = device.mapped_plane(surface, 0).unwrap();
        assert_eq!(&luma[..10], &[7; 10]);
        assert_eq!(luma[10], SimDevice::PADDING_BYTE);
        device.unmap_surface_plane(surface, 0).unwrap();

        device.destroy_surface(surface).unwrap();
        assert_eq!(device.stats().live_host_surfaces(), 0);
        assert!(matches!(
            device.destroy_surface(surface),
            Err(DeviceError::UnknownSurface(_))
        ));
    }

    #[test]
    fn test_drop_marks_closed() {
        let config = SimConfig::default();
        let stats = config.stats_handle();
        drop(SimDevice::new(config));
        assert!(stats.snapshot().closed);
    }
}
