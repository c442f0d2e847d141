//! Buffer plane bookkeeping shared by the bitstream and decoded-surface queues.

use std::time::Duration;

use crate::{
    DequeuedBuffer, DeviceControl, DeviceError, MemoryType, PlaneFormat, PlaneKind, QueueRequest,
};

/// One of the two device queues, with host-side ownership tracking of every
/// slot in its pool.
///
/// A slot is either free (owned by the host) or queued (owned by the device).
/// Enqueueing a queued slot is refused instead of silently overwriting a
/// buffer the device may still be reading.
#[derive(Debug)]
pub struct Plane {
    kind: PlaneKind,
    memory: MemoryType,
    format: Option<PlaneFormat>,
    queued: Vec<bool>,
    streaming: bool,
}

impl Plane {
    #[must_use]
    pub fn new(kind: PlaneKind, memory: MemoryType) -> Self {
        Self {
            kind,
            memory,
            format: None,
            queued: Vec::new(),
            streaming: false,
        }
    }

    #[must_use]
    pub fn kind(&self) -> PlaneKind {
        self.kind
    }

    #[must_use]
    pub fn memory(&self) -> MemoryType {
        self.memory
    }

    #[must_use]
    pub fn format(&self) -> Option<&PlaneFormat> {
        self.format.as_ref()
    }

    /// Number of buffers in the pool (0 before setup).
    #[must_use]
    pub fn pool_size(&self) -> u32 {
        self.queued.len() as u32
    }

    /// Number of buffers currently owned by the device.
    #[must_use]
    pub fn queued_count(&self) -> u32 {
        self.queued.iter().filter(|q| **q).count() as u32
    }

    #[must_use]
    pub fn is_queued(&self, index: u32) -> bool {
        self.queued.get(index as usize).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Every slot of a non-empty pool is owned by the device.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        !self.queued.is_empty() && self.queued.iter().all(|q| *q)
    }

    pub fn set_format<D: DeviceControl>(
        &mut self,
        device: &mut D,
        format: PlaneFormat,
    ) -> Result<(), DeviceError> {
        if !self.queued.is_empty() {
            return Err(DeviceError::invalid_state(format!(
                "{:?} plane format is fixed once buffers are requested",
                self.kind
            )));
        }
        device.set_plane_format(self.kind, &format)?;
        self.format = Some(format);
        Ok(())
    }

    /// Request `count` buffers; the pool takes whatever size the device grants.
    pub fn setup_pool<D: DeviceControl>(
        &mut self,
        device: &mut D,
        count: u32,
    ) -> Result<u32, DeviceError> {
        if self.format.is_none() {
            return Err(DeviceError::invalid_state(format!(
                "{:?} plane format must be set before requesting buffers",
                self.kind
            )));
        }
        if !self.queued.is_empty() {
            return Err(DeviceError::invalid_state(format!(
                "{:?} plane already has {} buffers",
                self.kind,
                self.queued.len()
            )));
        }
        let granted = device.setup_buffer_pool(self.kind, self.memory, count)?;
        if granted == 0 {
            return Err(DeviceError::rejected(format!(
                "device granted no buffers for {:?} plane",
                self.kind
            )));
        }
        self.queued = vec![false; granted as usize];
        Ok(granted)
    }

    /// Stop streaming if needed and release the pool. The format stays set
    /// but may be changed again afterwards.
    pub fn release_pool<D: DeviceControl>(&mut self, device: &mut D) -> Result<(), DeviceError> {
        if self.streaming {
            self.set_stream_status(device, false)?;
        }
        if !self.queued.is_empty() {
            device.release_buffer_pool(self.kind)?;
            self.queued.clear();
        }
        Ok(())
    }

    /// Turning streaming off hands every queued slot back to the host.
    pub fn set_stream_status<D: DeviceControl>(
        &mut self,
        device: &mut D,
        on: bool,
    ) -> Result<(), DeviceError> {
        device.set_stream_status(self.kind, on)?;
        self.streaming = on;
        if !on {
            self.queued.iter_mut().for_each(|q| *q = false);
        }
        Ok(())
    }

    pub fn enqueue<D: DeviceControl>(
        &mut self,
        device: &mut D,
        request: &QueueRequest<'_>,
    ) -> Result<(), DeviceError> {
        let index = request.index;
        match self.queued.get(index as usize) {
            None => {
                return Err(DeviceError::invalid_state(format!(
                    "{:?} plane has no buffer {} (pool of {})",
                    self.kind,
                    index,
                    self.queued.len()
                )))
            }
            Some(true) => return Err(DeviceError::SlotInFlight { index }),
            Some(false) => {}
        }
        device.enqueue_buffer(self.kind, request)?;
        self.queued[index as usize] = true;
        Ok(())
    }

    /// `Ok(None)` means no buffer became ready within `timeout`.
    pub fn dequeue<D: DeviceControl>(
        &mut self,
        device: &mut D,
        timeout: Duration,
    ) -> Result<Option<DequeuedBuffer>, DeviceError> {
        let buffer = device.dequeue_buffer(self.kind, timeout)?;
        if let Some(buf) = &buffer {
            match self.queued.get_mut(buf.index as usize) {
                Some(slot) => *slot = false,
                None => {
                    return Err(DeviceError::invalid_state(format!(
                        "device returned unknown {:?} buffer {}",
                        self.kind, buf.index
                    )))
                }
            }
        }
        Ok(buffer)
    }
}
