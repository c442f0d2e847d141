//! Bitstream submission into the input plane.

use std::time::Duration;

use crate::{
    BufferFlags, DecodeError, DeviceControl, DeviceError, MemoryType, Plane, PlaneKind,
    QueueRequest, Timestamp,
};

/// Round-robin submitter for the bitstream plane.
#[derive(Debug)]
pub struct InputQueue {
    plane: Plane,
    cursor: u32,
    capacity: u32,
}

impl InputQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            plane: Plane::new(PlaneKind::Input, MemoryType::UserPtr),
            cursor: 0,
            capacity: 0,
        }
    }

    #[must_use]
    pub fn plane(&self) -> &Plane {
        &self.plane
    }

    pub(crate) fn plane_mut(&mut self) -> &mut Plane {
        &mut self.plane
    }

    /// Slot the next submission will use.
    #[must_use]
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Bitstream buffers currently owned by the device.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.plane.queued_count()
    }

    /// Every input slot is owned by the device.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.plane.is_saturated()
    }

    pub(crate) fn set_capacity(&mut self, capacity: u32) {
        self.capacity = capacity;
    }

    /// Queue one chunk at the cursor slot. `None` is the end-of-stream
    /// marker: an empty buffer without a timestamp.
    ///
    /// If the cursor slot is still owned by the device, completed buffers
    /// are reclaimed first; if that does not free the slot the submission
    /// fails with [`DeviceError::SlotInFlight`] and the cursor stays put.
    pub fn submit<D: DeviceControl>(
        &mut self,
        device: &mut D,
        data: Option<&[u8]>,
        pts_us: i64,
    ) -> Result<(), DecodeError> {
        if let Some(chunk) = data {
            if chunk.len() > self.capacity as usize {
                return Err(DecodeError::ChunkTooLarge {
                    size: chunk.len(),
                    capacity: self.capacity,
                });
            }
        }

        let index = self.cursor;
        if self.plane.is_queued(index) {
            self.reclaim(device)?;
            if self.plane.is_queued(index) {
                tracing::warn!(
                    "Input slot {} still in flight ({} of {} queued), refusing to overwrite",
                    index,
                    self.plane.queued_count(),
                    self.plane.pool_size()
                );
                return Err(DecodeError::Enqueue(DeviceError::SlotInFlight { index }));
            }
        }

        let request = match data {
            Some(chunk) => QueueRequest {
                index,
                payload: Some(chunk),
                timestamp: Timestamp::from_micros(pts_us),
                flags: BufferFlags::TIMESTAMP_COPY,
            },
            None => QueueRequest::empty(index),
        };
        self.plane
            .enqueue(device, &request)
            .map_err(DecodeError::Enqueue)?;

        self.cursor = (self.cursor + 1) % self.plane.pool_size();
        Ok(())
    }

    /// One non-blocking pass over completed bitstream buffers. Returns how
    /// many were reclaimed.
    pub fn reclaim<D: DeviceControl>(&mut self, device: &mut D) -> Result<u32, DecodeError> {
        let mut reclaimed = 0;
        while self.plane.queued_count() > 0 {
            match self.plane.dequeue(device, Duration::ZERO) {
                Ok(Some(_)) => reclaimed += 1,
                Ok(None) => break,
                Err(e) => return Err(DecodeError::InputReclaim(e)),
            }
        }
        Ok(reclaimed)
    }

    /// Wait for the device to return every bitstream buffer, giving up after
    /// `attempts` consecutive waits that time out. Returns the number of
    /// buffers still in flight.
    pub fn reclaim_blocking<D: DeviceControl>(
        &mut self,
        device: &mut D,
        timeout: Duration,
        attempts: u32,
    ) -> Result<u32, DecodeError> {
        let mut idle = 0;
        while self.plane.queued_count() > 0 && idle < attempts {
            match self.plane.dequeue(device, timeout) {
                Ok(Some(_)) => idle = 0,
                Ok(None) => idle += 1,
                Err(e) => return Err(DecodeError::InputReclaim(e)),
            }
        }
        Ok(self.plane.queued_count())
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}
