//! Copy of hardware surfaces into linear host memory.

use crate::{DecodeError, DeviceControl, DeviceError, PlaneLayout, SurfaceHandle};

/// A plane mapped for CPU access. Dropping it without [`unmap`](Self::unmap)
/// still unmaps, but the error is only logged.
struct MappedPlane<'a, D: DeviceControl> {
    device: &'a mut D,
    surface: SurfaceHandle,
    plane: u32,
    mapped: bool,
}

impl<'a, D: DeviceControl> MappedPlane<'a, D> {
    fn map(device: &'a mut D, surface: SurfaceHandle, plane: u32) -> Result<Self, DeviceError> {
        device.map_surface_plane(surface, plane)?;
        Ok(Self {
            device,
            surface,
            plane,
            mapped: true,
        })
    }

    fn sync_for_cpu(&mut self) -> Result<(), DeviceError> {
        self.device.sync_for_cpu(self.surface, self.plane)
    }

    fn bytes(&self) -> Result<&[u8], DeviceError> {
        self.device.mapped_plane(self.surface, self.plane)
    }

    fn unmap(mut self) -> Result<(), DeviceError> {
        self.mapped = false;
        self.device.unmap_surface_plane(self.surface, self.plane)
    }
}

impl<D: DeviceControl> Drop for MappedPlane<'_, D> {
    fn drop(&mut self) {
        if self.mapped {
            if let Err(e) = self.device.unmap_surface_plane(self.surface, self.plane) {
                tracing::warn!("Failed to unmap surface plane {}: {}", self.plane, e);
            }
        }
    }
}

/// Append the pixel rows of one plane to `out`, skipping the pitch padding
/// at the end of every row.
pub fn copy_plane_rows(
    src: &[u8],
    layout: &PlaneLayout,
    out: &mut Vec<u8>,
) -> Result<(), DeviceError> {
    let row_size = layout.row_size();
    let pitch = layout.pitch as usize;
    if pitch < row_size {
        return Err(DeviceError::invalid_state(format!(
            "pitch {} is smaller than row size {}",
            pitch, row_size
        )));
    }
    for row in 0..layout.height as usize {
        let start = row * pitch;
        let line = src.get(start..start + row_size).ok_or_else(|| {
            DeviceError::invalid_state(format!(
                "mapped plane of {} bytes ends inside row {}",
                src.len(),
                row
            ))
        })?;
        out.extend_from_slice(line);
    }
    Ok(())
}

/// Read the first `plane_count` planes of `surface` into one packed buffer,
/// planes back to back in index order.
///
/// On error the partially filled buffer is dropped: callers never see a
/// frame with undefined planes.
pub fn readback<D: DeviceControl>(
    device: &mut D,
    surface: SurfaceHandle,
    plane_count: u32,
) -> Result<Vec<u8>, DecodeError> {
    let mut layouts = Vec::with_capacity(plane_count as usize);
    for plane in 0..plane_count {
        let layout = device
            .surface_plane_layout(surface, plane)
            .map_err(|source| DecodeError::SurfaceQuery { plane, source })?;
        layouts.push(layout);
    }

    let total = layouts.iter().map(PlaneLayout::packed_size).sum();
    let mut out = Vec::with_capacity(total);

    for (plane, layout) in (0..plane_count).zip(&layouts) {
        let mut mapped = MappedPlane::map(device, surface, plane)
            .map_err(|source| DecodeError::Map { plane, source })?;
        mapped
            .sync_for_cpu()
            .map_err(|source| DecodeError::Map { plane, source })?;
        let src = mapped
            .bytes()
            .map_err(|source| DecodeError::Map { plane, source })?;
        copy_plane_rows(src, layout, &mut out)
            .map_err(|source| DecodeError::Map { plane, source })?;
        mapped
            .unmap()
            .map_err(|source| DecodeError::Unmap { plane, source })?;
    }

    debug_assert_eq!(out.len(), total);
    Ok(out)
}


#[cfg(all(test, feature = "sim"))]
mod sim_tests {
    use super::*;
    use crate::sim::{SimConfig, SimDevice, SimFault};
    use crate::{ColorFormat, SurfaceLayout, SurfaceSpec};

    fn transfer_surface(device: &mut SimDevice, width: u32, height: u32) -> SurfaceHandle {
        device
            .allocate_surface(&SurfaceSpec {
                width,
                height,
                layout: SurfaceLayout::Pitch,
                color: ColorFormat::Yuv420,
            })
            .unwrap()
    }

    #[test]
    fn test_readback_excludes_padding() {
        let mut device = SimDevice::new(SimConfig::default().pitch_align(64));
        let surface = transfer_surface(&mut device, 40, 30);
        device.paint_surface(surface, 0x10);

        let luma = device.surface_plane_layout(surface, 0).unwrap();
        assert!(luma.pitch as usize > luma.row_size());

        let data = readback(&mut device, surface, 3).unwrap();
        assert_eq!(data.len(), 40 * 30 * 3 / 2);
        assert!(!data.contains(&SimDevice::PADDING_BYTE));
        assert!(data[..40 * 30].iter().all(|b| *b == 0x10));
        assert_eq!(device.mapped_count(), 0);
    }

    #[test]
    fn test_readback_map_failure() {
        let mut device =
            SimDevice::new(SimConfig::default().fault(SimFault::MapSurface));
        let surface = transfer_surface(&mut device, 16, 16);
        let err = readback(&mut device, surface, 3).unwrap_err();
        assert!(matches!(err, DecodeError::Map { plane: 0, .. }));
    }

    #[test]
    fn test_readback_unmap_failure() {
        let mut device =
            SimDevice::new(SimConfig::default().fault(SimFault::UnmapSurface));
        let surface = transfer_surface(&mut device, 16, 16);
        let err = readback(&mut device, surface, 3).unwrap_err();
        assert!(matches!(err, DecodeError::Unmap { plane: 0, .. }));
    }
}
