//! Driver buffer pool.
//!
//! The pool requests memory-mapped buffers from the driver, maps every plane
//! into the process and exports each buffer once as a DMA-BUF descriptor.
//! Buffers are created together and destroyed together; the pool is the only
//! owner of the mappings and descriptors.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crate::traits::{CameraDevice, CameraError, CaptureMode, PlaneMapping, Result};

/// One mapped plane of a buffer. Dropping it unmaps the plane.
#[derive(Debug)]
pub struct PlaneRegion<M> {
    mapping: M,
}

impl<M: PlaneMapping> PlaneRegion<M> {
    /// The mapped bytes of the plane.
    pub fn as_slice(&self) -> &[u8] {
        self.mapping.as_slice()
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Whether the plane has no mapped bytes.
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

/// A fully mapped and exported driver buffer.
#[derive(Debug)]
pub struct Buffer<M> {
    index: u32,
    planes: Vec<PlaneRegion<M>>,
    descriptor: OwnedFd,
}

impl<M: PlaneMapping> Buffer<M> {
    /// Driver buffer index.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Mapped planes in driver order.
    pub fn planes(&self) -> &[PlaneRegion<M>] {
        &self.planes
    }

    /// The exported DMA-BUF descriptor.
    pub fn descriptor(&self) -> BorrowedFd<'_> {
        self.descriptor.as_fd()
    }
}

/// Fixed-size set of driver buffers for one capture session.
#[derive(Debug)]
pub struct BufferPool<M> {
    mode: CaptureMode,
    plane_count: usize,
    granted: u32,
    allocated: bool,
    buffers: Vec<Buffer<M>>,
}

impl<M: PlaneMapping> BufferPool<M> {
    /// Create an empty pool for buffers with `plane_count` planes each.
    pub fn new(mode: CaptureMode, plane_count: usize) -> Self {
        let plane_count = match mode {
            CaptureMode::SinglePlane => 1,
            CaptureMode::MultiPlane => plane_count.max(1),
        };
        Self {
            mode,
            plane_count,
            granted: 0,
            allocated: false,
            buffers: Vec::new(),
        }
    }

    /// Request `requested` buffers; the granted count becomes the pool size.
    pub fn allocate<D>(&mut self, device: &mut D, requested: u32) -> Result<u32>
    where
        D: CameraDevice<Mapping = M>,
    {
        if self.allocated {
            self.teardown(device);
        }

        let granted = device
            .request_buffers(self.mode, requested)
            .map_err(|err| CameraError::BufferRequestFailed(Some(err)))?;
        if granted == 0 {
            return Err(CameraError::BufferRequestFailed(None));
        }
        self.allocated = true;
        self.granted = granted;

        if granted < requested {
            log::warn!("Requested {requested} buffers, driver granted {granted}");
        } else {
            log::info!("Allocated {granted} buffers");
        }
        Ok(granted)
    }

    /// Map and export every granted buffer that is not mapped yet.
    ///
    /// On failure the pool keeps the buffers that were fully mapped and
    /// exported; planes already mapped for the failing buffer are released
    /// before returning.
    pub fn map_and_export<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: CameraDevice<Mapping = M>,
    {
        let start = self.buffers.len();
        for index in (0..self.granted).skip(start) {
            let buffer = self.map_buffer(device, index)?;
            log::debug!(
                "Buffer {index}: {} plane(s), {} bytes, dmabuf fd {}",
                buffer.planes.len(),
                buffer.planes.iter().map(PlaneRegion::len).sum::<usize>(),
                buffer.descriptor.as_raw_fd()
            );
            self.buffers.push(buffer);
        }
        Ok(())
    }

    fn map_buffer<D>(&self, device: &mut D, index: u32) -> Result<Buffer<M>>
    where
        D: CameraDevice<Mapping = M>,
    {
        let layouts = device
            .query_buffer(self.mode, index, self.plane_count)
            .map_err(|source| CameraError::MappingFailed {
                index,
                plane: 0,
                source,
            })?;
        if layouts.len() < self.plane_count {
            return Err(CameraError::MappingFailed {
                index,
                plane: layouts.len(),
                source: io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "driver reported {} plane(s), expected {}",
                        layouts.len(),
                        self.plane_count
                    ),
                ),
            });
        }

        let mut planes = Vec::with_capacity(self.plane_count);
        for (plane, layout) in layouts.iter().take(self.plane_count).enumerate() {
            let mapping = device
                .map_plane(layout)
                .map_err(|source| CameraError::MappingFailed {
                    index,
                    plane,
                    source,
                })?;
            planes.push(PlaneRegion { mapping });
        }

        let descriptor = device
            .export_buffer(self.mode, index)
            .map_err(|source| CameraError::ExportFailed { index, source })?;

        Ok(Buffer {
            index,
            planes,
            descriptor,
        })
    }

    /// Hand every mapped buffer to the driver.
    pub fn enqueue_all<D>(&self, device: &mut D) -> Result<()>
    where
        D: CameraDevice<Mapping = M>,
    {
        for buffer in &self.buffers {
            device
                .queue_buffer(self.mode, buffer.index, self.plane_count)
                .map_err(|source| CameraError::EnqueueFailed {
                    index: buffer.index,
                    source,
                })?;
        }
        log::debug!("Queued {} buffers", self.buffers.len());
        Ok(())
    }

    /// Return one consumed buffer to the driver.
    pub fn requeue<D>(&self, device: &mut D, index: u32) -> io::Result<()>
    where
        D: CameraDevice<Mapping = M>,
    {
        device.queue_buffer(self.mode, index, self.plane_count)
    }

    /// Unmap every plane, close every descriptor and release the driver
    /// allocation.
    ///
    /// Calling it again is a no-op. Errors are logged, never returned.
    pub fn teardown<D>(&mut self, device: &mut D)
    where
        D: CameraDevice<Mapping = M>,
    {
        let released = self.buffers.len();
        self.buffers.clear();

        if self.allocated {
            if let Err(err) = device.request_buffers(self.mode, 0) {
                log::warn!("Failed to release driver buffers: {err}");
            }
            self.allocated = false;
            log::debug!("Released {released} of {} buffers", self.granted);
        }
        self.granted = 0;
    }

    /// Number of buffers granted by the driver.
    pub const fn len(&self) -> u32 {
        self.granted
    }

    /// Whether the pool holds no granted buffers.
    pub const fn is_empty(&self) -> bool {
        self.granted == 0
    }

    /// Number of fully mapped and exported buffers.
    pub fn mapped_count(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer with driver index `index`, `None` when out of range or unmapped.
    pub fn buffer(&self, index: u32) -> Option<&Buffer<M>> {
        if index >= self.granted {
            return None;
        }
        usize::try_from(index)
            .ok()
            .and_then(|slot| self.buffers.get(slot))
    }

    /// Queue this pool's buffers belong to.
    pub const fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Planes per buffer.
    pub const fn plane_count(&self) -> usize {
        self.plane_count
    }
}
