//! V4L2 device implementation using the v4l crate.
//!
//! The v4l crate's high-level streams copy or hide the driver buffers, so this
//! module talks to the driver through its raw ioctl layer instead. Every
//! request goes through the device's [`RetryPolicy`].

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::raw::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::slice;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{
    v4l2_buffer, v4l2_capability, v4l2_exportbuffer, v4l2_fmtdesc, v4l2_format, v4l2_pix_format,
    v4l2_pix_format_mplane, v4l2_plane, v4l2_requestbuffers,
};
use v4l::Device;

use crate::config::CaptureConfig;
use crate::retry::{is_interrupted, is_transient, retry_when, RetryPolicy};
use crate::traits::{
    CameraDevice, CameraError, CaptureMode, Dequeued, DeviceInfo, DriverFormat,
    FormatDescription, FormatRequest, FourCC, PlaneLayout, PlaneMapping, Readiness, Result,
    MAX_PLANES,
};

/// `V4L2_CAP_DEVICE_CAPS`: `device_caps` describes the opened node.
const CAP_DEVICE_CAPS: u32 = 0x8000_0000;

/// Issue one ioctl on the device, retried per the device's policy.
///
/// Transient errors are retried unless a narrower predicate is given.
macro_rules! xioctl {
    ($dev:expr, $request:ident, $arg:expr) => {
        xioctl!($dev, $request, $arg, is_transient)
    };
    ($dev:expr, $request:ident, $arg:expr, $retryable:expr) => {{
        let fd = $dev.raw_fd();
        let argp: *mut _ = $arg;
        let argp = argp.cast::<c_void>();
        // SAFETY: `argp` points to a live, correctly typed argument for `$request`.
        retry_when($dev.retry, $retryable, || unsafe {
            v4l2::ioctl(fd, v4l2::vidioc::$request, argp)
        })
    }};
}

const fn buf_type(mode: CaptureMode) -> u32 {
    match mode {
        CaptureMode::SinglePlane => Type::VideoCapture as u32,
        CaptureMode::MultiPlane => Type::VideoCaptureMplane as u32,
    }
}

fn c_string(bytes: &[u8]) -> String {
    CStr::from_bytes_until_nul(bytes).map_or_else(
        |_| String::from_utf8_lossy(bytes).into_owned(),
        |s| s.to_string_lossy().into_owned(),
    )
}

fn plane_count_u32(plane_count: usize) -> u32 {
    u32::try_from(plane_count.min(MAX_PLANES)).unwrap_or(1)
}

/// A driver buffer plane mapped into the process. Unmapped on drop.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain shared memory owned by this value alone.
unsafe impl Send for MmapRegion {}

impl PlaneMapping for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` maps `len` readable bytes for as long as `self` lives.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: the region was returned by mmap with this length and is unmapped once.
        if let Err(err) = unsafe { v4l2::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } {
            log::error!("munmap failed: {err}");
        }
    }
}

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    path: PathBuf,
    retry: RetryPolicy,
}

impl V4L2Device {
    /// Open the device named by `config`.
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        Self::with_path(&config.device, config.retry)
    }

    /// Open a device node (e.g., `/dev/video0`).
    pub fn with_path<P: AsRef<Path>>(path: P, retry: RetryPolicy) -> Result<Self> {
        let path = path.as_ref();
        let device = Device::with_path(path).map_err(|source| CameraError::DeviceOpenFailed {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("Opened {} (fd {})", path.display(), device.handle().fd());

        Ok(Self {
            device,
            path: path.to_path_buf(),
            retry,
        })
    }

    /// Device node path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn raw_fd(&self) -> c_int {
        self.device.handle().fd()
    }

    fn driver_format(fmt: &v4l2_format, mode: CaptureMode) -> DriverFormat {
        match mode {
            CaptureMode::SinglePlane => {
                // SAFETY: the driver fills `pix` for single-plane buffer types.
                let pix = unsafe { fmt.fmt.pix };
                DriverFormat {
                    width: pix.width,
                    height: pix.height,
                    fourcc: FourCC::from_u32(pix.pixelformat),
                    colorspace: pix.colorspace,
                    plane_sizes: vec![pix.sizeimage],
                }
            }
            CaptureMode::MultiPlane => {
                // SAFETY: the driver fills `pix_mp` for multi-plane buffer types.
                let pix_mp = unsafe { fmt.fmt.pix_mp };
                let planes = usize::from(pix_mp.num_planes).min(MAX_PLANES);
                let plane_fmt = pix_mp.plane_fmt;
                DriverFormat {
                    width: pix_mp.width,
                    height: pix_mp.height,
                    fourcc: FourCC::from_u32(pix_mp.pixelformat),
                    colorspace: pix_mp.colorspace,
                    plane_sizes: plane_fmt.iter().take(planes).map(|p| p.sizeimage).collect(),
                }
            }
        }
    }
}

impl CameraDevice for V4L2Device {
    type Mapping = MmapRegion;

    fn query_capability(&self) -> io::Result<DeviceInfo> {
        // SAFETY: v4l2_capability is plain old data.
        let mut caps: v4l2_capability = unsafe { mem::zeroed() };
        xioctl!(self, VIDIOC_QUERYCAP, &mut caps)?;

        let bits = if caps.capabilities & CAP_DEVICE_CAPS == 0 {
            caps.capabilities
        } else {
            caps.device_caps
        };
        Ok(DeviceInfo {
            driver: c_string(&caps.driver),
            card: c_string(&caps.card),
            bus_info: c_string(&caps.bus_info),
            capabilities: Flags::from_bits_truncate(bits),
        })
    }

    fn format(&self, mode: CaptureMode) -> io::Result<DriverFormat> {
        // SAFETY: v4l2_format is plain old data.
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = buf_type(mode);
        xioctl!(self, VIDIOC_G_FMT, &mut fmt)?;
        Ok(Self::driver_format(&fmt, mode))
    }

    fn set_format(
        &mut self,
        mode: CaptureMode,
        request: &FormatRequest,
    ) -> io::Result<DriverFormat> {
        // SAFETY: v4l2_format is plain old data.
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = buf_type(mode);
        match mode {
            CaptureMode::SinglePlane => {
                // SAFETY: plain old data.
                let mut pix: v4l2_pix_format = unsafe { mem::zeroed() };
                pix.width = request.width;
                pix.height = request.height;
                pix.pixelformat = request.fourcc.to_u32();
                fmt.fmt.pix = pix;
            }
            CaptureMode::MultiPlane => {
                // SAFETY: plain old data.
                let mut pix_mp: v4l2_pix_format_mplane = unsafe { mem::zeroed() };
                pix_mp.width = request.width;
                pix_mp.height = request.height;
                pix_mp.pixelformat = request.fourcc.to_u32();
                fmt.fmt.pix_mp = pix_mp;
            }
        }
        xioctl!(self, VIDIOC_S_FMT, &mut fmt)?;
        Ok(Self::driver_format(&fmt, mode))
    }

    fn enum_format(&self, mode: CaptureMode, index: u32) -> io::Result<Option<FormatDescription>> {
        // SAFETY: v4l2_fmtdesc is plain old data.
        let mut desc: v4l2_fmtdesc = unsafe { mem::zeroed() };
        desc.index = index;
        desc.type_ = buf_type(mode);
        match xioctl!(self, VIDIOC_ENUM_FMT, &mut desc) {
            Ok(()) => Ok(Some(FormatDescription {
                fourcc: FourCC::from_u32(desc.pixelformat),
                description: c_string(&desc.description),
            })),
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn request_buffers(&mut self, mode: CaptureMode, count: u32) -> io::Result<u32> {
        // SAFETY: v4l2_requestbuffers is plain old data.
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = buf_type(mode);
        req.memory = Memory::Mmap as u32;
        xioctl!(self, VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(
        &mut self,
        mode: CaptureMode,
        index: u32,
        plane_count: usize,
    ) -> io::Result<Vec<PlaneLayout>> {
        // SAFETY: plain old data.
        let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        // SAFETY: plain old data.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = buf_type(mode);
        buf.memory = Memory::Mmap as u32;
        if mode == CaptureMode::MultiPlane {
            buf.m.planes = planes.as_mut_ptr();
            buf.length = plane_count_u32(plane_count);
        }
        xioctl!(self, VIDIOC_QUERYBUF, &mut buf)?;

        let layouts = match mode {
            CaptureMode::SinglePlane => vec![PlaneLayout {
                // SAFETY: `offset` is the member filled for mmap single-plane buffers.
                offset: unsafe { buf.m.offset },
                length: buf.length,
            }],
            CaptureMode::MultiPlane => {
                let reported = usize::try_from(buf.length).unwrap_or(MAX_PLANES);
                planes
                    .iter()
                    .take(reported.min(plane_count))
                    .map(|plane| PlaneLayout {
                        // SAFETY: `mem_offset` is the member filled for mmap planes.
                        offset: unsafe { plane.m.mem_offset },
                        length: plane.length,
                    })
                    .collect()
            }
        };
        Ok(layouts)
    }

    fn map_plane(&mut self, layout: &PlaneLayout) -> io::Result<MmapRegion> {
        let len = usize::try_from(layout.length)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let offset = libc::off_t::try_from(layout.offset)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        // SAFETY: maps a driver-provided region; failures come back as errors.
        let addr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.raw_fd(),
                offset,
            )
        }?;
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(MmapRegion { ptr, len })
    }

    fn export_buffer(&mut self, mode: CaptureMode, index: u32) -> io::Result<OwnedFd> {
        // SAFETY: v4l2_exportbuffer is plain old data.
        let mut exp: v4l2_exportbuffer = unsafe { mem::zeroed() };
        exp.type_ = buf_type(mode);
        exp.index = index;
        exp.flags = u32::try_from(libc::O_CLOEXEC).unwrap_or_default();
        xioctl!(self, VIDIOC_EXPBUF, &mut exp)?;

        if exp.fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "driver returned an invalid descriptor",
            ));
        }
        // SAFETY: EXPBUF hands us a new descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    fn queue_buffer(&mut self, mode: CaptureMode, index: u32, plane_count: usize) -> io::Result<()> {
        // SAFETY: plain old data.
        let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        // SAFETY: plain old data.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = buf_type(mode);
        buf.memory = Memory::Mmap as u32;
        if mode == CaptureMode::MultiPlane {
            buf.m.planes = planes.as_mut_ptr();
            buf.length = plane_count_u32(plane_count);
        }
        xioctl!(self, VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self, mode: CaptureMode, plane_count: usize) -> io::Result<Dequeued> {
        // SAFETY: plain old data.
        let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        // SAFETY: plain old data.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = buf_type(mode);
        buf.memory = Memory::Mmap as u32;
        if mode == CaptureMode::MultiPlane {
            buf.m.planes = planes.as_mut_ptr();
            buf.length = plane_count_u32(plane_count);
        }
        // EAGAIN goes back to the loop as a spurious wake-up.
        xioctl!(self, VIDIOC_DQBUF, &mut buf, is_interrupted)?;

        let mut bytes_used = [0; MAX_PLANES];
        match mode {
            CaptureMode::SinglePlane => {
                if let Some(used) = bytes_used.first_mut() {
                    *used = buf.bytesused;
                }
            }
            CaptureMode::MultiPlane => {
                for (used, plane) in bytes_used.iter_mut().zip(&planes).take(plane_count) {
                    *used = plane.bytesused;
                }
            }
        }

        let secs = u64::try_from(buf.timestamp.tv_sec).unwrap_or_default();
        let micros = u64::try_from(buf.timestamp.tv_usec).unwrap_or_default();
        Ok(Dequeued {
            index: buf.index,
            sequence: buf.sequence,
            timestamp: Duration::from_secs(secs) + Duration::from_micros(micros),
            bytes_used,
        })
    }

    fn stream_on(&mut self, mode: CaptureMode) -> io::Result<()> {
        let mut ty = buf_type(mode);
        xioctl!(self, VIDIOC_STREAMON, &mut ty)
    }

    fn stream_off(&mut self, mode: CaptureMode) -> io::Result<()> {
        let mut ty = buf_type(mode);
        xioctl!(self, VIDIOC_STREAMOFF, &mut ty)
    }

    fn wait_ready(&self, timeout: Option<Duration>) -> io::Result<Readiness> {
        let timeout_ms = timeout.map_or(-1, |timeout| {
            c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX)
        });
        let mut pfd = libc::pollfd {
            fd: self.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        match ret {
            0 => Ok(Readiness::TimedOut),
            r if r > 0 => Ok(Readiness::Ready),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(Readiness::Interrupted)
                } else {
                    Err(err)
                }
            }
        }
    }
}
