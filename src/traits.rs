//! Core traits and types for the V4L2 capture abstraction.
//!
//! [`CameraDevice`] is the seam between the capture engine and the kernel
//! driver. It exposes the driver operations one-to-one and keeps them free of
//! policy, so the probe, format, pool and loop logic can run unchanged against
//! real hardware or a scripted mock.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;

use v4l::capability::Flags;

/// Maximum number of planes a single V4L2 buffer can carry.
pub const MAX_PLANES: usize = 8;

/// Pixel format code (e.g., YUYV, NV12, RGB3).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Decode the little-endian integer form used by the driver.
    #[must_use]
    pub const fn from_u32(code: u32) -> Self {
        Self(code.to_le_bytes())
    }

    /// Encode into the little-endian integer form used by the driver.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// NV12 pixel format (4:2:0, Y plane followed by interleaved CbCr).
    pub const NV12: Self = Self::new(b"NV12");
    /// NV12 with the luma and chroma planes in separate buffers.
    pub const NM12: Self = Self::new(b"NM12");
    /// YUV 4:2:0 fully planar (I420).
    pub const YU12: Self = Self::new(b"YU12");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            if byte.is_ascii_graphic() || byte == b' ' {
                write!(f, "{}", char::from(byte))?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Buffer queue the capture engine operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    /// `V4L2_BUF_TYPE_VIDEO_CAPTURE`: one plane per buffer.
    SinglePlane,
    /// `V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE`: up to [`MAX_PLANES`] planes per buffer.
    MultiPlane,
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SinglePlane => write!(f, "single-plane"),
            Self::MultiPlane => write!(f, "multi-plane"),
        }
    }
}

/// Identification and raw capability bits reported by `VIDIOC_QUERYCAP`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Capability bits of the opened node.
    pub capabilities: Flags,
}

/// Format exactly as the driver reports it, before translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverFormat {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format code.
    pub fourcc: FourCC,
    /// Raw `v4l2_colorspace` value.
    pub colorspace: u32,
    /// Image size of each plane, one entry per plane.
    pub plane_sizes: Vec<u32>,
}

/// Format submitted to `VIDIOC_S_FMT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    /// Requested width in pixels.
    pub width: u32,
    /// Requested height in pixels.
    pub height: u32,
    /// Requested pixel format.
    pub fourcc: FourCC,
}

/// One entry of the driver's format description table.
#[derive(Debug, Clone)]
pub struct FormatDescription {
    /// Pixel format code.
    pub fourcc: FourCC,
    /// Human-readable description from the driver.
    pub description: String,
}

/// Location of one plane inside the driver's mmap space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Offset to pass to `mmap`.
    pub offset: u32,
    /// Plane length in bytes.
    pub length: u32,
}

/// A filled buffer handed back by `VIDIOC_DQBUF`.
#[derive(Debug, Clone, Copy)]
pub struct Dequeued {
    /// Buffer index as reported by the driver (not yet bounds-checked).
    pub index: u32,
    /// Driver frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Bytes written into each plane; only the first `plane_count` entries are meaningful.
    pub bytes_used: [u32; MAX_PLANES],
}

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A filled buffer can be dequeued.
    Ready,
    /// The timeout elapsed without any event.
    TimedOut,
    /// The wait was interrupted by a signal.
    Interrupted,
}

/// Error type for camera operations.
#[derive(Debug)]
pub enum CameraError {
    /// Failed to open the device node.
    DeviceOpenFailed {
        /// Device path.
        path: String,
        /// Underlying error.
        source: io::Error,
    },
    /// The device cannot be used for memory-mapped streaming capture.
    DeviceUnsupported(String),
    /// The driver refused to read or apply a format.
    FormatRejected(io::Error),
    /// The driver's format table is empty.
    NoFormatsAvailable,
    /// `VIDIOC_REQBUFS` failed or granted zero buffers.
    BufferRequestFailed(Option<io::Error>),
    /// Querying or mapping a plane failed.
    MappingFailed {
        /// Buffer index.
        index: u32,
        /// Plane index within the buffer.
        plane: usize,
        /// Underlying error.
        source: io::Error,
    },
    /// Exporting a buffer as a DMA-BUF descriptor failed.
    ExportFailed {
        /// Buffer index.
        index: u32,
        /// Underlying error.
        source: io::Error,
    },
    /// Handing a buffer to the driver failed.
    EnqueueFailed {
        /// Buffer index.
        index: u32,
        /// Underlying error.
        source: io::Error,
    },
    /// Error while streaming (stream on/off, dequeue, readiness wait).
    StreamError(io::Error),
    /// The device produced no frame within the readiness timeout.
    CaptureTimeout(Duration),
    /// Re-initialisation during a reset failed.
    ResetFailed(Box<CameraError>),
    /// I/O error.
    Io(io::Error),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceOpenFailed { path, source } => {
                write!(f, "Failed to open device {path}: {source}")
            }
            Self::DeviceUnsupported(reason) => write!(f, "Device unsupported: {reason}"),
            Self::FormatRejected(err) => write!(f, "Format rejected: {err}"),
            Self::NoFormatsAvailable => write!(f, "Device reports no capture formats"),
            Self::BufferRequestFailed(Some(err)) => write!(f, "Buffer request failed: {err}"),
            Self::BufferRequestFailed(None) => write!(f, "Buffer request granted no buffers"),
            Self::MappingFailed {
                index,
                plane,
                source,
            } => write!(f, "Failed to map buffer {index} plane {plane}: {source}"),
            Self::ExportFailed { index, source } => {
                write!(f, "Failed to export buffer {index}: {source}")
            }
            Self::EnqueueFailed { index, source } => {
                write!(f, "Failed to queue buffer {index}: {source}")
            }
            Self::StreamError(err) => write!(f, "Stream error: {err}"),
            Self::CaptureTimeout(timeout) => {
                write!(f, "No frame received within {timeout:?}")
            }
            Self::ResetFailed(err) => write!(f, "Reset failed: {err}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for CameraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DeviceOpenFailed { source, .. }
            | Self::MappingFailed { source, .. }
            | Self::ExportFailed { source, .. }
            | Self::EnqueueFailed { source, .. } => Some(source),
            Self::FormatRejected(err) | Self::StreamError(err) | Self::Io(err) => Some(err),
            Self::BufferRequestFailed(err) => {
                err.as_ref().map(|err| err as &(dyn std::error::Error + 'static))
            }
            Self::ResetFailed(err) => Some(err.as_ref()),
            Self::DeviceUnsupported(_) | Self::NoFormatsAvailable | Self::CaptureTimeout(_) => {
                None
            }
        }
    }
}

impl From<io::Error> for CameraError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// A plane of a driver buffer mapped into the process.
///
/// Dropping the value releases the mapping.
pub trait PlaneMapping {
    /// The mapped bytes.
    fn as_slice(&self) -> &[u8];

    /// Mapped length in bytes.
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the mapping is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Abstraction over the driver operations of a capture device.
///
/// Every method maps to a single V4L2 request. Errors are returned as raw
/// `io::Error`s; the caller decides which domain error they become.
pub trait CameraDevice {
    /// Mapping type produced by [`CameraDevice::map_plane`].
    type Mapping: PlaneMapping;

    /// Query identification and capability bits.
    fn query_capability(&self) -> io::Result<DeviceInfo>;

    /// Read the active format of the given queue.
    fn format(&self, mode: CaptureMode) -> io::Result<DriverFormat>;

    /// Submit a format. Returns what the driver actually applied.
    fn set_format(&mut self, mode: CaptureMode, request: &FormatRequest)
        -> io::Result<DriverFormat>;

    /// Read entry `index` of the format table, `None` past the end.
    fn enum_format(&self, mode: CaptureMode, index: u32) -> io::Result<Option<FormatDescription>>;

    /// Request `count` mmap buffers. Returns the number granted; `0` releases them.
    fn request_buffers(&mut self, mode: CaptureMode, count: u32) -> io::Result<u32>;

    /// Query the plane layout of buffer `index`.
    fn query_buffer(
        &mut self,
        mode: CaptureMode,
        index: u32,
        plane_count: usize,
    ) -> io::Result<Vec<PlaneLayout>>;

    /// Map one plane into the process.
    fn map_plane(&mut self, layout: &PlaneLayout) -> io::Result<Self::Mapping>;

    /// Export buffer `index` as a DMA-BUF descriptor.
    fn export_buffer(&mut self, mode: CaptureMode, index: u32) -> io::Result<OwnedFd>;

    /// Hand buffer `index` to the driver.
    fn queue_buffer(&mut self, mode: CaptureMode, index: u32, plane_count: usize)
        -> io::Result<()>;

    /// Take the next filled buffer from the driver.
    fn dequeue_buffer(&mut self, mode: CaptureMode, plane_count: usize) -> io::Result<Dequeued>;

    /// Start streaming on the queue.
    fn stream_on(&mut self, mode: CaptureMode) -> io::Result<()>;

    /// Stop streaming on the queue; all buffers return to user ownership.
    fn stream_off(&mut self, mode: CaptureMode) -> io::Result<()>;

    /// Block until a buffer is ready, the timeout elapses or a signal arrives.
    ///
    /// `None` waits without a timeout.
    fn wait_ready(&self, timeout: Option<Duration>) -> io::Result<Readiness>;
}
