//! dmabuf-capture: zero-copy V4L2 capture with DMA-BUF export
//!
//! This library drives a V4L2 capture device in memory-mapped streaming mode,
//! exports every driver buffer once as a DMA-BUF descriptor and hands each
//! frame to a consumer without copying it. The engine is written against the
//! [`CameraDevice`] trait, enabling both production use with real hardware and
//! testing with mock devices.
//!
//! ```no_run
//! use dmabuf_capture::{CaptureConfig, Frame, V4L2Capture};
//!
//! let mut capture = V4L2Capture::v4l2(CaptureConfig::default().with_buffers(4));
//! let stats = capture.start(|frame: &Frame<'_>| {
//!     println!("frame {} ({} bytes)", frame.sequence(), frame.bytes_used());
//! })?;
//! println!("{stats}");
//! # Ok::<(), dmabuf_capture::CameraError>(())
//! ```

pub mod capture;
pub mod config;
pub mod device;
pub mod format;
pub mod pool;
pub mod probe;
pub mod recovery;
pub mod retry;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use capture::{CancelToken, CaptureLoop, Frame, FrameView, LoopStats, PlaneView};
pub use config::CaptureConfig;
pub use device::{MmapRegion, V4L2Device};
pub use format::{ColorSpace, FormatNegotiator, PixelEncoding, VideoFormat};
pub use pool::{Buffer, BufferPool, PlaneRegion};
pub use probe::{probe, DeviceCapability};
pub use recovery::{Capture, Consumer, Session, V4L2Capture};
pub use retry::RetryPolicy;
pub use traits::{CameraDevice, CameraError, CaptureMode, FourCC, PlaneMapping, Result};
