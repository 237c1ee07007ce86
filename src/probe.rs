//! Capability probing and capture mode selection.

use v4l::capability::Flags;

use crate::traits::{CameraDevice, CameraError, CaptureMode, Result};

/// What the opened device can do, and the capture mode chosen from it.
#[derive(Debug, Clone)]
pub struct DeviceCapability {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// `V4L2_CAP_VIDEO_CAPTURE`.
    pub supports_single_plane_capture: bool,
    /// `V4L2_CAP_VIDEO_CAPTURE_MPLANE`.
    pub supports_multi_plane_capture: bool,
    /// `V4L2_CAP_STREAMING`.
    pub supports_streaming_io: bool,
    /// `V4L2_CAP_READWRITE`.
    pub supports_readwrite_io: bool,
    /// Active capture mode for every later request.
    pub mode: CaptureMode,
}

/// Query the device and select the capture mode.
///
/// Multi-plane capture is preferred when both modes are advertised. Devices
/// without streaming I/O are rejected: buffers are always memory-mapped.
pub fn probe<D: CameraDevice>(device: &D) -> Result<DeviceCapability> {
    let info = device
        .query_capability()
        .map_err(|err| CameraError::DeviceUnsupported(format!("VIDIOC_QUERYCAP failed: {err}")))?;

    log::info!(
        "Video device: driver={} card={} bus={} caps={:#010x}",
        info.driver,
        info.card,
        info.bus_info,
        info.capabilities.bits()
    );

    let caps = info.capabilities;
    let supports_single_plane_capture = caps.contains(Flags::VIDEO_CAPTURE);
    let supports_multi_plane_capture = caps.contains(Flags::VIDEO_CAPTURE_MPLANE);
    let supports_streaming_io = caps.contains(Flags::STREAMING);
    let supports_readwrite_io = caps.contains(Flags::READ_WRITE);

    let mode = if supports_multi_plane_capture {
        CaptureMode::MultiPlane
    } else if supports_single_plane_capture {
        CaptureMode::SinglePlane
    } else {
        return Err(CameraError::DeviceUnsupported(format!(
            "{} ({}) is not a video capture device",
            info.card, info.driver
        )));
    };

    if !supports_streaming_io {
        let method = if supports_readwrite_io {
            "read/write"
        } else {
            "no"
        };
        return Err(CameraError::DeviceUnsupported(format!(
            "{} ({}) offers {method} I/O but streaming is required",
            info.card, info.driver
        )));
    }

    log::info!("Selected {mode} capture with mmap streaming I/O");

    Ok(DeviceCapability {
        driver: info.driver,
        card: info.card,
        bus_info: info.bus_info,
        supports_single_plane_capture,
        supports_multi_plane_capture,
        supports_streaming_io,
        supports_readwrite_io,
        mode,
    })
}
