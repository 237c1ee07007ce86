//! Video format negotiation.
//!
//! Driver codes are translated into [`PixelEncoding`] and [`ColorSpace`] here.
//! Codes this crate does not know map to an explicit `Unspecified` value
//! instead of failing: the encoding is carried through untouched and the color
//! space is advisory metadata only.

use std::fmt;

use crate::traits::{
    CameraDevice, CameraError, CaptureMode, DriverFormat, FormatRequest, FourCC, Result,
    MAX_PLANES,
};

/// Pixel encoding of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelEncoding {
    /// Packed 24-bit RGB (`RGB3`).
    Rgb24,
    /// Packed 24-bit BGR (`BGR3`).
    Bgr24,
    /// Packed YUV 4:2:2 (`YUYV`).
    Yuyv,
    /// Semi-planar YUV 4:2:0 in one buffer (`NV12`).
    Nv12,
    /// Semi-planar YUV 4:2:0 with separate luma/chroma planes (`NM12`).
    Nv12Multi,
    /// Planar YUV 4:2:0 (`YU12`).
    Yuv420,
    /// Motion JPEG (`MJPG`).
    Mjpeg,
    /// A code this crate does not interpret.
    Unspecified(FourCC),
}

impl PixelEncoding {
    /// Translate a driver pixel format code.
    #[must_use]
    pub const fn from_fourcc(fourcc: FourCC) -> Self {
        match &fourcc.0 {
            b"RGB3" => Self::Rgb24,
            b"BGR3" => Self::Bgr24,
            b"YUYV" => Self::Yuyv,
            b"NV12" => Self::Nv12,
            b"NM12" => Self::Nv12Multi,
            b"YU12" => Self::Yuv420,
            b"MJPG" => Self::Mjpeg,
            _ => Self::Unspecified(fourcc),
        }
    }

    /// Driver pixel format code.
    #[must_use]
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::Rgb24 => FourCC::RGB3,
            Self::Bgr24 => FourCC::BGR3,
            Self::Yuyv => FourCC::YUYV,
            Self::Nv12 => FourCC::NV12,
            Self::Nv12Multi => FourCC::NM12,
            Self::Yuv420 => FourCC::YU12,
            Self::Mjpeg => FourCC::MJPG,
            Self::Unspecified(fourcc) => fourcc,
        }
    }

    /// Nominal plane sizes for a frame of the given dimensions.
    ///
    /// Drivers may pad lines, so negotiated sizes come from the driver, not
    /// from here.
    #[must_use]
    pub fn plane_sizes(self, width: u32, height: u32) -> Vec<u32> {
        let pixels = width.saturating_mul(height);
        match self {
            Self::Rgb24 | Self::Bgr24 => vec![pixels.saturating_mul(3)],
            Self::Yuyv | Self::Mjpeg | Self::Unspecified(_) => vec![pixels.saturating_mul(2)],
            Self::Nv12 | Self::Yuv420 => vec![pixels.saturating_add(pixels / 2)],
            Self::Nv12Multi => vec![pixels, pixels / 2],
        }
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified(fourcc) => write!(f, "unspecified ({fourcc})"),
            other => write!(f, "{}", other.fourcc()),
        }
    }
}

/// Color space of a frame (`enum v4l2_colorspace`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    /// Driver default for the format.
    Default,
    /// SMPTE 170M (SDTV).
    Smpte170m,
    /// SMPTE 240M.
    Smpte240m,
    /// Rec. 709 (HDTV).
    Rec709,
    /// Bt.878.
    Bt878,
    /// NTSC 1953.
    System470M,
    /// EBU Tech 3213 (PAL/SECAM).
    System470Bg,
    /// JPEG full range.
    Jpeg,
    /// sRGB.
    Srgb,
    /// opRGB.
    OpRgb,
    /// Rec. 2020 (UHDTV).
    Bt2020,
    /// Raw sensor data.
    Raw,
    /// DCI-P3.
    DciP3,
    /// A value this crate does not interpret.
    Unspecified(u32),
}

impl ColorSpace {
    /// Translate a driver color space code.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Default,
            1 => Self::Smpte170m,
            2 => Self::Smpte240m,
            3 => Self::Rec709,
            4 => Self::Bt878,
            5 => Self::System470M,
            6 => Self::System470Bg,
            7 => Self::Jpeg,
            8 => Self::Srgb,
            9 => Self::OpRgb,
            10 => Self::Bt2020,
            11 => Self::Raw,
            12 => Self::DciP3,
            other => Self::Unspecified(other),
        }
    }
}

impl fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Smpte170m => write!(f, "SMPTE170M"),
            Self::Smpte240m => write!(f, "SMPTE240M"),
            Self::Rec709 => write!(f, "REC709"),
            Self::Bt878 => write!(f, "BT878"),
            Self::System470M => write!(f, "470_SYSTEM_M"),
            Self::System470Bg => write!(f, "470_SYSTEM_BG"),
            Self::Jpeg => write!(f, "JPEG"),
            Self::Srgb => write!(f, "SRGB"),
            Self::OpRgb => write!(f, "OPRGB"),
            Self::Bt2020 => write!(f, "BT2020"),
            Self::Raw => write!(f, "RAW"),
            Self::DciP3 => write!(f, "DCI_P3"),
            Self::Unspecified(raw) => write!(f, "unspecified ({raw})"),
        }
    }
}

/// Negotiated video format.
///
/// `plane_sizes.len() == plane_count` holds for every value built by this
/// module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel encoding.
    pub pixel_encoding: PixelEncoding,
    /// Number of memory planes per buffer.
    pub plane_count: usize,
    /// Image size of each plane in bytes.
    pub plane_sizes: Vec<u32>,
    /// Color space.
    pub color_space: ColorSpace,
}

impl VideoFormat {
    /// Build a format request with nominal plane sizes.
    #[must_use]
    pub fn new(width: u32, height: u32, pixel_encoding: PixelEncoding) -> Self {
        let plane_sizes = pixel_encoding.plane_sizes(width, height);
        Self {
            width,
            height,
            pixel_encoding,
            plane_count: plane_sizes.len(),
            plane_sizes,
            color_space: ColorSpace::Default,
        }
    }

    /// Total image size over all planes.
    #[must_use]
    pub fn frame_size(&self) -> u64 {
        self.plane_sizes.iter().map(|&size| u64::from(size)).sum()
    }

    fn from_driver(raw: &DriverFormat, mode: CaptureMode) -> Self {
        let plane_count = match mode {
            CaptureMode::SinglePlane => 1,
            CaptureMode::MultiPlane => raw.plane_sizes.len().clamp(1, MAX_PLANES),
        };
        let mut plane_sizes: Vec<u32> = raw.plane_sizes.iter().copied().take(plane_count).collect();
        plane_sizes.resize(plane_count, 0);

        Self {
            width: raw.width,
            height: raw.height,
            pixel_encoding: PixelEncoding::from_fourcc(raw.fourcc),
            plane_count,
            plane_sizes,
            color_space: ColorSpace::from_raw(raw.colorspace),
        }
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} planes={} sizes={:?} colorspace={}",
            self.width,
            self.height,
            self.pixel_encoding,
            self.plane_count,
            self.plane_sizes,
            self.color_space
        )
    }
}

/// Reads and writes the active format of one capture queue.
pub struct FormatNegotiator<'a, D> {
    device: &'a mut D,
    mode: CaptureMode,
}

impl<'a, D: CameraDevice> FormatNegotiator<'a, D> {
    /// Negotiate on the queue selected by the capability probe.
    pub fn new(device: &'a mut D, mode: CaptureMode) -> Self {
        Self { device, mode }
    }

    /// Read the driver's active format.
    pub fn get_current_format(&self) -> Result<VideoFormat> {
        let raw = self
            .device
            .format(self.mode)
            .map_err(CameraError::FormatRejected)?;
        let format = VideoFormat::from_driver(&raw, self.mode);

        if let PixelEncoding::Unspecified(fourcc) = format.pixel_encoding {
            log::warn!("Unrecognised pixel format {fourcc}");
        }
        if let ColorSpace::Unspecified(raw) = format.color_space {
            log::info!("Unrecognised colorspace {raw}");
        }
        log::info!("Current format: {format}");

        Ok(format)
    }

    /// Submit `requested` and return the format the driver actually applied.
    ///
    /// Width, height and plane sizes may all differ from the request.
    pub fn set_format(&mut self, requested: &VideoFormat) -> Result<VideoFormat> {
        let request = FormatRequest {
            width: requested.width,
            height: requested.height,
            fourcc: requested.pixel_encoding.fourcc(),
        };
        let raw = self
            .device
            .set_format(self.mode, &request)
            .map_err(CameraError::FormatRejected)?;
        let actual = VideoFormat::from_driver(&raw, self.mode);

        if actual.width != requested.width
            || actual.height != requested.height
            || actual.pixel_encoding != requested.pixel_encoding
        {
            log::warn!(
                "Driver adjusted format: requested {}x{} {}, got {}x{} {}",
                requested.width,
                requested.height,
                requested.pixel_encoding,
                actual.width,
                actual.height,
                actual.pixel_encoding
            );
        }
        log::info!("Applied format: {actual}");

        Ok(actual)
    }

    /// Walk the driver's format table.
    pub fn enumerate_formats(&self) -> Result<Vec<FourCC>> {
        let mut formats = Vec::new();
        let mut index = 0;
        while let Some(desc) = self
            .device
            .enum_format(self.mode, index)
            .map_err(CameraError::FormatRejected)?
        {
            log::info!("Format [{}] {}", desc.fourcc, desc.description);
            formats.push(desc.fourcc);
            index += 1;
        }

        if formats.is_empty() {
            return Err(CameraError::NoFormatsAvailable);
        }
        Ok(formats)
    }
}
