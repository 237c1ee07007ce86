//! Capture configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::format::VideoFormat;
use crate::retry::RetryPolicy;

/// Device opened when none is configured.
pub const DEFAULT_DEVICE: &str = "/dev/video0";
/// Number of driver buffers requested by default.
pub const DEFAULT_BUFFER_COUNT: u32 = 5;
/// Readiness timeout in seconds used by default.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// Pause between teardown and re-initialisation during a reset.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

/// Everything needed to (re)initialise a capture session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device node path.
    pub device: PathBuf,
    /// Requested number of buffers; the driver may grant fewer.
    pub buffer_count: u32,
    /// Readiness timeout, `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Format to apply during init; the driver's current format is kept when `None`.
    pub format: Option<VideoFormat>,
    /// Pause between teardown and re-initialisation during a reset.
    pub settle: Duration,
    /// Retry policy for interrupted driver requests.
    pub retry: RetryPolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            buffer_count: DEFAULT_BUFFER_COUNT,
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            format: None,
            settle: DEFAULT_SETTLE,
            retry: RetryPolicy::default(),
        }
    }
}

impl CaptureConfig {
    /// Set the device node path.
    #[must_use]
    pub fn with_device<P: Into<PathBuf>>(mut self, device: P) -> Self {
        self.device = device.into();
        self
    }

    /// Set the requested buffer count.
    #[must_use]
    pub const fn with_buffers(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Set the readiness timeout in whole seconds. `0` waits indefinitely.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = if secs == 0 {
            None
        } else {
            Some(Duration::from_secs(secs))
        };
        self
    }

    /// Set the readiness timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Request a format during init.
    #[must_use]
    pub fn with_format(mut self, format: VideoFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Set the reset settle interval.
    #[must_use]
    pub const fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Set the retry policy for driver requests.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
