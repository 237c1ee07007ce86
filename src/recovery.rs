//! Session lifecycle and reset.
//!
//! A [`Session`] is one fully initialised device: probed, format negotiated,
//! buffers mapped, exported and queued. [`Capture`] owns the current session
//! together with the registered consumer and can rebuild the session from
//! scratch with [`Capture::reset`].

use std::thread;

use crate::capture::{CancelToken, CaptureLoop, Frame, LoopStats};
use crate::config::CaptureConfig;
use crate::device::V4L2Device;
use crate::format::{FormatNegotiator, VideoFormat};
use crate::pool::BufferPool;
use crate::probe::{probe, DeviceCapability};
use crate::traits::{CameraDevice, CameraError, Result};

/// Consumer registered with [`Capture::start`].
pub type Consumer = Box<dyn FnMut(&Frame<'_>) + Send>;

/// An initialised capture session.
///
/// Dropping the session tears the pool down before the device is closed.
pub struct Session<D: CameraDevice> {
    pool: BufferPool<D::Mapping>,
    device: D,
    capability: DeviceCapability,
    format: VideoFormat,
    primed: bool,
    stats: LoopStats,
}

impl<D: CameraDevice> Session<D> {
    /// Probe, negotiate the format and set up the buffer pool.
    pub fn init(mut device: D, config: &CaptureConfig) -> Result<Self> {
        let capability = probe(&device)?;
        let mode = capability.mode;

        let format = {
            let mut negotiator = FormatNegotiator::new(&mut device, mode);
            negotiator.enumerate_formats()?;
            match &config.format {
                Some(requested) => negotiator.set_format(requested)?,
                None => negotiator.get_current_format()?,
            }
        };

        let mut pool = BufferPool::new(mode, format.plane_count);
        let prepared = pool
            .allocate(&mut device, config.buffer_count)
            .and_then(|_| pool.map_and_export(&mut device))
            .and_then(|()| pool.enqueue_all(&mut device));
        if let Err(err) = prepared {
            pool.teardown(&mut device);
            return Err(err);
        }

        Ok(Self {
            pool,
            device,
            capability,
            format,
            primed: true,
            stats: LoopStats::default(),
        })
    }

    /// Stream into `consumer` until cancelled or a fatal error occurs.
    pub fn run<F>(
        &mut self,
        consumer: &mut F,
        config: &CaptureConfig,
        cancel: &CancelToken,
    ) -> Result<LoopStats>
    where
        F: FnMut(&Frame<'_>) + ?Sized,
    {
        if !self.primed {
            self.pool.enqueue_all(&mut self.device)?;
        }
        self.primed = false;

        let mut capture =
            CaptureLoop::new(&mut self.device, &self.pool, config.timeout, cancel.clone());
        let result = capture.run(consumer);
        self.stats = capture.stats();
        result
    }

    /// Capability of the session's device.
    pub const fn capability(&self) -> &DeviceCapability {
        &self.capability
    }

    /// Negotiated format.
    pub const fn format(&self) -> &VideoFormat {
        &self.format
    }

    /// Buffer pool.
    pub const fn pool(&self) -> &BufferPool<D::Mapping> {
        &self.pool
    }

    /// Counters of the last loop run.
    pub const fn stats(&self) -> LoopStats {
        self.stats
    }
}

impl<D: CameraDevice> Drop for Session<D> {
    fn drop(&mut self) {
        self.pool.teardown(&mut self.device);
    }
}

/// Capture on the device named in the configuration, with reset support.
///
/// `O` opens a fresh device for every init.
pub struct Capture<D: CameraDevice, O> {
    config: CaptureConfig,
    opener: O,
    cancel: CancelToken,
    session: Option<Session<D>>,
    consumer: Option<Consumer>,
    resets: u32,
}

/// [`Capture`] over real V4L2 hardware.
pub type V4L2Capture = Capture<V4L2Device, fn(&CaptureConfig) -> Result<V4L2Device>>;

impl V4L2Capture {
    /// Capture from the V4L2 device named in `config`.
    #[must_use]
    pub fn v4l2(config: CaptureConfig) -> Self {
        Self::new(config, V4L2Device::open)
    }
}

impl<D, O> Capture<D, O>
where
    D: CameraDevice,
    O: FnMut(&CaptureConfig) -> Result<D>,
{
    /// Create an uninitialised capture.
    pub fn new(config: CaptureConfig, opener: O) -> Self {
        Self {
            config,
            opener,
            cancel: CancelToken::new(),
            session: None,
            consumer: None,
            resets: 0,
        }
    }

    /// Use `cancel` to stop the loop.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the running loop.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Open the device and build a session. An existing session is dropped first.
    pub fn init(&mut self) -> Result<()> {
        self.deinit();
        let device = (self.opener)(&self.config)?;
        let session = Session::init(device, &self.config)?;
        log::info!(
            "Capture ready on {}: {} ({} buffers)",
            self.config.device.display(),
            session.format(),
            session.pool().mapped_count()
        );
        self.session = Some(session);
        Ok(())
    }

    /// Drop the session: stop using the buffers, unmap them and close the device.
    pub fn deinit(&mut self) {
        if let Some(session) = self.session.take() {
            log::debug!("Closing {}", self.config.device.display());
            drop(session);
        }
    }

    /// Register `consumer` and stream into it.
    ///
    /// Initialises the device first when no session exists.
    pub fn start<F>(&mut self, consumer: F) -> Result<LoopStats>
    where
        F: FnMut(&Frame<'_>) + Send + 'static,
    {
        self.consumer = Some(Box::new(consumer));
        if self.session.is_none() {
            self.init()?;
        }
        self.resume()
    }

    /// Tear everything down, wait the settle interval, re-initialise and
    /// resume streaming into the registered consumer.
    ///
    /// One attempt per call. A failed re-initialisation is reported as
    /// [`CameraError::ResetFailed`].
    pub fn reset(&mut self) -> Result<LoopStats> {
        log::warn!("Resetting capture on {}", self.config.device.display());
        self.resets += 1;
        self.deinit();
        thread::sleep(self.config.settle);

        if let Err(err) = self.init() {
            log::error!("Reset failed: {err}");
            return Err(CameraError::ResetFailed(Box::new(err)));
        }
        if self.consumer.is_none() {
            return Ok(LoopStats::default());
        }
        self.resume()
    }

    fn resume(&mut self) -> Result<LoopStats> {
        let (Some(session), Some(consumer)) = (self.session.as_mut(), self.consumer.as_mut())
        else {
            return Ok(LoopStats::default());
        };
        session.run(&mut **consumer, &self.config, &self.cancel)
    }

    /// Capability of the current session.
    pub fn capability(&self) -> Option<&DeviceCapability> {
        self.session.as_ref().map(Session::capability)
    }

    /// Format of the current session.
    pub fn format(&self) -> Option<&VideoFormat> {
        self.session.as_ref().map(Session::format)
    }

    /// Counters of the last loop run, if a session exists.
    pub fn stats(&self) -> Option<LoopStats> {
        self.session.as_ref().map(Session::stats)
    }

    /// Number of resets attempted.
    pub const fn resets(&self) -> u32 {
        self.resets
    }

    /// Configuration used for every init.
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::format::PixelEncoding;
    use crate::mock::{MockDevice, MockEvent};

    fn test_config() -> CaptureConfig {
        CaptureConfig::default()
            .with_buffers(3)
            .with_timeout(Some(Duration::from_millis(300)))
            .with_settle(Duration::ZERO)
    }

    fn opener(
        devices: Vec<MockDevice>,
    ) -> impl FnMut(&CaptureConfig) -> Result<MockDevice> {
        let mut devices = VecDeque::from(devices);
        move |config: &CaptureConfig| {
            devices.pop_front().ok_or_else(|| CameraError::DeviceOpenFailed {
                path: config.device.display().to_string(),
                source: io::Error::from_raw_os_error(libc::ENOENT),
            })
        }
    }

    #[test]
    fn test_init_negotiates_and_prepares_pool() {
        let device = MockDevice::new().with_alignment(16);
        let ledger = device.ledger();
        let config = test_config().with_format(VideoFormat::new(1000, 500, PixelEncoding::Yuyv));

        let session = Session::init(device, &config).expect("init should succeed");

        assert_eq!(session.format().width, 992);
        assert_eq!(session.pool().mapped_count(), 3);
        assert_eq!(ledger.lock().expect("ledger lock").queued, vec![0, 1, 2]);
    }

    #[test]
    fn test_failed_init_releases_everything() {
        let device = MockDevice::new().with_export_failure(2);
        let ledger = device.ledger();

        let err = Session::init(device, &test_config()).err().expect("init should fail");

        assert!(matches!(err, CameraError::ExportFailed { index: 2, .. }));
        let ledger = ledger.lock().expect("ledger lock");
        assert_eq!(ledger.mapped.len(), ledger.unmapped.len());
        assert_eq!(ledger.releases, 1);
    }

    #[test]
    fn test_dropping_session_tears_down() {
        let device = MockDevice::new();
        let ledger = device.ledger();
        let session = Session::init(device, &test_config()).expect("init should succeed");
        drop(session);

        let ledger = ledger.lock().expect("ledger lock");
        assert_eq!(ledger.unmapped.len(), 3);
        assert_eq!(ledger.releases, 1);
    }

    #[test]
    fn test_reset_resumes_same_consumer() {
        let cancel = CancelToken::new();
        let stalled = MockDevice::new();
        let first_ledger = stalled.ledger();
        let healthy = MockDevice::new()
            .with_events([MockEvent::Frame(0), MockEvent::Frame(1)])
            .cancel_when_drained(cancel.clone());

        let mut capture = Capture::new(test_config(), opener(vec![stalled, healthy]))
            .with_cancel_token(cancel);

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let err = capture
            .start(move |_: &Frame<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect_err("stalled device should time out");
        assert!(matches!(err, CameraError::CaptureTimeout(_)));

        let stats = capture.reset().expect("reset should succeed");

        assert_eq!(stats.frames, 2);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(capture.resets(), 1);
        let first = first_ledger.lock().expect("ledger lock");
        assert_eq!(first.unmapped.len(), first.mapped.len());
        assert_eq!(first.releases, 1);
    }

    #[test]
    fn test_reset_reports_failed_reinit() {
        let mut capture = Capture::new(test_config(), opener(vec![MockDevice::new()]));
        capture.init().expect("init should succeed");

        let err = capture.reset().expect_err("reset should fail");

        assert!(matches!(
            err,
            CameraError::ResetFailed(ref cause) if matches!(**cause, CameraError::DeviceOpenFailed { .. })
        ));
        assert!(capture.format().is_none());
    }

    #[test]
    fn test_second_start_requeues_buffers() {
        let cancel = CancelToken::new();
        let device = MockDevice::new().with_events([MockEvent::Frame(2)]);
        let ledger = device.ledger();
        let mut capture =
            Capture::new(test_config(), opener(vec![device])).with_cancel_token(cancel.clone());

        let stop = cancel.clone();
        let stats = capture
            .start(move |_: &Frame<'_>| stop.cancel())
            .expect("loop should stop cleanly");
        assert_eq!(stats.frames, 1);

        // stream off hands every buffer back, so the next run queues them again
        let stats = capture
            .start(|_: &Frame<'_>| {})
            .expect("loop should stop cleanly");
        assert_eq!(stats.frames, 0);

        let ledger = ledger.lock().expect("ledger lock");
        assert_eq!(ledger.queued, vec![0, 1, 2, 2, 0, 1, 2]);
        assert_eq!(ledger.double_queues, 0);
        assert_eq!(ledger.stream_ons, 2);
    }

    #[test]
    fn test_reset_without_consumer_only_reinitialises() {
        let mut capture = Capture::new(
            test_config(),
            opener(vec![MockDevice::new(), MockDevice::new()]),
        );
        capture.init().expect("init should succeed");

        let stats = capture.reset().expect("reset should succeed");

        assert_eq!(stats, LoopStats::default());
        assert!(capture.capability().is_some());
    }
}
