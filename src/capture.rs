//! The dequeue / consume / requeue loop.
//!
//! One [`CaptureLoop::run`] call streams until the [`CancelToken`] is set or a
//! fatal error occurs. Each iteration waits for readiness, dequeues one
//! buffer, hands it to the consumer as a [`Frame`] and returns it to the
//! driver. The consumer runs on the loop thread, so a slow consumer slows the
//! loop down and the driver drops frames instead of the loop buffering them.

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dma_buf::DmaBuf;

use crate::pool::BufferPool;
use crate::traits::{CameraDevice, CameraError, CaptureMode, Readiness, Result};

/// Longest single readiness wait, so cancellation is seen while idle.
const WAIT_SLICE: Duration = Duration::from_millis(200);

/// Cooperative stop request shared between the loop and its controllers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the loop to stop after the current iteration.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Underlying flag, e.g. for `signal_hook::flag::register`.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// The filled part of one mapped plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneView<'a> {
    data: &'a [u8],
    capacity: usize,
}

impl<'a> PlaneView<'a> {
    fn new(mapped: &'a [u8], bytes_used: u32) -> Self {
        let used = usize::try_from(bytes_used)
            .unwrap_or(usize::MAX)
            .min(mapped.len());
        Self {
            data: mapped.get(..used).unwrap_or_default(),
            capacity: mapped.len(),
        }
    }

    /// Bytes written by the driver.
    #[must_use]
    pub const fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Number of bytes written by the driver.
    #[must_use]
    pub const fn bytes_used(&self) -> usize {
        self.data.len()
    }

    /// Mapped length of the plane.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Plane data of one frame.
#[derive(Debug, Clone, Copy)]
pub enum FrameView<'a> {
    /// Single-plane capture.
    Single(PlaneView<'a>),
    /// Multi-plane capture, planes in driver order.
    Multi(&'a [PlaneView<'a>]),
}

impl<'a> FrameView<'a> {
    /// All planes, whichever the capture mode.
    #[must_use]
    pub fn planes(&self) -> &[PlaneView<'a>] {
        match self {
            Self::Single(plane) => std::slice::from_ref(plane),
            Self::Multi(planes) => planes,
        }
    }
}

/// One captured frame, valid for the duration of the consumer call.
#[derive(Debug)]
pub struct Frame<'a> {
    index: u32,
    sequence: u32,
    timestamp: Duration,
    view: FrameView<'a>,
    descriptor: BorrowedFd<'a>,
}

impl<'a> Frame<'a> {
    /// Driver buffer index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Driver frame sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Capture timestamp as reported by the driver.
    #[must_use]
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Plane data.
    #[must_use]
    pub const fn view(&self) -> &FrameView<'a> {
        &self.view
    }

    /// The buffer's exported DMA-BUF descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> BorrowedFd<'a> {
        self.descriptor
    }

    /// Total bytes written over all planes.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.view.planes().iter().map(PlaneView::bytes_used).sum()
    }

    /// Duplicate the descriptor into an owned DMA-BUF handle.
    ///
    /// The handle stays valid after the frame is requeued, but the buffer
    /// contents will be overwritten by later frames.
    pub fn dmabuf(&self) -> io::Result<DmaBuf> {
        Ok(DmaBuf::from(self.descriptor.try_clone_to_owned()?))
    }
}

/// Counters for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Frames delivered to the consumer.
    pub frames: u64,
    /// Dequeued buffers with an out-of-range index.
    pub skipped_indices: u64,
    /// Buffers the driver refused to take back.
    pub requeue_failures: u64,
    /// Readiness waits interrupted by a signal.
    pub interrupted_waits: u64,
    /// Readiness reported without a buffer to dequeue.
    pub spurious_wakeups: u64,
}

impl fmt::Display for LoopStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames, {} skipped, {} requeue failures, {} interrupted waits, {} spurious wake-ups",
            self.frames,
            self.skipped_indices,
            self.requeue_failures,
            self.interrupted_waits,
            self.spurious_wakeups
        )
    }
}

/// Streams frames from a mapped pool to a consumer.
pub struct CaptureLoop<'a, D: CameraDevice> {
    device: &'a mut D,
    pool: &'a BufferPool<D::Mapping>,
    timeout: Option<Duration>,
    cancel: CancelToken,
    stats: LoopStats,
}

impl<'a, D: CameraDevice> CaptureLoop<'a, D> {
    /// Build a loop over a pool whose buffers are already queued.
    pub fn new(
        device: &'a mut D,
        pool: &'a BufferPool<D::Mapping>,
        timeout: Option<Duration>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            device,
            pool,
            timeout,
            cancel,
            stats: LoopStats::default(),
        }
    }

    /// Counters of the current or last run.
    pub const fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Stream until cancelled or a fatal error occurs.
    ///
    /// Returns `Ok` with the run's counters when stopped through the cancel
    /// token. Streaming is switched off on every exit path.
    pub fn run<F>(&mut self, consumer: &mut F) -> Result<LoopStats>
    where
        F: FnMut(&Frame<'_>) + ?Sized,
    {
        let mode = self.pool.mode();
        self.stats = LoopStats::default();

        self.device
            .stream_on(mode)
            .map_err(CameraError::StreamError)?;
        log::info!(
            "Streaming started ({mode}, {} buffers, timeout {:?})",
            self.pool.mapped_count(),
            self.timeout
        );

        let result = self.cycle(consumer);

        if let Err(err) = self.device.stream_off(mode) {
            log::warn!("Failed to stop streaming: {err}");
        }
        match &result {
            Ok(()) => log::info!("Streaming stopped: {}", self.stats),
            Err(err) => log::error!("Streaming failed: {err}"),
        }
        result.map(|()| self.stats)
    }

    fn cycle<F>(&mut self, consumer: &mut F) -> Result<()>
    where
        F: FnMut(&Frame<'_>) + ?Sized,
    {
        let pool = self.pool;
        let mode = pool.mode();
        let plane_count = pool.plane_count();
        let mut views: Vec<PlaneView<'_>> = Vec::with_capacity(plane_count);

        loop {
            if !self.wait_ready()? {
                return Ok(());
            }

            let dequeued = match self.device.dequeue_buffer(mode, plane_count) {
                Ok(dequeued) => dequeued,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.stats.spurious_wakeups += 1;
                    continue;
                }
                Err(err) => return Err(CameraError::StreamError(err)),
            };

            let Some(buffer) = pool.buffer(dequeued.index) else {
                log::warn!(
                    "Dequeued buffer index {} outside pool of {}, skipping",
                    dequeued.index,
                    pool.len()
                );
                self.stats.skipped_indices += 1;
                continue;
            };

            views.clear();
            views.extend(
                buffer
                    .planes()
                    .iter()
                    .zip(dequeued.bytes_used)
                    .map(|(plane, used)| PlaneView::new(plane.as_slice(), used)),
            );
            let view = match mode {
                CaptureMode::SinglePlane => {
                    FrameView::Single(views.first().copied().unwrap_or_default())
                }
                CaptureMode::MultiPlane => FrameView::Multi(&views),
            };
            let frame = Frame {
                index: dequeued.index,
                sequence: dequeued.sequence,
                timestamp: dequeued.timestamp,
                view,
                descriptor: buffer.descriptor(),
            };

            log::trace!(
                "Frame seq={} index={} bytes={}",
                frame.sequence,
                frame.index,
                frame.bytes_used()
            );
            consumer(&frame);
            self.stats.frames += 1;

            if let Err(err) = pool.requeue(&mut *self.device, dequeued.index) {
                log::warn!("Failed to requeue buffer {}: {err}", dequeued.index);
                self.stats.requeue_failures += 1;
            }
        }
    }

    /// Wait until a buffer is ready. `Ok(false)` means cancelled.
    fn wait_ready(&mut self) -> Result<bool> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }

            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(self.timed_out());
                    }
                    remaining.min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };

            match self
                .device
                .wait_ready(Some(slice))
                .map_err(CameraError::StreamError)?
            {
                Readiness::Ready => return Ok(true),
                Readiness::Interrupted => {
                    self.stats.interrupted_waits += 1;
                    log::debug!("Readiness wait interrupted, retrying");
                }
                Readiness::TimedOut => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(self.timed_out());
                    }
                }
            }
        }
    }

    fn timed_out(&self) -> CameraError {
        let timeout = self.timeout.unwrap_or_default();
        log::error!("No frame within {timeout:?}");
        CameraError::CaptureTimeout(timeout)
    }
}
