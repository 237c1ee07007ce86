//! Mock device implementation for testing without hardware.
//!
//! [`MockDevice`] behaves like a small V4L2 driver: it grants buffers, hands
//! out mappings and descriptors, and replays a script of readiness events.
//! Everything the engine does to it is recorded in a shared [`MockLedger`] so
//! tests can check buffer ownership and resource release after the device has
//! been moved or dropped.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use v4l::capability::Flags;

use crate::capture::CancelToken;
use crate::format::PixelEncoding;
use crate::traits::{
    CameraDevice, CaptureMode, Dequeued, DeviceInfo, DriverFormat, FormatDescription,
    FormatRequest, FourCC, PlaneLayout, PlaneMapping, Readiness, MAX_PLANES,
};

/// Who holds a buffer, as seen by the mock driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Not queued (setup, teardown or after stream off).
    User,
    /// Queued to the driver.
    Driver,
    /// Dequeued and not yet returned.
    Consumer,
}

/// One scripted readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    /// Buffer `index` is filled and ready.
    Frame(u32),
    /// The wait is interrupted by a signal.
    Interrupt,
    /// Readiness is reported but there is nothing to dequeue.
    Spurious,
    /// One wait elapses without an event.
    Stall,
    /// Readiness is reported and the dequeue fails with an I/O error.
    Broken,
}

/// Record of everything the engine did to the mock.
#[derive(Debug, Default)]
pub struct MockLedger {
    /// `(buffer, plane)` of every mapping created.
    pub mapped: Vec<(u32, usize)>,
    /// `(buffer, plane)` of every mapping released.
    pub unmapped: Vec<(u32, usize)>,
    /// Number of descriptors exported.
    pub exported: usize,
    /// Buffer indices in the order they were queued.
    pub queued: Vec<u32>,
    /// Buffer indices in the order they were dequeued.
    pub delivered: Vec<u32>,
    /// Current owner of every granted buffer.
    pub owners: Vec<Owner>,
    /// Dequeues of a buffer the driver did not own.
    pub double_consumes: usize,
    /// Queues of a buffer the driver already owned.
    pub double_queues: usize,
    /// Number of `REQBUFS(0)` calls.
    pub releases: usize,
    /// Number of stream-on calls.
    pub stream_ons: usize,
    /// Whether the queue is streaming.
    pub streaming: bool,
}

/// Shared handle to a mock's ledger.
pub type SharedLedger = Arc<Mutex<MockLedger>>;

/// A mapping handed out by [`MockDevice`]; records its release on drop.
#[derive(Debug)]
pub struct MockMapping {
    buffer: u32,
    plane: usize,
    data: Vec<u8>,
    ledger: SharedLedger,
}

impl PlaneMapping for MockMapping {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.unmapped.push((self.buffer, self.plane));
        }
    }
}

/// Mock device for testing without hardware.
pub struct MockDevice {
    capabilities: Flags,
    format: DriverFormat,
    formats: Vec<FourCC>,
    alignment: u32,
    reject_formats: bool,
    grant: Option<u32>,
    mapping_failure: Option<(u32, usize)>,
    export_failure: Option<u32>,
    requeue_failure: Option<u32>,
    events: RefCell<VecDeque<MockEvent>>,
    pending: Cell<Option<MockEvent>>,
    cancel_when_drained: Option<CancelToken>,
    count: u32,
    sequence: u32,
    ledger: SharedLedger,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a single-plane streaming device with a 640x480 YUYV format.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: Flags::VIDEO_CAPTURE | Flags::STREAMING,
            format: DriverFormat {
                width: 640,
                height: 480,
                fourcc: FourCC::YUYV,
                colorspace: 8,
                plane_sizes: vec![640 * 480 * 2],
            },
            formats: vec![FourCC::YUYV, FourCC::NV12],
            alignment: 1,
            reject_formats: false,
            grant: None,
            mapping_failure: None,
            export_failure: None,
            requeue_failure: None,
            events: RefCell::new(VecDeque::new()),
            pending: Cell::new(None),
            cancel_when_drained: None,
            count: 0,
            sequence: 0,
            ledger: SharedLedger::default(),
        }
    }

    /// Set the capability bits.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Flags) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the active format.
    #[must_use]
    pub fn with_format(mut self, format: DriverFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the format table.
    #[must_use]
    pub fn with_formats(mut self, formats: Vec<FourCC>) -> Self {
        self.formats = formats;
        self
    }

    /// Round requested dimensions down to a multiple of `alignment`.
    #[must_use]
    pub fn with_alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment.max(1);
        self
    }

    /// Refuse every format change.
    #[must_use]
    pub fn with_rejected_formats(mut self) -> Self {
        self.reject_formats = true;
        self
    }

    /// Grant at most `max` buffers.
    #[must_use]
    pub fn with_grant(mut self, max: u32) -> Self {
        self.grant = Some(max);
        self
    }

    /// Fail mapping `plane` of buffer `index`.
    #[must_use]
    pub fn with_mapping_failure(mut self, index: u32, plane: usize) -> Self {
        self.mapping_failure = Some((index, plane));
        self
    }

    /// Fail exporting buffer `index`.
    #[must_use]
    pub fn with_export_failure(mut self, index: u32) -> Self {
        self.export_failure = Some(index);
        self
    }

    /// Refuse buffer `index` whenever it is queued while streaming.
    #[must_use]
    pub fn with_requeue_failure(mut self, index: u32) -> Self {
        self.requeue_failure = Some(index);
        self
    }

    /// Append readiness events to the script.
    #[must_use]
    pub fn with_events<I: IntoIterator<Item = MockEvent>>(self, events: I) -> Self {
        self.events.borrow_mut().extend(events);
        self
    }

    /// Cancel `token` once the script runs out instead of stalling.
    #[must_use]
    pub fn cancel_when_drained(mut self, token: CancelToken) -> Self {
        self.cancel_when_drained = Some(token);
        self
    }

    /// Shared ledger, valid after the device is moved or dropped.
    #[must_use]
    pub fn ledger(&self) -> SharedLedger {
        Arc::clone(&self.ledger)
    }

    fn record(&self) -> std::sync::MutexGuard<'_, MockLedger> {
        self.ledger.lock().expect("mock ledger poisoned")
    }

    fn plane_length(&self, plane: usize) -> u32 {
        self.format
            .plane_sizes
            .get(plane)
            .or_else(|| self.format.plane_sizes.first())
            .copied()
            .unwrap_or(4096)
    }

    fn owner_slot(ledger: &mut MockLedger, index: u32) -> Option<&mut Owner> {
        usize::try_from(index)
            .ok()
            .and_then(|slot| ledger.owners.get_mut(slot))
    }
}

fn invalid() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

impl CameraDevice for MockDevice {
    type Mapping = MockMapping;

    fn query_capability(&self) -> io::Result<DeviceInfo> {
        Ok(DeviceInfo {
            driver: "mock".to_owned(),
            card: "Mock Camera".to_owned(),
            bus_info: "mock:0".to_owned(),
            capabilities: self.capabilities,
        })
    }

    fn format(&self, _mode: CaptureMode) -> io::Result<DriverFormat> {
        Ok(self.format.clone())
    }

    fn set_format(
        &mut self,
        mode: CaptureMode,
        request: &FormatRequest,
    ) -> io::Result<DriverFormat> {
        if self.reject_formats {
            return Err(invalid());
        }
        let width = (request.width / self.alignment * self.alignment).max(self.alignment);
        let height = (request.height / self.alignment * self.alignment).max(self.alignment);
        let sizes = PixelEncoding::from_fourcc(request.fourcc).plane_sizes(width, height);
        let plane_sizes = match mode {
            CaptureMode::SinglePlane => vec![sizes.iter().sum::<u32>()],
            CaptureMode::MultiPlane => sizes,
        };

        self.format = DriverFormat {
            width,
            height,
            fourcc: request.fourcc,
            colorspace: self.format.colorspace,
            plane_sizes,
        };
        Ok(self.format.clone())
    }

    fn enum_format(&self, _mode: CaptureMode, index: u32) -> io::Result<Option<FormatDescription>> {
        let entry = usize::try_from(index)
            .ok()
            .and_then(|slot| self.formats.get(slot));
        Ok(entry.map(|&fourcc| FormatDescription {
            fourcc,
            description: format!("Mock {fourcc}"),
        }))
    }

    fn request_buffers(&mut self, _mode: CaptureMode, count: u32) -> io::Result<u32> {
        let granted = self.grant.map_or(count, |max| count.min(max));
        self.count = granted;

        let mut ledger = self.record();
        if count == 0 {
            ledger.releases += 1;
        }
        ledger.owners = vec![Owner::User; usize::try_from(granted).unwrap_or_default()];
        Ok(granted)
    }

    fn query_buffer(
        &mut self,
        _mode: CaptureMode,
        index: u32,
        plane_count: usize,
    ) -> io::Result<Vec<PlaneLayout>> {
        if index >= self.count {
            return Err(invalid());
        }
        Ok((0..plane_count)
            .map(|plane| PlaneLayout {
                offset: (index << 16) | u32::try_from(plane).unwrap_or_default(),
                length: self.plane_length(plane),
            })
            .collect())
    }

    fn map_plane(&mut self, layout: &PlaneLayout) -> io::Result<MockMapping> {
        let buffer = layout.offset >> 16;
        let plane = usize::try_from(layout.offset & 0xffff).unwrap_or_default();
        if self.mapping_failure == Some((buffer, plane)) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        self.record().mapped.push((buffer, plane));
        Ok(MockMapping {
            buffer,
            plane,
            data: vec![
                u8::try_from(buffer).unwrap_or(u8::MAX);
                usize::try_from(layout.length).unwrap_or_default()
            ],
            ledger: self.ledger(),
        })
    }

    fn export_buffer(&mut self, _mode: CaptureMode, index: u32) -> io::Result<OwnedFd> {
        if self.export_failure == Some(index) {
            return Err(invalid());
        }
        let file = File::open("/dev/null")?;
        self.record().exported += 1;
        Ok(OwnedFd::from(file))
    }

    fn queue_buffer(
        &mut self,
        _mode: CaptureMode,
        index: u32,
        _plane_count: usize,
    ) -> io::Result<()> {
        let mut ledger = self.record();
        if ledger.streaming && self.requeue_failure == Some(index) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        let Some(owner) = Self::owner_slot(&mut ledger, index) else {
            return Err(invalid());
        };
        if *owner == Owner::Driver {
            ledger.double_queues += 1;
            return Err(invalid());
        }
        *owner = Owner::Driver;
        ledger.queued.push(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self, _mode: CaptureMode, plane_count: usize) -> io::Result<Dequeued> {
        let index = match self.pending.take() {
            Some(MockEvent::Frame(index)) => index,
            Some(MockEvent::Broken) => return Err(io::Error::from_raw_os_error(libc::EIO)),
            _ => return Err(io::Error::from(io::ErrorKind::WouldBlock)),
        };

        {
            let mut ledger = self.record();
            if let Some(owner) = Self::owner_slot(&mut ledger, index) {
                let previous = std::mem::replace(owner, Owner::Consumer);
                if previous != Owner::Driver {
                    ledger.double_consumes += 1;
                }
                ledger.delivered.push(index);
            }
        }

        let mut bytes_used = [0; MAX_PLANES];
        for (plane, used) in bytes_used.iter_mut().take(plane_count).enumerate() {
            *used = self.plane_length(plane);
        }
        let sequence = self.sequence;
        self.sequence += 1;

        Ok(Dequeued {
            index,
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33),
            bytes_used,
        })
    }

    fn stream_on(&mut self, _mode: CaptureMode) -> io::Result<()> {
        let mut ledger = self.record();
        ledger.streaming = true;
        ledger.stream_ons += 1;
        Ok(())
    }

    fn stream_off(&mut self, _mode: CaptureMode) -> io::Result<()> {
        let mut ledger = self.record();
        ledger.streaming = false;
        ledger.owners.fill(Owner::User);
        Ok(())
    }

    fn wait_ready(&self, timeout: Option<Duration>) -> io::Result<Readiness> {
        let event = self.events.borrow_mut().pop_front();
        match event {
            Some(event @ (MockEvent::Frame(_) | MockEvent::Spurious | MockEvent::Broken)) => {
                self.pending.set(Some(event));
                Ok(Readiness::Ready)
            }
            Some(MockEvent::Interrupt) => Ok(Readiness::Interrupted),
            None if self.cancel_when_drained.is_some() => {
                if let Some(token) = &self.cancel_when_drained {
                    token.cancel();
                }
                Ok(Readiness::TimedOut)
            }
            Some(MockEvent::Stall) | None => {
                thread::sleep(timeout.unwrap_or(Duration::from_millis(10)));
                Ok(Readiness::TimedOut)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_records_release() {
        let mut device = MockDevice::new();
        let ledger = device.ledger();
        device
            .request_buffers(CaptureMode::SinglePlane, 1)
            .expect("request should succeed");
        let layouts = device
            .query_buffer(CaptureMode::SinglePlane, 0, 1)
            .expect("query should succeed");
        let layout = layouts.first().expect("one plane");

        let mapping = device.map_plane(layout).expect("map should succeed");
        assert_eq!(mapping.len(), 640 * 480 * 2);
        drop(mapping);

        let ledger = ledger.lock().expect("ledger lock");
        assert_eq!(ledger.mapped, vec![(0, 0)]);
        assert_eq!(ledger.unmapped, vec![(0, 0)]);
    }

    #[test]
    fn test_script_replay() {
        let device = MockDevice::new().with_events([MockEvent::Interrupt, MockEvent::Frame(0)]);

        assert_eq!(
            device.wait_ready(None).expect("wait should succeed"),
            Readiness::Interrupted
        );
        assert_eq!(
            device.wait_ready(None).expect("wait should succeed"),
            Readiness::Ready
        );
        assert_eq!(
            device
                .wait_ready(Some(Duration::from_millis(1)))
                .expect("wait should succeed"),
            Readiness::TimedOut
        );
    }
}
