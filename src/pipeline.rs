//! Camera pipeline lifecycle.
//!
//! ```text
//! Closed --open--> Opening --confirmed--> Ready --start_streaming--> Streaming
//!    ^                                                                   |
//!    +------------------------------- close ----------------------------+
//! ```
//!
//! Any failure mid-transition lands in `Faulted`; from there only `close()`
//! is accepted.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{CameraConfig, Timeouts};
use crate::error::{CaptureError, PipelineError};
use crate::properties::{CameraProperties, PropertyStore};
use crate::settle::DeviceClass;
use crate::traits::{
    CameraDevice, CameraDriver, CameraError, Clock, Control, Format, FourCC, Frame,
};

/// Lifecycle state of the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipelineState {
    /// No hardware handle held.
    #[default]
    Closed,
    /// Handle acquired, waiting for the device to confirm configuration.
    Opening,
    /// Configured and stabilized; properties may be written.
    Ready,
    /// Frames flowing; captures allowed.
    Streaming,
    /// A transition failed; only `close()` is accepted.
    Faulted,
}

impl PipelineState {
    /// Whether property writes are meaningful.
    #[must_use]
    pub const fn is_at_least_ready(self) -> bool {
        matches!(self, Self::Ready | Self::Streaming)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Ready => "ready",
            Self::Streaming => "streaming",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of what status readers may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraStatus {
    /// Pipeline state.
    pub state: PipelineState,
    /// Last confirmed properties.
    pub last_properties: CameraProperties,
    /// Configured hardware class.
    pub device_class: DeviceClass,
    /// A capture run is executing.
    pub run_in_progress: bool,
}

/// Shared status snapshot, written by the owner and copied by readers.
///
/// The lock is held only for the copy; no pipeline call runs under it.
#[derive(Debug, Clone)]
pub struct StatusBoard(Arc<Mutex<CameraStatus>>);

impl StatusBoard {
    fn new(device_class: DeviceClass) -> Self {
        Self(Arc::new(Mutex::new(CameraStatus {
            state: PipelineState::Closed,
            last_properties: CameraProperties::UNKNOWN,
            device_class,
            run_in_progress: false,
        })))
    }

    /// Copy of the current status.
    #[must_use]
    pub fn read(&self) -> CameraStatus {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update(&self, apply: impl FnOnce(&mut CameraStatus)) {
        apply(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Owns the hardware handle and drives every lifecycle transition.
pub struct PipelineController<Dr: CameraDriver> {
    driver: Dr,
    device: Option<Dr::Device>,
    state: PipelineState,
    store: PropertyStore,
    device_class: DeviceClass,
    format: Option<Format>,
    fourcc: FourCC,
    buffer_count: u32,
    stabilization: Duration,
    timeouts: Timeouts,
    clock: Arc<dyn Clock>,
    status: StatusBoard,
    stream_generation: u64,
}

impl<Dr: CameraDriver> PipelineController<Dr> {
    /// Controller in `Closed` state. Fails only on an unparseable fourcc.
    pub fn new(
        driver: Dr,
        config: &CameraConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, crate::config::ConfigError> {
        Ok(Self {
            driver,
            device: None,
            state: PipelineState::Closed,
            store: PropertyStore::new(),
            device_class: config.device_class,
            format: None,
            fourcc: config.pixel_format()?,
            buffer_count: config.buffer_count,
            stabilization: Duration::from_millis(u64::from(config.stabilization_ms)),
            timeouts: config.timeouts.clone(),
            clock,
            status: StatusBoard::new(config.device_class),
            stream_generation: 0,
        })
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        self.state
    }

    /// Copy of the last confirmed properties.
    #[must_use]
    pub const fn properties(&self) -> CameraProperties {
        self.store.snapshot()
    }

    /// Configured hardware class.
    #[must_use]
    pub const fn device_class(&self) -> DeviceClass {
        self.device_class
    }

    /// Format negotiated by the last successful open.
    #[must_use]
    pub const fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    /// Incremented each time streaming starts; frame sequence numbers are
    /// only comparable within one generation.
    #[must_use]
    pub const fn stream_generation(&self) -> u64 {
        self.stream_generation
    }

    /// Bounded waits in effect.
    #[must_use]
    pub const fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Time source shared with the scheduler and reset path.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Handle for lock-free-of-hardware status reads.
    #[must_use]
    pub fn status_board(&self) -> StatusBoard {
        self.status.clone()
    }

    /// Switch hardware class. Only legal while `Closed`.
    pub fn set_device_class(&mut self, device_class: DeviceClass) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Closed => {}
            PipelineState::Faulted => return Err(PipelineError::Faulted),
            other => return Err(PipelineError::AlreadyOpen(other)),
        }
        self.device_class = device_class;
        self.status.update(|s| s.device_class = device_class);
        Ok(())
    }

    /// Acquire `device_id`, apply geometry and frame rate, and wait until the
    /// device confirms `Ready` plus the stabilization window.
    pub fn open(
        &mut self,
        device_id: &str,
        width: u32,
        height: u32,
        frame_rate: u32,
    ) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Closed => {}
            PipelineState::Faulted => return Err(PipelineError::Faulted),
            other => return Err(PipelineError::AlreadyOpen(other)),
        }

        info!(device_id, width, height, frame_rate, class = ?self.device_class, "opening camera");
        self.set_state(PipelineState::Opening);
        self.store.clear();
        self.publish_properties();

        let device = match self.driver.open(device_id) {
            Ok(device) => self.device.insert(device),
            Err(err) => {
                let reason = err.to_string();
                return Err(self.fault(PipelineError::DeviceNotFound {
                    device_id: device_id.to_owned(),
                    reason,
                }));
            }
        };
        debug!(card = %device.capabilities().card, "handle acquired");

        let requested = Format::new(width, height, self.fourcc);
        let configured = device.set_format(&requested).and_then(|actual| {
            let applied_fps = device.set_frame_rate(frame_rate)?;
            Ok((actual, applied_fps))
        });
        // Drivers clamp unsupported rates instead of refusing them.
        let actual = match configured {
            Ok((actual, applied_fps)) if applied_fps == frame_rate => actual,
            Ok((_, applied_fps)) => {
                return Err(self.fault(PipelineError::FormatUnsupported {
                    requested,
                    frame_rate,
                    reason: format!("driver applied {applied_fps} fps"),
                }));
            }
            Err(err) => {
                return Err(self.fault(PipelineError::FormatUnsupported {
                    requested,
                    frame_rate,
                    reason: err.to_string(),
                }));
            }
        };

        let bound = self.timeouts.open_for(self.device_class);
        let poll = Duration::from_millis(u64::from(self.timeouts.ready_poll_ms));
        match wait_until(self.clock.as_ref(), poll, bound, || device.poll_ready()) {
            Ok(true) => {}
            Ok(false) => return Err(self.fault(PipelineError::OpenTimeout(bound))),
            Err(err) => return Err(self.fault(PipelineError::HardwareFault(err.to_string()))),
        }

        debug!(stabilization = ?self.stabilization, "device confirmed, stabilizing");
        self.clock.sleep(self.stabilization);

        self.format = Some(actual);
        self.set_state(PipelineState::Ready);
        info!("camera ready");
        Ok(())
    }

    /// Begin streaming. No-op when already streaming.
    pub fn start_streaming(&mut self) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Streaming => return Ok(()),
            PipelineState::Ready => {}
            PipelineState::Faulted => return Err(PipelineError::Faulted),
            other => return Err(PipelineError::NotReady(other)),
        }

        let Some(device) = self.device.as_mut() else {
            return Err(self.fault(PipelineError::HardwareFault("handle lost".to_owned())));
        };
        if let Err(err) = device.start_stream(self.buffer_count) {
            return Err(self.fault(PipelineError::HardwareFault(err.to_string())));
        }

        let bound = Duration::from_millis(u64::from(self.timeouts.stream_start_ms));
        let poll = Duration::from_millis(u64::from(self.timeouts.ready_poll_ms));
        match wait_until(self.clock.as_ref(), poll, bound, || device.poll_streaming()) {
            Ok(true) => {}
            Ok(false) => return Err(self.fault(PipelineError::StreamStartTimeout(bound))),
            Err(err) => return Err(self.fault(PipelineError::HardwareFault(err.to_string()))),
        }

        self.stream_generation += 1;
        self.set_state(PipelineState::Streaming);
        info!(generation = self.stream_generation, "camera streaming");
        Ok(())
    }

    /// Values the device will actually run at for a requested focus and
    /// exposure. Requests pass through unchanged while no handle is open.
    #[must_use]
    pub fn applied_values(
        &self,
        focus: Option<u32>,
        exposure_us: Option<u32>,
    ) -> (Option<u32>, Option<u32>) {
        let Some(device) = self.device.as_ref() else {
            return (focus, exposure_us);
        };
        (
            focus.map(|f| device.applied_value(Control::Focus, f)),
            exposure_us.map(|e| device.applied_value(Control::ExposureMicros, e)),
        )
    }

    /// Apply focus and/or exposure. Returns whether anything differed from
    /// the confirmed values; `false` means no settle is needed.
    ///
    /// Values are compared and confirmed as the device applies them, so a
    /// quantized exposure is stored at its hardware value. Devices that do not
    /// take manual control never receive a write and always report `false`.
    /// Any state below `Ready`, `Faulted` included, is `NotReady`.
    pub fn write_property(
        &mut self,
        focus: Option<u32>,
        exposure_us: Option<u32>,
    ) -> Result<bool, PipelineError> {
        match self.state {
            PipelineState::Ready | PipelineState::Streaming => {}
            other => return Err(PipelineError::NotReady(other)),
        }

        let (focus, exposure_us) = self.applied_values(focus, exposure_us);
        let confirmed = self.store.snapshot();
        let new_focus = focus.filter(|f| confirmed.focus != Some(*f));
        let new_exposure = exposure_us.filter(|e| confirmed.exposure_us != Some(*e));
        if new_focus.is_none() && new_exposure.is_none() {
            return Ok(false);
        }
        if !self.device_class.accepts_manual_control() {
            debug!(?focus, ?exposure_us, "manual values ignored by this device class");
            return Ok(false);
        }

        let Some(device) = self.device.as_mut() else {
            return Err(self.fault(PipelineError::HardwareFault("handle lost".to_owned())));
        };

        // The store only learns values the device accepted.
        if let Some(value) = new_focus {
            if let Err(err) = device.set_control(Control::Focus, value) {
                return Err(self.fault(PipelineError::HardwareFault(err.to_string())));
            }
            self.store.confirm_focus(value);
        }
        if let Some(value) = new_exposure {
            if let Err(err) = device.set_control(Control::ExposureMicros, value) {
                self.publish_properties();
                return Err(self.fault(PipelineError::HardwareFault(err.to_string())));
            }
            self.store.confirm_exposure(value);
        }

        self.publish_properties();
        debug!(properties = ?self.store.snapshot(), "properties applied");
        Ok(true)
    }

    /// Dequeue one fresh frame. Stream-level I/O failures fault the pipeline.
    pub(crate) fn next_frame(&mut self, timeout_ms: u32) -> Result<Frame, CaptureError> {
        if self.state != PipelineState::Streaming {
            return Err(CaptureError::NotStreaming(self.state));
        }
        let Some(device) = self.device.as_mut() else {
            return Err(CaptureError::NotStreaming(self.state));
        };

        match device.next_frame(Duration::from_millis(u64::from(timeout_ms))) {
            Ok(frame) => Ok(frame),
            Err(CameraError::Timeout) => Err(CaptureError::Timeout { timeout_ms }),
            Err(err) => {
                let message = err.to_string();
                self.fault(PipelineError::HardwareFault(message.clone()));
                Err(CaptureError::Hardware(message))
            }
        }
    }

    /// Tear down the pipeline. Never fails; teardown errors are logged.
    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            if let Err(err) = device.stop_stream() {
                warn!(%err, "teardown error ignored while closing camera");
            }
        }
        self.format = None;
        if self.state != PipelineState::Closed {
            info!(from = %self.state, "camera closed");
            self.set_state(PipelineState::Closed);
        }
    }

    /// Forget confirmed properties so the next write always reaches hardware.
    pub fn forget_properties(&mut self) {
        self.store.clear();
        self.publish_properties();
    }

    pub(crate) fn set_run_in_progress(&self, running: bool) {
        self.status.update(|s| s.run_in_progress = running);
    }

    fn fault(&mut self, err: PipelineError) -> PipelineError {
        warn!(%err, from = %self.state, "camera faulted");
        self.set_state(PipelineState::Faulted);
        err
    }

    fn set_state(&mut self, state: PipelineState) {
        self.state = state;
        self.status.update(|s| s.state = state);
    }

    fn publish_properties(&self) {
        let properties = self.store.snapshot();
        self.status.update(|s| s.last_properties = properties);
    }
}

/// Poll `check` every `poll` until it reports `true` or `bound` elapses.
fn wait_until<F>(
    clock: &dyn Clock,
    poll: Duration,
    bound: Duration,
    mut check: F,
) -> Result<bool, CameraError>
where
    F: FnMut() -> Result<bool, CameraError>,
{
    let deadline = clock.now() + bound;
    loop {
        if check()? {
            return Ok(true);
        }
        if clock.now() >= deadline {
            return Ok(false);
        }
        clock.sleep(poll.max(Duration::from_millis(1)));
    }
}
