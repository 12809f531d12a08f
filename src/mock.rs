//! Scriptable mock driver and manual clock for testing without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::CameraConfig;
use crate::traits::{
    CameraDevice, CameraDriver, CameraError, Clock, Control, DeviceCapabilities, Format, FourCC,
    Frame, FrameMetadata, Result,
};

/// Small YUYV geometry keeps generated frames cheap.
pub fn test_config() -> CameraConfig {
    CameraConfig {
        device_id: "0".to_owned(),
        width: 64,
        height: 48,
        buffer_count: 2,
        ..CameraConfig::default()
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Uniform luma with neutral chroma.
    Solid(u8),
}

/// What the next `next_frame` call should do.
#[derive(Debug, Clone, Copy)]
pub enum FrameScript {
    /// Deliver a frame with this pattern.
    Pattern(TestPattern),
    /// Report a timeout.
    Timeout,
    /// Deliver a zero-byte buffer.
    Empty,
    /// Deliver half a frame.
    Truncated,
    /// Fail with a stream I/O error.
    Disconnect,
    /// Deliver a frame reusing the previous sequence number.
    RepeatSequence,
}

#[derive(Debug)]
struct MockState {
    present: bool,
    reject_format: bool,
    ready_after: Option<u32>,
    stream_after: Option<u32>,
    rejected_control: Option<Control>,
    failing_teardown: bool,
    max_frame_rate: Option<u32>,
    exposure_step: Option<u32>,
    pattern: TestPattern,
    script: VecDeque<FrameScript>,
    control_writes: Vec<(Control, u32)>,
    stream_starts: u32,
    opens: u32,
    frames_served: u32,
    next_sequence: u32,
}

/// Mock driver; clones share state so tests can inspect after handing one off.
#[derive(Debug, Clone)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Present, accepting, immediately ready, mid-grey frames.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                present: true,
                reject_format: false,
                ready_after: Some(0),
                stream_after: Some(0),
                rejected_control: None,
                failing_teardown: false,
                max_frame_rate: None,
                exposure_step: None,
                pattern: TestPattern::Solid(128),
                script: VecDeque::new(),
                control_writes: Vec::new(),
                stream_starts: 0,
                opens: 0,
                frames_served: 0,
                next_sequence: 0,
            })),
        }
    }

    fn with(self, apply: impl FnOnce(&mut MockState)) -> Self {
        apply(&mut self.lock());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `open` fails as if the node does not exist.
    #[must_use]
    pub fn absent(self) -> Self {
        self.with(|s| s.present = false)
    }

    /// `set_format` is refused.
    #[must_use]
    pub fn reject_format(self) -> Self {
        self.with(|s| s.reject_format = true)
    }

    /// Ready is confirmed on the `polls`-th poll.
    #[must_use]
    pub fn ready_after(self, polls: u32) -> Self {
        self.with(|s| s.ready_after = Some(polls))
    }

    /// Ready is never confirmed.
    #[must_use]
    pub fn never_ready(self) -> Self {
        self.with(|s| s.ready_after = None)
    }

    /// Streaming is never confirmed.
    #[must_use]
    pub fn never_streams(self) -> Self {
        self.with(|s| s.stream_after = None)
    }

    /// Writes to `control` are refused.
    #[must_use]
    pub fn reject_control(self, control: Control) -> Self {
        self.with(|s| s.rejected_control = Some(control))
    }

    /// `stop_stream` reports an error.
    #[must_use]
    pub fn failing_teardown(self) -> Self {
        self.with(|s| s.failing_teardown = true)
    }

    /// `set_frame_rate` clamps to `fps` instead of refusing faster rates.
    #[must_use]
    pub fn clamp_frame_rate(self, fps: u32) -> Self {
        self.with(|s| s.max_frame_rate = Some(fps))
    }

    /// Exposure is applied in whole `step_us` units, like V4L2's 100 us steps.
    #[must_use]
    pub fn exposure_step(self, step_us: u32) -> Self {
        self.with(|s| s.exposure_step = Some(step_us))
    }

    /// Pattern for unscripted frames.
    #[must_use]
    pub fn pattern(self, pattern: TestPattern) -> Self {
        self.with(|s| s.pattern = pattern)
    }

    /// Queue per-frame behaviour, consumed before falling back to the pattern.
    #[must_use]
    pub fn script(self, steps: impl IntoIterator<Item = FrameScript>) -> Self {
        self.with(|s| s.script.extend(steps))
    }

    /// Control writes received so far.
    pub fn control_writes(&self) -> Vec<(Control, u32)> {
        self.lock().control_writes.clone()
    }

    /// Number of `start_stream` calls.
    pub fn stream_starts(&self) -> u32 {
        self.lock().stream_starts
    }

    /// Number of successful opens.
    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    /// Frames delivered (including invalid ones).
    pub fn frames_served(&self) -> u32 {
        self.lock().frames_served
    }
}

impl CameraDriver for MockDriver {
    type Device = MockDevice;

    fn open(&mut self, device_id: &str) -> Result<MockDevice> {
        let mut state = self.lock();
        if !state.present {
            return Err(CameraError::DeviceNotFound(device_id.to_owned()));
        }
        state.opens += 1;
        drop(state);

        Ok(MockDevice {
            state: Arc::clone(&self.state),
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: None,
            ready_polls: 0,
            stream_polls: 0,
            streaming: false,
            last_sequence: None,
        })
    }
}

/// Mock device handle.
#[derive(Debug)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    capabilities: DeviceCapabilities,
    format: Option<Format>,
    ready_polls: u32,
    stream_polls: u32,
    streaming: bool,
    last_sequence: Option<u32>,
}

impl MockDevice {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn frame(&self, data: Vec<u8>, sequence: u32) -> Frame {
        let bytes_used = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Frame {
            data,
            metadata: FrameMetadata {
                sequence,
                timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
                bytes_used,
            },
        }
    }
}

impl CameraDevice for MockDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        if self.lock().reject_format {
            return Err(CameraError::FormatNotSupported {
                requested: format.clone(),
                actual: None,
            });
        }
        self.format = Some(format.clone());
        Ok(format.clone())
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<u32> {
        Ok(self.lock().max_frame_rate.map_or(fps, |max| fps.min(max)))
    }

    fn poll_ready(&mut self) -> Result<bool> {
        let ready_after = self.lock().ready_after;
        let ready = self.format.is_some() && ready_after.is_some_and(|n| self.ready_polls >= n);
        self.ready_polls += 1;
        Ok(ready)
    }

    fn start_stream(&mut self, _buffer_count: u32) -> Result<()> {
        self.lock().stream_starts += 1;
        self.streaming = true;
        Ok(())
    }

    fn poll_streaming(&mut self) -> Result<bool> {
        let stream_after = self.lock().stream_after;
        let confirmed = self.streaming && stream_after.is_some_and(|n| self.stream_polls >= n);
        self.stream_polls += 1;
        Ok(confirmed)
    }

    fn applied_value(&self, control: Control, value: u32) -> u32 {
        match (control, self.lock().exposure_step) {
            (Control::ExposureMicros, Some(step)) if step > 0 => (value / step).max(1) * step,
            _ => value,
        }
    }

    fn set_control(&mut self, control: Control, value: u32) -> Result<()> {
        let mut state = self.lock();
        if state.rejected_control == Some(control) {
            return Err(CameraError::ControlRejected {
                control,
                value,
                reason: "EINVAL".to_owned(),
            });
        }
        state.control_writes.push((control, value));
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Frame> {
        if !self.streaming {
            return Err(CameraError::StreamError("not streaming".to_owned()));
        }
        let format = self
            .format
            .clone()
            .unwrap_or_else(|| Format::new(64, 48, FourCC::YUYV));

        let (step, pattern) = {
            let mut state = self.lock();
            (state.script.pop_front(), state.pattern)
        };
        let step = step.unwrap_or(FrameScript::Pattern(pattern));

        let data = match step {
            FrameScript::Timeout => return Err(CameraError::Timeout),
            FrameScript::Disconnect => {
                return Err(CameraError::StreamError("No such device (os error 19)".to_owned()))
            }
            FrameScript::Pattern(scripted) => generate_test_frame(&format, scripted),
            FrameScript::RepeatSequence => generate_test_frame(&format, pattern),
            FrameScript::Empty => Vec::new(),
            FrameScript::Truncated => {
                let mut data = generate_test_frame(&format, pattern);
                data.truncate(data.len() / 2);
                data
            }
        };

        let sequence = {
            let mut state = self.lock();
            state.frames_served += 1;
            match (step, self.last_sequence) {
                (FrameScript::RepeatSequence, Some(last)) => last,
                _ => {
                    let seq = state.next_sequence;
                    state.next_sequence += 1;
                    seq
                }
            }
        };
        self.last_sequence = Some(sequence);
        Ok(self.frame(data, sequence))
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.streaming = false;
        if self.lock().failing_teardown {
            return Err(CameraError::StreamError("VIDIOC_STREAMOFF: EIO".to_owned()));
        }
        Ok(())
    }
}

/// Generate test frame data based on pattern.
fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    if format.fourcc == FourCC::GREY {
        let luma = match pattern {
            TestPattern::Solid(y) => y,
            TestPattern::Gradient => 128,
        };
        return vec![luma; (format.width * format.height) as usize];
    }

    let size = (format.width * format.height * 2) as usize; // YUYV = 2 bytes/pixel
    let mut data = vec![0u8; size];

    match pattern {
        TestPattern::Gradient => {
            generate_gradient(&mut data, format.width, format.height);
        }
        TestPattern::Solid(y) => {
            generate_solid(&mut data, y, 128, 128);
        }
    }

    data
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = ((x * 255) / width) as u8;
            let offset = ((y * width + x) * 2) as usize;

            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = 128;
                data[offset + 2] = y_val;
                data[offset + 3] = 128;
            }
        }
    }
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for chunk in data.chunks_exact_mut(4) {
        chunk.copy_from_slice(&[y, u, y, v]);
    }
}

#[derive(Debug)]
struct ClockState {
    origin: Instant,
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

/// Clock whose `sleep` advances virtual time instantly and records the wait.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ClockState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Clock at virtual time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every non-zero sleep so far.
    pub fn slept(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Drain the recorded sleeps.
    pub fn take_slept(&self) -> Vec<Duration> {
        std::mem::take(&mut self.lock().sleeps)
    }

    /// Total virtual time elapsed.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.lock();
        state.origin + state.elapsed
    }

    fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let mut state = self.lock();
        state.elapsed += duration;
        state.sleeps.push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let mut driver = MockDriver::new();
        let device = driver.open("0").expect("open should succeed");
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
        assert_eq!(driver.opens(), 1);
    }

    #[test]
    fn test_mock_stream_sequence() {
        let mut driver = MockDriver::new().script([
            FrameScript::Pattern(TestPattern::Solid(128)),
            FrameScript::RepeatSequence,
        ]);
        let mut device = driver.open("0").expect("open");
        device
            .set_format(&Format::new(64, 48, FourCC::YUYV))
            .expect("format");
        device.start_stream(2).expect("stream");

        let first = device.next_frame(Duration::ZERO).expect("frame");
        let repeated = device.next_frame(Duration::ZERO).expect("frame");
        let next = device.next_frame(Duration::ZERO).expect("frame");
        assert_eq!(first.metadata.sequence, 0);
        assert_eq!(repeated.metadata.sequence, 0);
        assert_eq!(next.metadata.sequence, 1);
    }

    #[test]
    fn test_gradient_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Gradient);

        assert!(data[0] < 10);
        let last_row_start = (479 * 640 * 2) as usize;
        assert!(data[last_row_start + 638 * 2] > 200);
    }

    #[test]
    fn test_clamped_frame_rate_and_exposure_step() {
        let mut driver = MockDriver::new().clamp_frame_rate(15).exposure_step(100);
        let mut device = driver.open("0").expect("open");
        assert_eq!(device.set_frame_rate(30).expect("rate"), 15);
        assert_eq!(device.set_frame_rate(10).expect("rate"), 10);
        assert_eq!(device.applied_value(Control::ExposureMicros, 1250), 1200);
        assert_eq!(device.applied_value(Control::ExposureMicros, 40), 100);
        assert_eq!(device.applied_value(Control::Focus, 305), 305);
    }

    #[test]
    fn test_manual_clock_records_sleeps() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_millis(3000));
        clock.sleep(Duration::ZERO);
        assert_eq!(clock.now() - start, Duration::from_millis(3000));
        assert_eq!(clock.slept(), vec![Duration::from_millis(3000)]);
    }
}
