//! V4L2 device implementation using the v4l crate.

use std::io;
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::control::{Control as V4lControl, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream as V4lCaptureStream, Stream as V4lStream};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    CameraDevice, CameraDriver, CameraError, Control, DeviceCapabilities, Format, FourCC, Frame,
    FrameMetadata, Result,
};

const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const V4L2_CID_FOCUS_ABSOLUTE: u32 = 0x009a_090a;
const V4L2_CID_FOCUS_AUTO: u32 = 0x009a_090c;
const V4L2_EXPOSURE_MANUAL: i64 = 1;

/// `V4L2_CID_EXPOSURE_ABSOLUTE` counts in 100 us steps.
const EXPOSURE_UNIT_US: u32 = 100;

/// Slice used while waiting for the first frame after `VIDIOC_STREAMON`.
const PRIME_POLL: Duration = Duration::from_millis(100);

/// Poll used to collect buffers the driver has already filled.
const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Opens `/dev/video*` nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4L2Driver;

impl CameraDriver for V4L2Driver {
    type Device = V4L2Device;

    fn open(&mut self, device_id: &str) -> Result<V4L2Device> {
        V4L2Device::open(device_id)
    }
}

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    capabilities: DeviceCapabilities,
    format: Option<Format>,
    stream: Option<Stream<'static>>,
    primed: bool,
    manual_focus: bool,
    manual_exposure: bool,
    /// Buffers queued before the last control write that must be discarded.
    stale_buffers: u32,
    buffer_count: u32,
}

impl V4L2Device {
    /// Open a V4L2 device by index (`"0"`) or path (`"/dev/video0"`).
    pub fn open(device_id: &str) -> Result<Self> {
        let opened = match device_id.parse::<usize>() {
            Ok(index) => Device::new(index),
            Err(_) => Device::with_path(device_id),
        };
        let device = opened.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CameraError::DeviceNotFound(device_id.to_owned()),
            _ => CameraError::DeviceOpenFailed(err.to_string()),
        })?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        if !capabilities.can_capture {
            return Err(CameraError::DeviceOpenFailed(format!(
                "{device_id} ({}) is not a capture device",
                capabilities.card
            )));
        }

        Ok(Self {
            device,
            capabilities,
            format: None,
            stream: None,
            primed: false,
            manual_focus: false,
            manual_exposure: false,
            stale_buffers: 0,
            buffer_count: 0,
        })
    }

    fn write_raw(&self, id: u32, value: i64) -> io::Result<()> {
        self.device.set_control(V4lControl {
            id,
            value: Value::Integer(value),
        })
    }

    fn dequeue(&mut self, timeout: Duration) -> Result<Frame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::StreamError("stream not started".to_owned()))?;
        stream.set_timeout(timeout);

        let (buf, meta) = stream.next().map_err(|err| match err.kind() {
            io::ErrorKind::TimedOut => CameraError::Timeout,
            _ => CameraError::StreamError(err.to_string()),
        })?;

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        let used = buf.get(..meta.bytesused as usize).unwrap_or(buf);

        Ok(Frame {
            data: used.to_vec(),
            metadata: FrameMetadata {
                sequence: meta.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: meta.bytesused,
            },
        })
    }
}

/// Exposure in `V4L2_CID_EXPOSURE_ABSOLUTE` units, never below one.
const fn exposure_units(exposure_us: u32) -> u32 {
    let units = exposure_us / EXPOSURE_UNIT_US;
    if units == 0 {
        1
    } else {
        units
    }
}

/// Dequeue buffers that are already done until the queue comes up empty,
/// at most `limit` of them. Returns how many were discarded.
///
/// Buffers fill while nobody is reading, so a frame sitting in the queue can
/// predate the request by an arbitrary amount of time.
fn drain_pending<F>(limit: u32, mut dequeue: F) -> Result<u32>
where
    F: FnMut(Duration) -> Result<Frame>,
{
    let mut dropped = 0;
    while dropped < limit {
        match dequeue(DRAIN_POLL) {
            Ok(frame) => {
                debug!(sequence = frame.metadata.sequence, "dropped queued buffer");
                dropped += 1;
            }
            Err(CameraError::Timeout) => break,
            Err(err) => return Err(err),
        }
    }
    Ok(dropped)
}

fn to_format(fmt: &v4l::Format) -> Format {
    Format {
        width: fmt.width,
        height: fmt.height,
        fourcc: FourCC::from(fmt.fourcc),
        stride: fmt.stride,
        size: fmt.size,
    }
}

impl CameraDevice for V4L2Device {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(|err| CameraError::StreamError(err.to_string()))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|err| CameraError::StreamError(err.to_string()))?;
        let actual = to_format(&fmt);

        // Drivers silently clamp to the nearest supported mode.
        if actual.width != format.width
            || actual.height != format.height
            || actual.fourcc != format.fourcc
        {
            return Err(CameraError::FormatNotSupported {
                requested: format.clone(),
                actual: Some(actual),
            });
        }

        self.format = Some(actual.clone());
        Ok(actual)
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<u32> {
        let params = self
            .device
            .set_params(&Parameters::with_fps(fps))
            .map_err(|_| CameraError::FrameRateNotSupported(fps))?;

        let interval = params.interval;
        if interval.numerator == 0 {
            return Err(CameraError::FrameRateNotSupported(fps));
        }
        Ok(interval.denominator / interval.numerator)
    }

    fn poll_ready(&mut self) -> Result<bool> {
        if self.format.is_none() {
            return Ok(false);
        }
        let current = self
            .device
            .format()
            .map_err(|err| CameraError::StreamError(err.to_string()))?;
        Ok(self.format.as_ref() == Some(&to_format(&current)))
    }

    fn start_stream(&mut self, buffer_count: u32) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = Stream::with_buffers(&self.device, Type::VideoCapture, buffer_count)
            .map_err(|err| CameraError::StreamError(err.to_string()))?;
        self.stream = Some(stream);
        self.primed = false;
        self.buffer_count = buffer_count;
        Ok(())
    }

    fn poll_streaming(&mut self) -> Result<bool> {
        if self.stream.is_none() {
            return Ok(false);
        }
        if self.primed {
            return Ok(true);
        }
        // The first dequeue issues STREAMON and queues every buffer.
        match self.dequeue(PRIME_POLL) {
            Ok(frame) => {
                debug!(sequence = frame.metadata.sequence, "stream primed");
                self.primed = true;
                Ok(true)
            }
            Err(CameraError::Timeout) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn applied_value(&self, control: Control, value: u32) -> u32 {
        match control {
            Control::Focus => value,
            Control::ExposureMicros => exposure_units(value) * EXPOSURE_UNIT_US,
        }
    }

    fn set_control(&mut self, control: Control, value: u32) -> Result<()> {
        let reject = |err: io::Error| CameraError::ControlRejected {
            control,
            value,
            reason: err.to_string(),
        };

        match control {
            Control::Focus => {
                if !self.manual_focus {
                    self.write_raw(V4L2_CID_FOCUS_AUTO, 0).map_err(reject)?;
                    self.manual_focus = true;
                }
                self.write_raw(V4L2_CID_FOCUS_ABSOLUTE, i64::from(value))
                    .map_err(reject)?;
            }
            Control::ExposureMicros => {
                if !self.manual_exposure {
                    self.write_raw(V4L2_CID_EXPOSURE_AUTO, V4L2_EXPOSURE_MANUAL)
                        .map_err(reject)?;
                    self.manual_exposure = true;
                }
                let units = exposure_units(value);
                self.write_raw(V4L2_CID_EXPOSURE_ABSOLUTE, i64::from(units))
                    .map_err(reject)?;
            }
        }

        if self.stream.is_some() {
            self.stale_buffers = self.buffer_count;
        }
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame> {
        while self.stale_buffers > 0 {
            let dropped = self.dequeue(timeout)?;
            debug!(sequence = dropped.metadata.sequence, "dropped pre-settle buffer");
            self.stale_buffers -= 1;
        }
        let limit = self.buffer_count;
        drain_pending(limit, |poll| self.dequeue(poll))?;
        self.dequeue(timeout)
    }

    fn stop_stream(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        self.primed = false;
        self.stale_buffers = 0;
        if let Err(err) = stream.stop() {
            warn!(%err, "VIDIOC_STREAMOFF failed");
            return Err(CameraError::StreamError(err.to_string()));
        }
        Ok(())
    }
}
