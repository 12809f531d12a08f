//! Core traits and types for the camera hardware abstraction.

use std::time::{Duration, Instant};

use thiserror::Error;

/// Pixel format representation (e.g., YUYV, MJPG, GREY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// 8-bit greyscale, the native format of most monochrome inspection sensors.
    pub const GREY: Self = Self::new(b"GREY");

    /// Bytes per pixel for packed raw formats, `None` for compressed ones.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"YUYV" => Some(2),
            b"GREY" => Some(1),
            _ => None,
        }
    }

    /// Parse a four character code such as `"YUYV"`.
    pub fn parse(code: &str) -> Option<Self> {
        let bytes: [u8; 4] = code.as_bytes().try_into().ok()?;
        Some(Self(bytes))
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Negotiated frame geometry and pixel format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Format with stride and size derived from the pixel format.
    ///
    /// Compressed formats get a zero stride and size; the driver fills in the
    /// real buffer size when the format is applied.
    #[must_use]
    pub fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = fourcc.bytes_per_pixel().map_or(0, |bpp| width * bpp);
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A raw frame as delivered by the device.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Luma of the pixel at `(x, y)` for raw formats.
    ///
    /// YUYV stores `[Y0 U Y1 V]` per pixel pair, so luma sits on every even
    /// byte. GREY is luma only. Returns `None` out of bounds or for compressed
    /// formats.
    #[must_use]
    pub fn luma_at(&self, x: u32, y: u32, format: &Format) -> Option<u8> {
        let bpp = format.fourcc.bytes_per_pixel()?;
        if x >= format.width || y >= format.height {
            return None;
        }
        let stride = if format.stride == 0 {
            format.width * bpp
        } else {
            format.stride
        };
        let offset = (y as usize) * (stride as usize) + (x as usize) * (bpp as usize);
        self.data.get(offset).copied()
    }
}

/// Error type for device-level camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Device with given identifier was not found.
    #[error("device {0} not found")]
    DeviceNotFound(String),
    /// Failed to open device.
    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// Requested format is not supported.
    #[error("format not supported: {requested:?} (driver offered {actual:?})")]
    FormatNotSupported {
        /// What the caller asked for.
        requested: Format,
        /// What the driver negotiated instead, if anything.
        actual: Option<Format>,
    },
    /// Requested frame rate was refused.
    #[error("frame rate {0} fps not supported")]
    FrameRateNotSupported(u32),
    /// A control write was refused by the driver.
    #[error("control {control:?} rejected value {value}: {reason}")]
    ControlRejected {
        /// Control being written.
        control: Control,
        /// Rejected value.
        value: u32,
        /// Driver message.
        reason: String,
    },
    /// Error during streaming operation.
    #[error("stream error: {0}")]
    StreamError(String),
    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for device-level camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Manually adjustable hardware properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Absolute lens focus position in device units.
    Focus,
    /// Absolute exposure time in microseconds.
    ExposureMicros,
}

/// Acquires device handles by identifier.
pub trait CameraDriver: Send {
    /// The handle type returned by `open`.
    type Device: CameraDevice;

    /// Acquire the device named by `device_id` (index or `/dev/videoN` path).
    fn open(&mut self, device_id: &str) -> Result<Self::Device>;
}

/// Abstraction over an opened camera handle.
///
/// Implementations are not reentrant; callers serialize every call.
pub trait CameraDevice: Send {
    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Set the frame rate. Returns the rate the driver actually applied.
    fn set_frame_rate(&mut self, fps: u32) -> Result<u32>;

    /// Whether the device reports a configured, idle pipeline.
    fn poll_ready(&mut self) -> Result<bool>;

    /// Allocate `buffer_count` buffers and begin streaming.
    fn start_stream(&mut self, buffer_count: u32) -> Result<()>;

    /// Whether the device has confirmed that frames are flowing.
    fn poll_streaming(&mut self) -> Result<bool>;

    /// Value the hardware actually runs at when `value` is requested.
    ///
    /// Drivers that quantize a control (V4L2 exposure counts in 100 us steps)
    /// report the quantized value here.
    fn applied_value(&self, control: Control, value: u32) -> u32 {
        let _ = control;
        value
    }

    /// Write a single control value.
    fn set_control(&mut self, control: Control, value: u32) -> Result<()>;

    /// Dequeue a frame filled after this call and after the most recent
    /// control write, waiting at most `timeout`. Buffers the driver filled
    /// earlier are discarded.
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame>;

    /// Stop streaming and release buffers.
    fn stop_stream(&mut self) -> Result<()>;
}

/// Time source used for every blocking wait in the pipeline.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}
