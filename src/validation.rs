//! Frame validation.
//!
//! A frame is accepted only if it is non-empty, structurally consistent with
//! the negotiated format, and its mean luma sits inside the configured band.
//! Compressed (MJPEG) frames get the structural check only; their brightness
//! is left to the remote inspection server.

use crate::config::ValidationThresholds;
use crate::error::{CaptureError, ValidationFailure};
use crate::traits::{Format, FourCC, Frame};

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
/// Drivers pad MJPEG buffers; look for EOI within this many trailing bytes.
const JPEG_EOI_WINDOW: usize = 4096;

/// Coarse classification of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Usable.
    Valid,
    /// Mean luma under the minimum.
    TooDark,
    /// Mean luma over the maximum.
    TooBright,
    /// No payload.
    Empty,
    /// Payload inconsistent with the format.
    Malformed,
}

impl CaptureError {
    /// Frame classification for failures caused by frame content.
    #[must_use]
    pub const fn validity(&self) -> Option<Validity> {
        match self {
            Self::EmptyFrame => Some(Validity::Empty),
            Self::ValidationFailed(ValidationFailure::TooDark { .. }) => Some(Validity::TooDark),
            Self::ValidationFailed(ValidationFailure::TooBright { .. }) => {
                Some(Validity::TooBright)
            }
            Self::ValidationFailed(ValidationFailure::Malformed(_)) => Some(Validity::Malformed),
            _ => None,
        }
    }
}

/// Validate `frame` against `format` and `thresholds`.
///
/// Returns the measured mean luma for raw formats.
pub fn validate_frame(
    frame: &Frame,
    format: &Format,
    thresholds: &ValidationThresholds,
) -> Result<Option<f32>, CaptureError> {
    if frame.data.is_empty() || format.width == 0 || format.height == 0 {
        return Err(CaptureError::EmptyFrame);
    }

    check_structure(frame, format)
        .map_err(|reason| CaptureError::ValidationFailed(ValidationFailure::Malformed(reason)))?;

    let Some(mean) = mean_luma(frame, format, thresholds.sample_step) else {
        return Ok(None);
    };

    if mean < thresholds.min_mean_luma {
        return Err(CaptureError::ValidationFailed(ValidationFailure::TooDark {
            mean,
            min: thresholds.min_mean_luma,
        }));
    }
    if mean > thresholds.max_mean_luma {
        return Err(CaptureError::ValidationFailed(ValidationFailure::TooBright {
            mean,
            max: thresholds.max_mean_luma,
        }));
    }

    Ok(Some(mean))
}

/// Mean luma over a grid sampled every `step` pixels, `None` for compressed
/// formats.
pub fn mean_luma(frame: &Frame, format: &Format, step: u32) -> Option<f32> {
    format.fourcc.bytes_per_pixel()?;
    let step = step.max(1) as usize;

    let mut sum: u64 = 0;
    let mut count: u64 = 0;
    for y in (0..format.height).step_by(step) {
        for x in (0..format.width).step_by(step) {
            if let Some(luma) = frame.luma_at(x, y, format) {
                sum += u64::from(luma);
                count += 1;
            }
        }
    }

    if count == 0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let mean = sum as f32 / count as f32;
    Some(mean)
}

/// Check that the payload is consistent with the negotiated format.
fn check_structure(frame: &Frame, format: &Format) -> Result<(), String> {
    if let Some(bpp) = format.fourcc.bytes_per_pixel() {
        let stride = if format.stride == 0 {
            format.width * bpp
        } else {
            format.stride
        };
        let expected = (stride as usize) * (format.height as usize);
        if frame.data.len() < expected {
            return Err(format!(
                "{} bytes for {}x{} {}, expected at least {expected}",
                frame.data.len(),
                format.width,
                format.height,
                format.fourcc
            ));
        }
        return Ok(());
    }

    if format.fourcc == FourCC::MJPG {
        if !frame.data.starts_with(&JPEG_SOI) {
            return Err("MJPEG frame missing start-of-image marker".to_owned());
        }
        let tail_start = frame.data.len().saturating_sub(JPEG_EOI_WINDOW);
        let tail = frame.data.get(tail_start..).unwrap_or_default();
        if !tail.windows(2).any(|pair| pair == JPEG_EOI) {
            return Err("MJPEG frame truncated (no end-of-image marker)".to_owned());
        }
        return Ok(());
    }

    Err(format!("unsupported pixel format {}", format.fourcc))
}
