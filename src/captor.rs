//! Single-frame capture with validation.
//!
//! There is no fallback frame: every failure is returned to the caller.

use std::time::SystemTime;

use tracing::{debug, warn};

use crate::config::ValidationThresholds;
use crate::error::CaptureError;
use crate::pipeline::PipelineController;
use crate::traits::{CameraDriver, FourCC};
use crate::validation::{validate_frame, Validity};

/// A validated frame ready for region processing.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// Raw payload in `format`.
    pub bytes: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: FourCC,
    /// Wall-clock time the frame was dequeued.
    pub captured_at: SystemTime,
    /// Device sequence number.
    pub sequence: u32,
    /// Mean luma, for raw formats.
    pub mean_luma: Option<f32>,
    /// Always `Valid` for frames returned by the captor.
    pub validity: Validity,
}

/// Pulls one fresh frame per call and validates it.
#[derive(Debug)]
pub struct FrameCaptor {
    thresholds: ValidationThresholds,
    /// `(stream generation, sequence)` of the last frame handed out.
    last_delivered: Option<(u64, u32)>,
}

impl FrameCaptor {
    /// Captor using `thresholds` for brightness checks.
    #[must_use]
    pub const fn new(thresholds: ValidationThresholds) -> Self {
        Self {
            thresholds,
            last_delivered: None,
        }
    }

    /// Capture one frame, waiting at most `timeout_ms`.
    ///
    /// The pipeline must be streaming and any settle wait already satisfied.
    pub fn capture<Dr: CameraDriver>(
        &mut self,
        pipeline: &mut PipelineController<Dr>,
        timeout_ms: u32,
    ) -> Result<CapturedFrame, CaptureError> {
        let frame = pipeline.next_frame(timeout_ms)?;
        let generation = pipeline.stream_generation();
        let sequence = frame.metadata.sequence;

        if let Some((last_generation, last_sequence)) = self.last_delivered {
            if last_generation == generation && sequence <= last_sequence {
                warn!(sequence, last_sequence, "device repeated a delivered frame");
                return Err(CaptureError::StaleFrame { sequence });
            }
        }

        let Some(format) = pipeline.format() else {
            return Err(CaptureError::NotStreaming(pipeline.state()));
        };

        let mean_luma = validate_frame(&frame, format, &self.thresholds).inspect_err(|err| {
            warn!(sequence, %err, "frame rejected");
        })?;

        self.last_delivered = Some((generation, sequence));
        debug!(sequence, bytes = frame.data.len(), ?mean_luma, "frame captured");

        Ok(CapturedFrame {
            width: format.width,
            height: format.height,
            format: format.fourcc,
            captured_at: SystemTime::now(),
            sequence,
            mean_luma,
            validity: Validity::Valid,
            bytes: frame.data,
        })
    }
}
