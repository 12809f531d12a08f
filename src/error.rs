//! Typed failures surfaced by the pipeline, the captor, and the service.
//!
//! Each variant maps to a distinct operator-facing remedy via `remedy()`.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::grouping::RegionId;
use crate::pipeline::PipelineState;
use crate::traits::Format;

/// Lifecycle failures from `PipelineController`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The hardware handle could not be acquired.
    #[error("camera {device_id} not found: {reason}")]
    DeviceNotFound {
        /// Identifier the caller asked for.
        device_id: String,
        /// Driver message.
        reason: String,
    },
    /// The device rejected the requested geometry or frame rate.
    #[error("camera rejected {requested:?} @ {frame_rate} fps: {reason}")]
    FormatUnsupported {
        /// Requested format.
        requested: Format,
        /// Requested frame rate.
        frame_rate: u32,
        /// Driver message.
        reason: String,
    },
    /// The operation needs at least `Ready`.
    #[error("camera not ready (state {0})")]
    NotReady(PipelineState),
    /// The device never confirmed `Ready` after open.
    #[error("camera did not report ready within {0:?}")]
    OpenTimeout(Duration),
    /// The device never confirmed streaming.
    #[error("camera did not start streaming within {0:?}")]
    StreamStartTimeout(Duration),
    /// A hardware call failed.
    #[error("camera hardware fault: {0}")]
    HardwareFault(String),
    /// The pipeline is faulted and must be closed first.
    #[error("camera is faulted; reset it before further use")]
    Faulted,
    /// `open` was called on a pipeline that is not closed.
    #[error("camera already open (state {0})")]
    AlreadyOpen(PipelineState),
}

impl PipelineError {
    /// Suggested operator action.
    #[must_use]
    pub const fn remedy(&self) -> &'static str {
        match self {
            Self::DeviceNotFound { .. } => {
                "Check that the camera is plugged in and the device id is correct."
            }
            Self::FormatUnsupported { .. } => {
                "Choose a resolution and frame rate the camera supports."
            }
            Self::NotReady(PipelineState::Faulted) | Self::Faulted => {
                "Reset the camera to recover from the previous fault."
            }
            Self::NotReady(_) => "Open the camera before capturing or changing settings.",
            Self::OpenTimeout(_) => "Power-cycle the camera and reset before reopening.",
            Self::StreamStartTimeout(_) => {
                "Check the cable and bandwidth, then reset and reopen the camera."
            }
            Self::HardwareFault(_) => "Reset the camera; replace the cable if it recurs.",
            Self::AlreadyOpen(_) => "Reset the camera before opening it again.",
        }
    }
}

/// Why a frame that did arrive was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationFailure {
    /// Mean luma below the configured minimum.
    #[error("frame too dark (mean luma {mean:.1} < {min:.1})")]
    TooDark {
        /// Measured mean luma.
        mean: f32,
        /// Configured minimum.
        min: f32,
    },
    /// Mean luma above the configured maximum.
    #[error("frame too bright (mean luma {mean:.1} > {max:.1})")]
    TooBright {
        /// Measured mean luma.
        mean: f32,
        /// Configured maximum.
        max: f32,
    },
    /// Structure does not match the negotiated format.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Failures of a single capture attempt, or of the run it belonged to.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptureError {
    /// No frame arrived in time.
    #[error("no frame within {timeout_ms} ms")]
    Timeout {
        /// Bound that elapsed.
        timeout_ms: u32,
    },
    /// A frame arrived with no payload.
    #[error("camera delivered an empty frame")]
    EmptyFrame,
    /// A frame arrived but failed checks.
    #[error("frame validation failed: {0}")]
    ValidationFailed(ValidationFailure),
    /// The device repeated a frame already delivered.
    #[error("stale frame (sequence {sequence} already delivered)")]
    StaleFrame {
        /// Repeated sequence number.
        sequence: u32,
    },
    /// Capture was requested outside `Streaming`.
    #[error("camera not streaming (state {0})")]
    NotStreaming(PipelineState),
    /// The stream failed at the I/O level.
    #[error("camera stream failed: {0}")]
    Hardware(String),
    /// A lifecycle step failed during the run.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// Not attempted because an earlier region failed.
    #[error("run aborted after region {0} failed")]
    Aborted(RegionId),
    /// Not attempted because the run was cancelled.
    #[error("run cancelled")]
    Cancelled,
}

impl CaptureError {
    /// Suggested operator action.
    #[must_use]
    pub const fn remedy(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "Check the physical camera connection, then reset the camera.",
            Self::EmptyFrame => "Retry the capture; reset the camera if empty frames persist.",
            Self::ValidationFailed(ValidationFailure::TooDark { .. }) => {
                "Check exposure and lighting: the image is too dark."
            }
            Self::ValidationFailed(ValidationFailure::TooBright { .. }) => {
                "Reduce exposure or lighting: the image is saturated."
            }
            Self::ValidationFailed(ValidationFailure::Malformed(_)) => {
                "Check the pixel format configuration and the cable."
            }
            Self::StaleFrame { .. } => "Retry the capture group.",
            Self::NotStreaming(_) => "Open the camera before running an inspection.",
            Self::Hardware(_) => "Reset the camera; it may have been disconnected.",
            Self::Pipeline(err) => err.remedy(),
            Self::Aborted(_) => "Fix the earlier failure and run the inspection again.",
            Self::Cancelled => "Run the inspection again when ready.",
        }
    }

    /// Whether retrying the same group without a reset is reasonable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::EmptyFrame
                | Self::ValidationFailed(_)
                | Self::StaleFrame { .. }
        )
    }
}

/// Failures of the command channel in front of the camera.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Another command is already executing on this camera.
    #[error("camera busy with another command")]
    Busy,
    /// The worker thread is gone.
    #[error("camera worker stopped")]
    WorkerStopped,
    /// The command reached the camera and failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Failures starting a camera worker.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The configuration was rejected before any thread started.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The OS refused to start the worker thread.
    #[error("cannot start camera worker thread: {0}")]
    Thread(#[source] std::io::Error),
}

impl ServiceError {
    /// Suggested operator action.
    #[must_use]
    pub const fn remedy(&self) -> &'static str {
        match self {
            Self::Busy => "Wait for the current camera command to finish.",
            Self::WorkerStopped => "Restart the inspection service.",
            Self::Pipeline(err) => err.remedy(),
        }
    }
}
