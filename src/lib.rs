//! Inspect-Cam: camera pipeline lifecycle and grouped capture scheduling for
//! visual inspection stations.
//!
//! The crate owns one camera per worker, walks it through a strict
//! open/ready/streaming lifecycle, and captures inspection regions in groups
//! that share a focus/exposure pair so each mechanical settle is paid once.
//! Hardware access sits behind the `CameraDriver`/`CameraDevice` traits, with
//! a V4L2 implementation for production and a scriptable mock for tests.

pub mod captor;
pub mod config;
pub mod device;
pub mod error;
pub mod grouping;
pub mod pipeline;
pub mod properties;
pub mod reset;
pub mod scheduler;
pub mod service;
pub mod settle;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use captor::{CapturedFrame, FrameCaptor};
pub use config::{CameraConfig, ConfigError};
pub use device::{V4L2Device, V4L2Driver};
pub use error::{CaptureError, PipelineError, ServiceError, SpawnError, ValidationFailure};
pub use grouping::{group, CaptureGroup, CaptureRequest, GroupKey, RegionId};
pub use pipeline::{CameraStatus, PipelineController, PipelineState};
pub use properties::CameraProperties;
pub use reset::{ResetCoordinator, ResetOutcome};
pub use scheduler::{CancelToken, CaptureScheduler, FrameSink, RegionCapture, RunReport, RunStatus};
pub use service::{CameraHandle, CameraService};
pub use settle::{DeviceClass, SettleDecision, SettleDelayPolicy};
pub use traits::{
    CameraDevice, CameraDriver, Clock, DeviceCapabilities, Format, FourCC, Frame, FrameMetadata,
    SystemClock,
};
pub use validation::Validity;
