//! Return the camera to a known-good `Closed` state.
//!
//! This is the only recovery path: nothing in the pipeline retries or reopens
//! on its own after a fault.

use std::time::Duration;

use tracing::info;

use crate::pipeline::{PipelineController, PipelineState};
use crate::traits::CameraDriver;

/// Grace period after closing, letting the driver release the device.
pub const DEFAULT_RESET_GRACE: Duration = Duration::from_millis(500);

/// Result of a reset. Resets never fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    /// The pipeline was anything other than `Closed` before the reset.
    pub previously_active: bool,
    /// Always `Closed`.
    pub final_state: PipelineState,
}

/// Closes the pipeline, waits out teardown, and forgets confirmed settings.
#[derive(Debug, Clone, Copy)]
pub struct ResetCoordinator {
    grace: Duration,
}

impl Default for ResetCoordinator {
    fn default() -> Self {
        Self {
            grace: DEFAULT_RESET_GRACE,
        }
    }
}

impl ResetCoordinator {
    /// Coordinator with a custom teardown grace period.
    #[must_use]
    pub const fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }

    /// Reset `pipeline`. Safe to call on a pipeline that was never opened.
    pub fn reset<Dr: CameraDriver>(&self, pipeline: &mut PipelineController<Dr>) -> ResetOutcome {
        let before = pipeline.state();
        let previously_active = before != PipelineState::Closed;

        if previously_active {
            pipeline.close();
            pipeline.clock().sleep(self.grace);
        }
        pipeline.forget_properties();

        info!(from = %before, previously_active, "camera reset");
        ResetOutcome {
            previously_active,
            final_state: pipeline.state(),
        }
    }
}
