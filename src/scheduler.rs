//! Grouped capture runs.
//!
//! Requests are grouped by `(focus, exposure)`; each group pays at most one
//! settle wait, then its members are captured back to back. Groups run in
//! first-seen order. The first failure aborts the run, and cancellation is
//! honoured only between groups, before the next settle starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::captor::{CapturedFrame, FrameCaptor};
use crate::config::CameraConfig;
use crate::error::CaptureError;
use crate::grouping::{group, CaptureGroup, CaptureRequest, GroupKey, RegionId};
use crate::pipeline::PipelineController;
use crate::settle::{SettleDecision, SettleDelayPolicy};
use crate::traits::CameraDriver;

/// Cooperative cancellation flag shared between a run and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation before the next group.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Withdraw a pending cancellation.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A frame handed to the region-processing side as soon as it is captured.
#[derive(Debug, Clone, Copy)]
pub struct RegionCapture<'a> {
    /// Region the frame belongs to.
    pub region_id: &'a RegionId,
    /// Properties the frame was captured under.
    pub key: GroupKey,
    /// The validated frame.
    pub frame: &'a CapturedFrame,
}

/// Receives captured frames during a run.
pub trait FrameSink {
    /// Called once per successful capture, in capture order.
    fn deliver(&mut self, capture: &RegionCapture<'_>);
}

impl<F> FrameSink for F
where
    F: FnMut(&RegionCapture<'_>),
{
    fn deliver(&mut self, capture: &RegionCapture<'_>) {
        self(capture);
    }
}

/// Settle decision taken for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSettle {
    /// Group property pair.
    pub key: GroupKey,
    /// Policy decision.
    pub decision: SettleDecision,
    /// A hardware write changed something, so the wait was actually slept.
    pub applied: bool,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// Every region was captured.
    Completed,
    /// `region_id` failed with `error`; later regions were not attempted.
    Aborted {
        /// Region whose capture failed.
        region_id: RegionId,
        /// The failure.
        error: CaptureError,
    },
    /// Cancelled before group `next_group` started.
    Cancelled {
        /// Index of the first group not started.
        next_group: usize,
    },
}

/// Everything that happened during one run.
#[derive(Debug)]
pub struct RunReport {
    /// One entry per group that reached its settle step.
    pub settles: Vec<GroupSettle>,
    /// Regions attempted, in capture order.
    pub outcomes: Vec<(RegionId, Result<CapturedFrame, CaptureError>)>,
    /// Terminal status.
    pub status: RunStatus,
    /// Time from start to finish, settle waits included.
    pub duration: Duration,
    skipped: Vec<RegionId>,
}

impl RunReport {
    /// Regions never attempted because the run stopped early.
    #[must_use]
    pub fn skipped(&self) -> &[RegionId] {
        &self.skipped
    }

    /// Total settle time actually waited.
    #[must_use]
    pub fn settle_time(&self) -> Duration {
        self.settles
            .iter()
            .filter(|s| s.applied)
            .map(|s| Duration::from_millis(u64::from(s.decision.wait_ms)))
            .sum()
    }

    /// One result per input region: attempted regions first in capture order,
    /// then skipped regions marked `Aborted` or `Cancelled`.
    #[must_use]
    pub fn into_results(self) -> Vec<(RegionId, Result<CapturedFrame, CaptureError>)> {
        let skip_error = match &self.status {
            RunStatus::Completed => None,
            RunStatus::Aborted { region_id, .. } => Some(CaptureError::Aborted(region_id.clone())),
            RunStatus::Cancelled { .. } => Some(CaptureError::Cancelled),
        };

        let mut results = self.outcomes;
        if let Some(error) = skip_error {
            results.extend(
                self.skipped
                    .into_iter()
                    .map(|region| (region, Err(error.clone()))),
            );
        }
        results
    }
}

/// Executes grouped capture runs against one pipeline.
#[derive(Debug)]
pub struct CaptureScheduler {
    policy: SettleDelayPolicy,
    captor: FrameCaptor,
    capture_timeout_ms: u32,
}

impl CaptureScheduler {
    /// Scheduler with explicit parts.
    #[must_use]
    pub const fn new(
        policy: SettleDelayPolicy,
        captor: FrameCaptor,
        capture_timeout_ms: u32,
    ) -> Self {
        Self {
            policy,
            captor,
            capture_timeout_ms,
        }
    }

    /// Scheduler configured from `config`.
    #[must_use]
    pub fn from_config(config: &CameraConfig) -> Self {
        Self::new(
            SettleDelayPolicy::with_overrides(config.settle),
            FrameCaptor::new(config.thresholds.clone()),
            config.timeouts.capture_ms,
        )
    }

    /// Run one inspection over `requests`.
    ///
    /// The pipeline must be at least `Ready`; streaming is started if needed.
    /// Never panics and never retries: the report says how far the run got.
    pub fn run<Dr: CameraDriver, S: FrameSink + ?Sized>(
        &mut self,
        pipeline: &mut PipelineController<Dr>,
        requests: &[CaptureRequest],
        cancel: &CancelToken,
        sink: &mut S,
    ) -> RunReport {
        let clock = pipeline.clock();
        let started = clock.now();
        let groups = group(requests);

        let mut report = RunReport {
            settles: Vec::with_capacity(groups.len()),
            outcomes: Vec::with_capacity(requests.len()),
            status: RunStatus::Completed,
            duration: Duration::ZERO,
            skipped: Vec::new(),
        };
        if groups.is_empty() {
            return report;
        }

        info!(regions = requests.len(), groups = groups.len(), "capture run started");
        pipeline.set_run_in_progress(true);

        if let Err(error) = ensure_streaming(pipeline) {
            abort(&mut report, &groups, 0, 0, error);
        } else {
            self.run_groups(pipeline, &groups, cancel, sink, &mut report);
        }

        pipeline.set_run_in_progress(false);
        report.duration = clock.now().saturating_duration_since(started);
        match &report.status {
            RunStatus::Completed => {
                info!(
                    captured = report.outcomes.len(),
                    duration = ?report.duration,
                    "capture run completed"
                );
            }
            RunStatus::Aborted { region_id, error } => {
                warn!(%region_id, %error, skipped = report.skipped.len(), "capture run aborted");
            }
            RunStatus::Cancelled { next_group } => {
                info!(next_group, skipped = report.skipped.len(), "capture run cancelled");
            }
        }
        report
    }

    fn run_groups<Dr: CameraDriver, S: FrameSink + ?Sized>(
        &mut self,
        pipeline: &mut PipelineController<Dr>,
        groups: &[CaptureGroup],
        cancel: &CancelToken,
        sink: &mut S,
        report: &mut RunReport,
    ) {
        let clock = pipeline.clock();

        for (index, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() {
                report.status = RunStatus::Cancelled { next_group: index };
                report.skipped = remaining(groups, index, 0);
                return;
            }

            let key = group.key;
            let (focus, exposure_us) =
                pipeline.applied_values(Some(key.focus), Some(key.exposure_us));
            let decision = self.policy.decide(
                pipeline.properties(),
                focus,
                exposure_us,
                pipeline.device_class(),
            );

            let applied = if decision.ignored_request {
                false
            } else {
                match pipeline.write_property(Some(key.focus), Some(key.exposure_us)) {
                    Ok(changed) => changed,
                    Err(err) => {
                        report.settles.push(GroupSettle {
                            key,
                            decision,
                            applied: false,
                        });
                        abort(report, groups, index, 0, err.into());
                        return;
                    }
                }
            };
            report.settles.push(GroupSettle {
                key,
                decision,
                applied,
            });

            debug!(
                group = index,
                %key,
                wait_ms = decision.wait_ms,
                applied,
                ignored = decision.ignored_request,
                "settle decided"
            );
            if applied && decision.wait_ms > 0 {
                clock.sleep(Duration::from_millis(u64::from(decision.wait_ms)));
            }

            for (member, region_id) in group.members.iter().enumerate() {
                match self.captor.capture(pipeline, self.capture_timeout_ms) {
                    Ok(frame) => {
                        sink.deliver(&RegionCapture {
                            region_id,
                            key,
                            frame: &frame,
                        });
                        report.outcomes.push((region_id.clone(), Ok(frame)));
                    }
                    Err(error) => {
                        abort(report, groups, index, member, error);
                        return;
                    }
                }
            }
        }
    }
}

/// Record `error` against member `member` of group `index` and mark every
/// later region as skipped.
fn abort(
    report: &mut RunReport,
    groups: &[CaptureGroup],
    index: usize,
    member: usize,
    error: CaptureError,
) {
    let Some(region_id) = groups
        .get(index)
        .and_then(|g| g.members.get(member))
        .cloned()
    else {
        return;
    };

    report.outcomes.push((region_id.clone(), Err(error.clone())));
    report.skipped = remaining(groups, index, member + 1);
    report.status = RunStatus::Aborted { region_id, error };
}

/// Start streaming if the pipeline is only `Ready`.
fn ensure_streaming<Dr: CameraDriver>(
    pipeline: &mut PipelineController<Dr>,
) -> Result<(), CaptureError> {
    let state = pipeline.state();
    if !state.is_at_least_ready() {
        return Err(CaptureError::NotStreaming(state));
    }
    pipeline.start_streaming()?;
    Ok(())
}

/// Regions from member `member` of group `index` onwards.
fn remaining(groups: &[CaptureGroup], index: usize, member: usize) -> Vec<RegionId> {
    groups
        .iter()
        .skip(index)
        .enumerate()
        .flat_map(|(offset, g)| {
            let from = if offset == 0 { member } else { 0 };
            g.members.iter().skip(from).cloned()
        })
        .collect()
}
