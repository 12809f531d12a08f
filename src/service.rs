//! Camera worker thread and its cloneable handle.
//!
//! One worker thread owns the `PipelineController`; callers talk to it through
//! a command queue and get replies on a per-call channel. Only one command may
//! be in flight per camera: a concurrent caller gets `ServiceError::Busy`
//! instead of waiting. Status reads never go through the queue, so they are
//! answered even while the worker sits in a settle wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::captor::CapturedFrame;
use crate::config::CameraConfig;
use crate::error::{CaptureError, PipelineError, ServiceError, SpawnError};
use crate::grouping::{CaptureRequest, RegionId};
use crate::pipeline::{CameraStatus, PipelineController, StatusBoard};
use crate::reset::{ResetCoordinator, ResetOutcome};
use crate::scheduler::{CancelToken, CaptureScheduler, FrameSink, RegionCapture, RunReport};
use crate::settle::DeviceClass;
use crate::traits::{CameraDriver, Clock, SystemClock};

type BoxedSink = Box<dyn FrameSink + Send>;

enum Command {
    Open {
        device_id: String,
        device_class: DeviceClass,
        respond_to: Sender<Result<(), PipelineError>>,
    },
    Run {
        requests: Vec<CaptureRequest>,
        sink: Option<BoxedSink>,
        respond_to: Sender<RunReport>,
    },
    Reset {
        respond_to: Sender<ResetOutcome>,
    },
    Shutdown,
}

/// Entry point for starting a camera worker.
pub struct CameraService;

impl CameraService {
    /// Start a worker for `driver` using the wall clock.
    pub fn spawn<Dr>(driver: Dr, config: CameraConfig) -> Result<CameraHandle, SpawnError>
    where
        Dr: CameraDriver + 'static,
    {
        Self::spawn_with_clock(driver, config, Arc::new(SystemClock))
    }

    /// Start a worker with an explicit time source.
    pub fn spawn_with_clock<Dr>(
        driver: Dr,
        config: CameraConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<CameraHandle, SpawnError>
    where
        Dr: CameraDriver + 'static,
    {
        let pipeline = PipelineController::new(driver, &config, clock)?;
        let status = pipeline.status_board();
        let cancel = CancelToken::new();
        let (commands, inbox) = unbounded();

        let worker = Worker {
            scheduler: CaptureScheduler::from_config(&config),
            reset: ResetCoordinator::with_grace(Duration::from_millis(u64::from(
                config.reset_grace_ms,
            ))),
            pipeline,
            config,
            cancel: cancel.clone(),
        };
        let thread = thread::Builder::new()
            .name("camera-worker".to_owned())
            .spawn(move || worker.run(&inbox))
            .map_err(SpawnError::Thread)?;

        Ok(CameraHandle {
            commands,
            busy: Arc::new(AtomicBool::new(false)),
            status,
            cancel,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }
}

/// Cloneable front end to one camera worker.
#[derive(Clone)]
pub struct CameraHandle {
    commands: Sender<Command>,
    busy: Arc<AtomicBool>,
    status: StatusBoard,
    cancel: CancelToken,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraHandle")
            .field("busy", &self.busy.load(Ordering::SeqCst))
            .field("status", &self.status.read())
            .finish_non_exhaustive()
    }
}

/// Clears the in-flight flag when the call returns.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CameraHandle {
    /// Open `device_id` as `device_class` with the configured geometry.
    pub fn open_camera(
        &self,
        device_id: &str,
        device_class: DeviceClass,
    ) -> Result<(), ServiceError> {
        let device_id = device_id.to_owned();
        self.call(|respond_to| Command::Open {
            device_id,
            device_class,
            respond_to,
        })??;
        Ok(())
    }

    /// Run one inspection and return a result for every region.
    pub fn run_capture(
        &self,
        requests: Vec<CaptureRequest>,
    ) -> Result<Vec<(RegionId, Result<CapturedFrame, CaptureError>)>, ServiceError> {
        self.run(requests, None).map(RunReport::into_results)
    }

    /// Run one inspection, handing each frame to `sink` as soon as it is
    /// captured, and return the full report.
    pub fn run_capture_with<S>(
        &self,
        requests: Vec<CaptureRequest>,
        sink: S,
    ) -> Result<RunReport, ServiceError>
    where
        S: FnMut(&RegionCapture<'_>) + Send + 'static,
    {
        self.run(requests, Some(Box::new(sink)))
    }

    /// Return the camera to `Closed` and forget its settings.
    pub fn reset_camera(&self) -> Result<ResetOutcome, ServiceError> {
        self.call(|respond_to| Command::Reset { respond_to })
    }

    /// Latest published status. Never waits on the worker.
    #[must_use]
    pub fn status(&self) -> CameraStatus {
        self.status.read()
    }

    /// Stop the current run before its next group.
    pub fn cancel_run(&self) {
        debug!("capture run cancellation requested");
        self.cancel.cancel();
    }

    /// Close the camera and stop the worker. Later calls fail with
    /// `WorkerStopped`.
    pub fn shutdown(&self) {
        // Fails only if the worker is already gone.
        let _ = self.commands.send(Command::Shutdown);
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("camera worker panicked");
            }
        }
    }

    fn run(
        &self,
        requests: Vec<CaptureRequest>,
        sink: Option<BoxedSink>,
    ) -> Result<RunReport, ServiceError> {
        let _in_flight = self.claim()?;
        self.cancel.clear();
        self.send_and_wait(|respond_to| Command::Run {
            requests,
            sink,
            respond_to,
        })
    }

    fn call<T, F>(&self, command: F) -> Result<T, ServiceError>
    where
        F: FnOnce(Sender<T>) -> Command,
    {
        let _in_flight = self.claim()?;
        self.send_and_wait(command)
    }

    fn claim(&self) -> Result<InFlight<'_>, ServiceError> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ServiceError::Busy)?;
        Ok(InFlight(&self.busy))
    }

    fn send_and_wait<T, F>(&self, command: F) -> Result<T, ServiceError>
    where
        F: FnOnce(Sender<T>) -> Command,
    {
        let (respond_to, response) = bounded(1);
        self.commands
            .send(command(respond_to))
            .map_err(|_| ServiceError::WorkerStopped)?;
        response.recv().map_err(|_| ServiceError::WorkerStopped)
    }
}

struct Worker<Dr: CameraDriver> {
    pipeline: PipelineController<Dr>,
    scheduler: CaptureScheduler,
    reset: ResetCoordinator,
    config: CameraConfig,
    cancel: CancelToken,
}

impl<Dr: CameraDriver> Worker<Dr> {
    fn run(mut self, inbox: &Receiver<Command>) {
        info!("camera worker started");
        while let Ok(command) = inbox.recv() {
            match command {
                Command::Open {
                    device_id,
                    device_class,
                    respond_to,
                } => {
                    let result = self.open(&device_id, device_class);
                    let _ = respond_to.send(result);
                }
                Command::Run {
                    requests,
                    sink,
                    respond_to,
                } => {
                    let report = match sink {
                        Some(mut sink) => self.scheduler.run(
                            &mut self.pipeline,
                            &requests,
                            &self.cancel,
                            sink.as_mut(),
                        ),
                        None => self.scheduler.run(
                            &mut self.pipeline,
                            &requests,
                            &self.cancel,
                            &mut |_: &RegionCapture<'_>| {},
                        ),
                    };
                    let _ = respond_to.send(report);
                }
                Command::Reset { respond_to } => {
                    let outcome = self.reset.reset(&mut self.pipeline);
                    let _ = respond_to.send(outcome);
                }
                Command::Shutdown => break,
            }
        }

        self.reset.reset(&mut self.pipeline);
        info!("camera worker stopped");
    }

    fn open(&mut self, device_id: &str, device_class: DeviceClass) -> Result<(), PipelineError> {
        self.pipeline.set_device_class(device_class)?;
        self.pipeline.open(
            device_id,
            self.config.width,
            self.config.height,
            self.config.frame_rate,
        )
    }
}
