//! Integration tests using the vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded (`sudo modprobe vivid n_devs=2`)
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! vivid exposes no focus or exposure controls, so pipeline runs use the
//! fixed auto-exposure class. Tests fail if vivid is not available.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use inspect_cam::{
    CameraConfig, CameraDevice, CancelToken, CaptureError, CaptureRequest, CaptureScheduler,
    CameraService, DeviceClass, FrameCaptor, PipelineController, PipelineError, PipelineState,
    RegionCapture, RegionId, ResetCoordinator, RunStatus, SystemClock, V4L2Device, V4L2Driver,
    Validity,
};
use serial_test::serial;

/// Find all vivid nodes, checking the sysfs driver name before opening so
/// real cameras are never touched.
fn find_vivid_devices() -> Vec<String> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let mut devices = Vec::new();
    for index in 0..10 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };

        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        let id = index.to_string();
        if V4L2Device::open(&id).is_ok() {
            devices.push(id);
        }
    }
    devices
}

/// Fail, rather than skip, when vivid is missing so CI notices.
macro_rules! require_vivid {
    () => {
        match find_vivid_devices().into_iter().next() {
            Some(id) => id,
            None => {
                panic!(
                    "vivid virtual camera not available.\n\
                     Load vivid with: sudo modprobe vivid n_devs=2\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

fn vivid_config(device_id: &str) -> CameraConfig {
    CameraConfig {
        device_id: device_id.to_owned(),
        device_class: DeviceClass::FixedAutoExposure,
        width: 640,
        height: 480,
        stabilization_ms: 100,
        reset_grace_ms: 50,
        ..CameraConfig::default()
    }
}

fn pipeline(config: &CameraConfig) -> PipelineController<V4L2Driver> {
    PipelineController::new(V4L2Driver, config, Arc::new(SystemClock)).expect("valid config")
}

fn request(id: &str) -> CaptureRequest {
    CaptureRequest::new(RegionId::new(id), 305, 1200)
}

#[test]
#[serial]
fn test_vivid_device_open() {
    let device_id = require_vivid!();

    let device = V4L2Device::open(&device_id).expect("Failed to open vivid device");
    let caps = device.capabilities();

    assert!(caps.driver.contains("vivid"), "Expected vivid driver");
    assert!(caps.can_capture, "vivid should support capture");
    assert!(caps.can_stream, "vivid should support streaming");
}

#[test]
#[serial]
fn test_vivid_pipeline_lifecycle() {
    let device_id = require_vivid!();
    let config = vivid_config(&device_id);
    let mut pipeline = pipeline(&config);

    pipeline
        .open(&device_id, config.width, config.height, config.frame_rate)
        .expect("open");
    assert_eq!(pipeline.state(), PipelineState::Ready);
    assert_eq!(pipeline.format().map(|f| (f.width, f.height)), Some((640, 480)));

    pipeline.start_streaming().expect("stream");
    assert_eq!(pipeline.state(), PipelineState::Streaming);

    pipeline.close();
    assert_eq!(pipeline.state(), PipelineState::Closed);
}

#[test]
#[serial]
fn test_vivid_capture_validated_frame() {
    let device_id = require_vivid!();
    let config = vivid_config(&device_id);
    let mut pipeline = pipeline(&config);
    pipeline
        .open(&device_id, config.width, config.height, config.frame_rate)
        .expect("open");
    pipeline.start_streaming().expect("stream");

    let mut captor = FrameCaptor::new(config.thresholds.clone());
    let first = captor
        .capture(&mut pipeline, config.timeouts.capture_ms)
        .expect("first capture");
    let second = captor
        .capture(&mut pipeline, config.timeouts.capture_ms)
        .expect("second capture");

    assert_eq!((first.width, first.height), (640, 480));
    assert_eq!(first.validity, Validity::Valid);
    assert!(first.bytes.len() >= 640 * 480 * 2);
    assert!(second.sequence > first.sequence, "frames must be fresh");
    pipeline.close();
}

#[test]
#[serial]
fn test_vivid_capture_after_idle_skips_queued_buffers() {
    let device_id = require_vivid!();
    let config = vivid_config(&device_id);
    let mut pipeline = pipeline(&config);
    pipeline
        .open(&device_id, config.width, config.height, config.frame_rate)
        .expect("open");
    pipeline.start_streaming().expect("stream");

    let mut captor = FrameCaptor::new(config.thresholds.clone());
    let before = captor
        .capture(&mut pipeline, config.timeouts.capture_ms)
        .expect("capture before idle");
    // Every buffer fills while nobody reads.
    std::thread::sleep(Duration::from_millis(500));
    let after = captor
        .capture(&mut pipeline, config.timeouts.capture_ms)
        .expect("capture after idle");

    assert!(
        after.sequence > before.sequence + 1,
        "got queued frame {} right after {}",
        after.sequence,
        before.sequence
    );
    pipeline.close();
}

#[test]
#[serial]
fn test_vivid_missing_device() {
    let config = vivid_config("/dev/video99");
    let mut pipeline = pipeline(&config);

    let err = pipeline
        .open("/dev/video99", 640, 480, 30)
        .expect_err("no such node");
    assert!(matches!(err, PipelineError::DeviceNotFound { .. }));
    assert_eq!(pipeline.state(), PipelineState::Faulted);

    let outcome = ResetCoordinator::default().reset(&mut pipeline);
    assert!(outcome.previously_active);
    assert_eq!(pipeline.state(), PipelineState::Closed);
}

#[test]
#[serial]
fn test_vivid_grouped_run() {
    let device_id = require_vivid!();
    let config = vivid_config(&device_id);
    let mut pipeline = pipeline(&config);
    pipeline
        .open(&device_id, config.width, config.height, config.frame_rate)
        .expect("open");

    let requests = [request("a"), request("b"), request("c")];
    let mut delivered = 0;
    let report = CaptureScheduler::from_config(&config).run(
        &mut pipeline,
        &requests,
        &CancelToken::new(),
        &mut |_: &RegionCapture<'_>| delivered += 1,
    );

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(delivered, 3);
    assert!(report.settles.iter().all(|s| s.decision.ignored_request));
    pipeline.close();
}

#[test]
#[serial]
fn test_vivid_service_reset_and_reopen() {
    let device_id = require_vivid!();
    let handle = CameraService::spawn(V4L2Driver, vivid_config(&device_id)).expect("spawn");

    handle
        .open_camera(&device_id, DeviceClass::FixedAutoExposure)
        .expect("open");
    let results = handle
        .run_capture(vec![request("a"), request("b")])
        .expect("run");
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    let outcome = handle.reset_camera().expect("reset");
    assert!(outcome.previously_active);
    assert_eq!(handle.status().state, PipelineState::Closed);

    handle
        .open_camera(&device_id, DeviceClass::FixedAutoExposure)
        .expect("reopen after reset");
    let results = handle.run_capture(vec![request("c")]).expect("run");
    assert!(
        results.iter().all(|(_, r)| !matches!(r, Err(CaptureError::Timeout { .. }))),
        "capture after reset should not time out"
    );
    handle.shutdown();
}
