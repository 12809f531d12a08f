//! inspect-cam: open a camera, run one grouped capture pass, and reset.
//!
//! ```bash
//! inspect-cam --device /dev/video0 --region r1:305:1200 --region r2:450:5000
//! RUST_LOG=inspect_cam=debug inspect-cam --config station.toml --status
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use inspect_cam::{
    CameraConfig, CameraService, CameraStatus, CaptureRequest, DeviceClass, RegionCapture,
    RegionId, RunStatus, V4L2Driver,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Grouped inspection capture over V4L2")]
struct Args {
    /// TOML camera configuration. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device index or path, overriding the configuration.
    #[arg(long)]
    device: Option<String>,

    /// Device class: mechanically-focusable or fixed-auto-exposure.
    #[arg(long)]
    class: Option<DeviceClass>,

    /// Region to capture as ID:FOCUS:EXPOSURE_US. Repeatable.
    #[arg(long = "region", value_parser = parse_region)]
    regions: Vec<CaptureRequest>,

    /// Print camera status after each step.
    #[arg(long)]
    status: bool,
}

fn parse_region(arg: &str) -> Result<CaptureRequest, String> {
    let mut parts = arg.split(':');
    let (Some(id), Some(focus), Some(exposure), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected ID:FOCUS:EXPOSURE_US, got {arg:?}"));
    };
    if id.is_empty() {
        return Err("region id must not be empty".to_owned());
    }
    let focus = focus
        .parse::<u32>()
        .map_err(|err| format!("bad focus {focus:?}: {err}"))?;
    let exposure = exposure
        .parse::<u32>()
        .map_err(|err| format!("bad exposure {exposure:?}: {err}"))?;
    Ok(CaptureRequest::new(RegionId::new(id), focus, exposure))
}

fn print_status(status: &CameraStatus) {
    println!(
        "status: state={} class={:?} focus={:?} exposure_us={:?} running={}",
        status.state,
        status.device_class,
        status.last_properties.focus,
        status.last_properties.exposure_us,
        status.run_in_progress
    );
}

fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inspect_cam=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CameraConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CameraConfig::default(),
    };
    if let Some(device) = args.device {
        config.device_id = device;
    }
    if let Some(class) = args.class {
        config.device_class = class;
    }

    let device_id = config.device_id.clone();
    let device_class = config.device_class;
    let handle = CameraService::spawn(V4L2Driver, config).context("starting camera worker")?;

    if let Err(err) = handle.open_camera(&device_id, device_class) {
        eprintln!("open failed: {err}\n  remedy: {}", err.remedy());
        if args.status {
            print_status(&handle.status());
        }
        handle.shutdown();
        return Err(err).context(format!("opening {device_id}"));
    }
    if args.status {
        print_status(&handle.status());
    }

    info!(regions = args.regions.len(), "starting capture run");
    let report = handle.run_capture_with(args.regions, |capture: &RegionCapture<'_>| {
        println!(
            "{}: {} bytes {}x{} {} seq={} ({})",
            capture.region_id,
            capture.frame.bytes.len(),
            capture.frame.width,
            capture.frame.height,
            capture.frame.format,
            capture.frame.sequence,
            capture.key
        );
    });

    let outcome = match report {
        Ok(report) => {
            println!(
                "run: {} region(s) in {:?}, settle {:?}",
                report.outcomes.len() + report.skipped().len(),
                report.duration,
                report.settle_time()
            );
            let failed = !matches!(report.status, RunStatus::Completed);
            for (region_id, result) in report.into_results() {
                if let Err(err) = result {
                    println!("{region_id}: {err}\n  remedy: {}", err.remedy());
                }
            }
            if failed {
                Err(anyhow::anyhow!("capture run did not complete"))
            } else {
                Ok(())
            }
        }
        Err(err) => Err(anyhow::Error::new(err).context("capture run")),
    };

    if args.status {
        print_status(&handle.status());
    }
    let reset = handle.reset_camera().context("resetting camera")?;
    info!(previously_active = reset.previously_active, "camera reset before exit");
    handle.shutdown();

    outcome
}
