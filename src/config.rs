//! Per-device configuration, loaded from TOML.
//!
//! Every field has a default so a partial file (or none at all) yields a
//! usable configuration. Values here are plain data; nothing in the pipeline
//! reads the environment or the filesystem on its own.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::settle::DeviceClass;
use crate::traits::FourCC;

/// Error raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("invalid camera configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value parsed but makes no sense.
    #[error("invalid camera configuration: {0}")]
    Invalid(String),
}

/// Bounded waits used by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Ready confirmation bound for mechanically-focusable sensors.
    pub open_mechanical_ms: u32,
    /// Ready confirmation bound for fixed auto-exposure modules.
    pub open_fixed_ms: u32,
    /// Bound on the first frame after stream start.
    pub stream_start_ms: u32,
    /// Bound on each single-frame capture.
    pub capture_ms: u32,
    /// Interval between readiness polls.
    pub ready_poll_ms: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            open_mechanical_ms: 8000,
            open_fixed_ms: 4000,
            stream_start_ms: 3000,
            capture_ms: 2000,
            ready_poll_ms: 50,
        }
    }
}

impl Timeouts {
    /// Ready confirmation bound for `class`.
    #[must_use]
    pub const fn open_for(&self, class: DeviceClass) -> Duration {
        let ms = match class {
            DeviceClass::MechanicallyFocusable => self.open_mechanical_ms,
            DeviceClass::FixedAutoExposure => self.open_fixed_ms,
        };
        Duration::from_millis(ms as u64)
    }
}

/// Brightness and structure limits for frame validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationThresholds {
    /// Frames whose mean luma falls below this are `TooDark`.
    pub min_mean_luma: f32,
    /// Frames whose mean luma rises above this are `TooBright`.
    pub max_mean_luma: f32,
    /// Sample every Nth pixel in both directions when computing mean luma.
    pub sample_step: u32,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            min_mean_luma: 8.0,
            max_mean_luma: 247.0,
            sample_step: 4,
        }
    }
}

/// Optional replacements for the mechanically-focusable settle constants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettleOverrides {
    /// Wait after any focus change.
    pub focus_change_ms: Option<u32>,
    /// Wait after an exposure-only change.
    pub exposure_change_ms: Option<u32>,
}

/// Complete configuration for one camera.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraConfig {
    /// Device index or path.
    pub device_id: String,
    /// Hardware class, selects settle rules and open timeout.
    pub device_class: DeviceClass,
    /// Capture width in pixels.
    pub width: u32,
    /// Capture height in pixels.
    pub height: u32,
    /// Requested frame rate.
    pub frame_rate: u32,
    /// Pixel format code.
    pub fourcc: String,
    /// Number of mmap buffers.
    pub buffer_count: u32,
    /// One-time wait after the device confirms Ready.
    pub stabilization_ms: u32,
    /// Grace period after closing during a reset.
    pub reset_grace_ms: u32,
    /// Bounded waits.
    pub timeouts: Timeouts,
    /// Frame validation limits.
    pub thresholds: ValidationThresholds,
    /// Settle overrides.
    pub settle: SettleOverrides,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_id: "/dev/video0".to_owned(),
            device_class: DeviceClass::MechanicallyFocusable,
            width: 1920,
            height: 1080,
            frame_rate: 30,
            fourcc: "YUYV".to_owned(),
            buffer_count: 4,
            stabilization_ms: 2000,
            reset_grace_ms: 500,
            timeouts: Timeouts::default(),
            thresholds: ValidationThresholds::default(),
            settle: SettleOverrides::default(),
        }
    }
}

impl CameraConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parsed pixel format.
    pub fn pixel_format(&self) -> Result<FourCC, ConfigError> {
        FourCC::parse(&self.fourcc)
            .ok_or_else(|| ConfigError::Invalid(format!("fourcc {:?} is not 4 bytes", self.fourcc)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.pixel_format()?;
        if self.width == 0 || self.height == 0 || self.frame_rate == 0 {
            return Err(ConfigError::Invalid(
                "width, height and frame_rate must be non-zero".to_owned(),
            ));
        }
        if self.buffer_count == 0 {
            return Err(ConfigError::Invalid("buffer_count must be at least 1".to_owned()));
        }
        if self.thresholds.min_mean_luma >= self.thresholds.max_mean_luma {
            return Err(ConfigError::Invalid(format!(
                "min_mean_luma {} must be below max_mean_luma {}",
                self.thresholds.min_mean_luma, self.thresholds.max_mean_luma
            )));
        }
        Ok(())
    }
}
