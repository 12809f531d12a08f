//! Last confirmed focus/exposure values.

/// Hardware settings known to be in effect. `None` means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraProperties {
    /// Absolute focus position.
    pub focus: Option<u32>,
    /// Exposure time in microseconds.
    pub exposure_us: Option<u32>,
}

impl CameraProperties {
    /// Nothing confirmed yet.
    pub const UNKNOWN: Self = Self {
        focus: None,
        exposure_us: None,
    };
}

/// Single source of truth for what the hardware was last told.
///
/// Updated only after the device accepted a write; readers receive copies.
#[derive(Debug, Default)]
pub struct PropertyStore {
    current: CameraProperties,
}

impl PropertyStore {
    /// Empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: CameraProperties::UNKNOWN,
        }
    }

    /// Copy of the confirmed properties.
    #[must_use]
    pub const fn snapshot(&self) -> CameraProperties {
        self.current
    }

    /// Record a focus value the device accepted.
    pub fn confirm_focus(&mut self, focus: u32) {
        self.current.focus = Some(focus);
    }

    /// Record an exposure value the device accepted.
    pub fn confirm_exposure(&mut self, exposure_us: u32) {
        self.current.exposure_us = Some(exposure_us);
    }

    /// Forget everything so the next write is never skipped.
    pub fn clear(&mut self) {
        self.current = CameraProperties::UNKNOWN;
    }
}
