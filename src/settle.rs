//! Settle delay policy.
//!
//! After focus or exposure changes, a mechanically-focusable lens needs time
//! before a frame reflects the new setting. The wait is a fixed conservative
//! value: it does not shrink for small focus deltas, and exposure-only
//! changes pay the same price as focus changes unless overridden.

use serde::Deserialize;

use crate::config::SettleOverrides;
use crate::properties::CameraProperties;

/// Settle after any property change on a mechanically-focusable sensor.
pub const MECHANICAL_SETTLE_MS: u32 = 3000;

/// Hardware classes with distinct settle behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    /// Industrial sensor with a motorised lens and manual exposure.
    MechanicallyFocusable,
    /// Sensor module running its own auto-exposure/auto-focus; manual
    /// values are accepted but never applied.
    FixedAutoExposure,
}

impl DeviceClass {
    /// Whether focus/exposure requests reach the hardware.
    #[must_use]
    pub const fn accepts_manual_control(self) -> bool {
        matches!(self, Self::MechanicallyFocusable)
    }
}

impl std::str::FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mechanically-focusable" | "mechanical" => Ok(Self::MechanicallyFocusable),
            "fixed-auto-exposure" | "fixed" => Ok(Self::FixedAutoExposure),
            other => Err(format!(
                "unknown device class {other:?} (use mechanically-focusable or fixed-auto-exposure)"
            )),
        }
    }
}

/// Outcome of comparing the confirmed properties against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDecision {
    /// Milliseconds to wait after the hardware write.
    pub wait_ms: u32,
    /// Requested focus differs from the confirmed one.
    pub changed_focus: bool,
    /// Requested exposure differs from the confirmed one.
    pub changed_exposure: bool,
    /// The device class does not take manual values; nothing will be written.
    pub ignored_request: bool,
}

impl SettleDecision {
    /// Whether any requested value differs from the confirmed one.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.changed_focus || self.changed_exposure
    }
}

/// Decides how long to wait after a property change.
#[derive(Debug, Clone, Copy)]
pub struct SettleDelayPolicy {
    focus_change_ms: u32,
    exposure_change_ms: u32,
}

impl Default for SettleDelayPolicy {
    fn default() -> Self {
        Self {
            focus_change_ms: MECHANICAL_SETTLE_MS,
            exposure_change_ms: MECHANICAL_SETTLE_MS,
        }
    }
}

impl SettleDelayPolicy {
    /// Policy with configured overrides applied over the defaults.
    #[must_use]
    pub fn with_overrides(overrides: SettleOverrides) -> Self {
        Self {
            focus_change_ms: overrides.focus_change_ms.unwrap_or(MECHANICAL_SETTLE_MS),
            exposure_change_ms: overrides.exposure_change_ms.unwrap_or(MECHANICAL_SETTLE_MS),
        }
    }

    /// Compare `old` against the requested values for `device_class`.
    ///
    /// A `None` request leaves that property alone and never counts as a
    /// change. An unknown confirmed value counts as a change for any request.
    #[must_use]
    pub const fn decide(
        &self,
        old: CameraProperties,
        new_focus: Option<u32>,
        new_exposure: Option<u32>,
        device_class: DeviceClass,
    ) -> SettleDecision {
        let changed_focus = differs(old.focus, new_focus);
        let changed_exposure = differs(old.exposure_us, new_exposure);

        match device_class {
            DeviceClass::FixedAutoExposure => SettleDecision {
                wait_ms: 0,
                changed_focus,
                changed_exposure,
                ignored_request: new_focus.is_some() || new_exposure.is_some(),
            },
            DeviceClass::MechanicallyFocusable => {
                let wait_ms = if changed_focus {
                    self.focus_change_ms
                } else if changed_exposure {
                    self.exposure_change_ms
                } else {
                    0
                };
                SettleDecision {
                    wait_ms,
                    changed_focus,
                    changed_exposure,
                    ignored_request: false,
                }
            }
        }
    }
}

const fn differs(confirmed: Option<u32>, requested: Option<u32>) -> bool {
    match (confirmed, requested) {
        (_, None) => false,
        (Some(old), Some(new)) => old != new,
        (None, Some(_)) => true,
    }
}
