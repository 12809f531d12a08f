//! Partition capture requests by `(focus, exposure)` so each settle is paid
//! once per group rather than once per region.

use std::collections::HashMap;
use std::fmt;

/// Identifier of an inspection region, assigned by the ROI collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub String);

impl RegionId {
    /// Wrap an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Property pair shared by every member of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    /// Absolute focus position.
    pub focus: u32,
    /// Exposure time in microseconds.
    pub exposure_us: u32,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "focus={} exposure={}us", self.focus, self.exposure_us)
    }
}

/// One region to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    region_id: RegionId,
    focus: u32,
    exposure_us: u32,
}

impl CaptureRequest {
    /// Build a request.
    #[must_use]
    pub const fn new(region_id: RegionId, focus: u32, exposure_us: u32) -> Self {
        Self {
            region_id,
            focus,
            exposure_us,
        }
    }

    /// Region identifier.
    #[must_use]
    pub const fn region_id(&self) -> &RegionId {
        &self.region_id
    }

    /// Requested focus.
    #[must_use]
    pub const fn focus(&self) -> u32 {
        self.focus
    }

    /// Requested exposure in microseconds.
    #[must_use]
    pub const fn exposure_us(&self) -> u32 {
        self.exposure_us
    }

    /// Grouping key of this request.
    #[must_use]
    pub const fn key(&self) -> GroupKey {
        GroupKey {
            focus: self.focus,
            exposure_us: self.exposure_us,
        }
    }
}

/// Regions sharing one `(focus, exposure)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureGroup {
    /// Shared property pair.
    pub key: GroupKey,
    /// Members in original request order.
    pub members: Vec<RegionId>,
    /// Position of this group in the run.
    pub order_index: usize,
}

/// Group `requests` by key in first-seen key order.
///
/// Every request lands in exactly one group; members keep their input order.
#[must_use]
pub fn group(requests: &[CaptureRequest]) -> Vec<CaptureGroup> {
    let mut groups: Vec<CaptureGroup> = Vec::new();
    let mut index: HashMap<GroupKey, usize> = HashMap::new();

    for request in requests {
        let key = request.key();
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(CaptureGroup {
                key,
                members: Vec::new(),
                order_index: groups.len(),
            });
            groups.len() - 1
        });
        if let Some(group) = groups.get_mut(slot) {
            group.members.push(request.region_id.clone());
        }
    }

    groups
}
