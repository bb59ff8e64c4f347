//! Per-provider IOPS/throughput models
//!
//! Pure functions mapping `(drive_type, size, requested_iops)` to what the
//! provider will actually deliver. Floors, ceilings and per-GiB multipliers
//! are table data in the provider submodules; the arithmetic lives here.
//!
//! Three family shapes cover every provider:
//! - fixed-per-GiB: IOPS scale with size, requested IOPS are ignored
//! - independently tunable: requested IOPS snap into a [floor, ceiling] band
//! - per-VPU (Oracle): performance units encoded in the drive type

pub mod aws;
pub mod azure;
pub mod gce;
pub mod oracle;

use serde::{Deserialize, Serialize};

/// Throughput delivered per provisioned IOPS, in MB/s.
pub const THROUGHPUT_PER_IOPS_MBPS: f64 = 0.00392;

/// Concrete performance a drive will deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrivePerformance {
    pub iops: u64,
    pub throughput_mbps: u64,
}

impl DrivePerformance {
    pub fn new(iops: u64) -> Self {
        Self {
            iops,
            throughput_mbps: throughput_for_iops(iops),
        }
    }
}

/// Throughput floor implied by an IOPS provision.
pub fn throughput_for_iops(iops: u64) -> u64 {
    (iops as f64 * THROUGHPUT_PER_IOPS_MBPS).ceil() as u64
}

/// A fixed-per-GiB family: `iops = clamp(ceil(size * per_gib), min, max)`.
/// Requested IOPS play no part.
pub(crate) fn fixed_per_gib(size_gib: u64, per_gib: f64, min: u64, max: u64) -> DrivePerformance {
    let scaled = (size_gib as f64 * per_gib).ceil() as u64;
    DrivePerformance::new(scaled.clamp(min, max))
}

/// An independently tunable family.
///
/// The ceiling is the lower of the per-drive limit and `size * per_gib`;
/// requested values snap into `[floor, ceiling]`, and an absent request
/// (zero) substitutes the floor.
pub(crate) fn tunable(
    size_gib: u64,
    requested: u64,
    floor: u64,
    per_gib: u64,
    per_drive_max: u64,
) -> DrivePerformance {
    let ceiling = per_drive_max.min(size_gib.saturating_mul(per_gib)).max(floor);
    let iops = if requested == 0 {
        floor
    } else {
        requested.clamp(floor, ceiling)
    };
    DrivePerformance::new(iops)
}
