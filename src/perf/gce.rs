//! GCE Persistent Disk performance model

use super::{fixed_per_gib, tunable, DrivePerformance};
use crate::error::{Error, Result};

const PD_STANDARD_IOPS_PER_GIB: f64 = 0.75;
const PD_STANDARD_MAX_IOPS: u64 = 7_500;

const PD_BALANCED_IOPS_PER_GIB: f64 = 6.0;
const PD_BALANCED_MAX_IOPS: u64 = 15_000;

const PD_SSD_IOPS_PER_GIB: f64 = 30.0;
const PD_SSD_MAX_IOPS: u64 = 60_000;

const PD_EXTREME_MIN_IOPS: u64 = 2_500;
const PD_EXTREME_IOPS_PER_GIB: u64 = 1_000;
const PD_EXTREME_MAX_IOPS: u64 = 120_000;

/// Performance a persistent disk of `drive_type` and `size_gib` delivers
/// when `requested_iops` are asked for.
pub fn compute_iops(drive_type: &str, size_gib: u64, requested_iops: u64) -> Result<DrivePerformance> {
    match drive_type {
        "pd-standard" => Ok(fixed_per_gib(
            size_gib,
            PD_STANDARD_IOPS_PER_GIB,
            1,
            PD_STANDARD_MAX_IOPS,
        )),
        "pd-balanced" => Ok(fixed_per_gib(
            size_gib,
            PD_BALANCED_IOPS_PER_GIB,
            1,
            PD_BALANCED_MAX_IOPS,
        )),
        "pd-ssd" => Ok(fixed_per_gib(
            size_gib,
            PD_SSD_IOPS_PER_GIB,
            1,
            PD_SSD_MAX_IOPS,
        )),
        "pd-extreme" => Ok(tunable(
            size_gib,
            requested_iops,
            PD_EXTREME_MIN_IOPS,
            PD_EXTREME_IOPS_PER_GIB,
            PD_EXTREME_MAX_IOPS,
        )),
        _ => Err(Error::UnsupportedDriveType {
            provider: "gce",
            drive_type: drive_type.to_string(),
        }),
    }
}
