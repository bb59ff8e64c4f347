//! EBS performance model

use super::{fixed_per_gib, tunable, DrivePerformance};
use crate::error::{Error, Result};

const GP2_IOPS_PER_GIB: f64 = 3.0;
const GP2_MIN_IOPS: u64 = 100;
const GP2_MAX_IOPS: u64 = 16_000;

const GP3_BASELINE_IOPS: u64 = 3_000;
const GP3_IOPS_PER_GIB: u64 = 500;
const GP3_MAX_IOPS: u64 = 16_000;

const IO1_MIN_IOPS: u64 = 100;
const IO1_IOPS_PER_GIB: u64 = 50;
const IO1_MAX_IOPS: u64 = 64_000;

const IO2_MIN_IOPS: u64 = 100;
const IO2_IOPS_PER_GIB: u64 = 500;
const IO2_MAX_IOPS: u64 = 64_000;

const MAGNETIC_IOPS: u64 = 100;

/// Performance an EBS volume of `drive_type` and `size_gib` delivers when
/// `requested_iops` are asked for.
pub fn compute_iops(drive_type: &str, size_gib: u64, requested_iops: u64) -> Result<DrivePerformance> {
    match drive_type {
        "gp2" => Ok(fixed_per_gib(size_gib, GP2_IOPS_PER_GIB, GP2_MIN_IOPS, GP2_MAX_IOPS)),
        "gp3" => Ok(tunable(
            size_gib,
            requested_iops,
            GP3_BASELINE_IOPS,
            GP3_IOPS_PER_GIB,
            GP3_MAX_IOPS,
        )),
        "io1" => Ok(tunable(
            size_gib,
            requested_iops,
            IO1_MIN_IOPS,
            IO1_IOPS_PER_GIB,
            IO1_MAX_IOPS,
        )),
        "io2" => Ok(tunable(
            size_gib,
            requested_iops,
            IO2_MIN_IOPS,
            IO2_IOPS_PER_GIB,
            IO2_MAX_IOPS,
        )),
        "standard" => Ok(DrivePerformance::new(MAGNETIC_IOPS)),
        _ => Err(Error::UnsupportedDriveType {
            provider: "aws",
            drive_type: drive_type.to_string(),
        }),
    }
}
