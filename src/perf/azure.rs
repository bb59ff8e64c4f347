//! Azure Managed Disk performance model
//!
//! Premium, StandardSSD and Standard disks deliver a fixed IOPS figure per
//! size band; UltraSSD and PremiumV2 are independently tunable.

use super::{tunable, DrivePerformance};
use crate::error::{Error, Result};

/// Premium SSD bands: (size cap GiB, delivered IOPS). P4 through P80.
const PREMIUM_BANDS: &[(u64, u64)] = &[
    (32, 120),
    (64, 240),
    (128, 500),
    (256, 1_100),
    (512, 2_300),
    (1_024, 5_000),
    (2_048, 7_500),
    (4_095, 7_500),
    (8_192, 16_000),
    (16_384, 18_000),
    (32_767, 20_000),
];

/// Standard SSD bands: (size cap GiB, delivered IOPS). E4 through E80.
const STANDARD_SSD_BANDS: &[(u64, u64)] = &[
    (32, 120),
    (64, 240),
    (128, 500),
    (512, 500),
    (1_024, 500),
    (4_095, 500),
    (8_192, 2_000),
    (16_384, 4_000),
    (32_767, 6_000),
];

/// Standard HDD bands: (size cap GiB, delivered IOPS). S4 through S80.
const STANDARD_BANDS: &[(u64, u64)] = &[(4_095, 500), (8_192, 1_300), (32_767, 2_000)];

const ULTRA_MIN_IOPS: u64 = 100;
const ULTRA_IOPS_PER_GIB: u64 = 300;
const ULTRA_MAX_IOPS: u64 = 160_000;

const PREMIUM_V2_MIN_IOPS: u64 = 3_000;
const PREMIUM_V2_IOPS_PER_GIB: u64 = 500;
const PREMIUM_V2_MAX_IOPS: u64 = 80_000;

fn band_lookup(bands: &[(u64, u64)], size_gib: u64) -> Option<u64> {
    bands
        .iter()
        .find(|(cap, _)| size_gib <= *cap)
        .map(|(_, iops)| *iops)
}

/// Performance a managed disk of `drive_type` and `size_gib` delivers when
/// `requested_iops` are asked for.
pub fn compute_iops(drive_type: &str, size_gib: u64, requested_iops: u64) -> Result<DrivePerformance> {
    let banded = |bands| {
        band_lookup(bands, size_gib)
            .map(DrivePerformance::new)
            .ok_or(Error::VolInval {
                reason: format!("{size_gib} GiB exceeds the largest {drive_type} disk"),
            })
    };
    match drive_type {
        "Premium_LRS" | "Premium_ZRS" => banded(PREMIUM_BANDS),
        "StandardSSD_LRS" | "StandardSSD_ZRS" => banded(STANDARD_SSD_BANDS),
        "Standard_LRS" => banded(STANDARD_BANDS),
        "UltraSSD_LRS" => Ok(tunable(
            size_gib,
            requested_iops,
            ULTRA_MIN_IOPS,
            ULTRA_IOPS_PER_GIB,
            ULTRA_MAX_IOPS,
        )),
        "PremiumV2_LRS" => Ok(tunable(
            size_gib,
            requested_iops,
            PREMIUM_V2_MIN_IOPS,
            PREMIUM_V2_IOPS_PER_GIB,
            PREMIUM_V2_MAX_IOPS,
        )),
        _ => Err(Error::UnsupportedDriveType {
            provider: "azure",
            drive_type: drive_type.to_string(),
        }),
    }
}
