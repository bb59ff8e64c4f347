//! Oracle Block Volume performance model
//!
//! Performance is bought in volume performance units (VPUs) encoded in the
//! canonical drive type `pv-<vpus>`: `iops = min(size * iops_per_gib(vpu),
//! max_iops(vpu))`.

use super::DrivePerformance;
use crate::error::{Error, Result};

/// (vpus, IOPS per GiB, per-volume IOPS cap).
const VPU_TABLE: &[(u32, u64, u64)] = &[
    (0, 2, 3_000),
    (10, 60, 25_000),
    (20, 75, 50_000),
    (30, 90, 75_000),
    (40, 105, 100_000),
    (50, 120, 125_000),
    (60, 135, 150_000),
    (70, 150, 175_000),
    (80, 165, 200_000),
    (90, 180, 225_000),
    (100, 195, 250_000),
    (110, 210, 275_000),
    (120, 225, 300_000),
];

/// Parse the canonical `pv-<vpus>` drive type.
pub fn parse_vpus(drive_type: &str) -> Option<u32> {
    drive_type.strip_prefix("pv-")?.parse().ok()
}

/// Performance a block volume of `drive_type` and `size_gib` delivers.
/// Requested IOPS play no part; VPUs fully determine the curve.
pub fn compute_iops(drive_type: &str, size_gib: u64, _requested_iops: u64) -> Result<DrivePerformance> {
    let vpus = parse_vpus(drive_type).ok_or_else(|| Error::UnsupportedDriveType {
        provider: "oracle",
        drive_type: drive_type.to_string(),
    })?;
    let (_, per_gib, max) = VPU_TABLE
        .iter()
        .find(|(v, _, _)| *v == vpus)
        .ok_or_else(|| Error::UnsupportedDriveType {
            provider: "oracle",
            drive_type: drive_type.to_string(),
        })?;
    Ok(DrivePerformance::new(size_gib.saturating_mul(*per_gib).min(*max)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_vpus() {
        assert_eq!(parse_vpus("pv-20"), Some(20));
        assert_eq!(parse_vpus("pv-0"), Some(0));
        assert_eq!(parse_vpus("20_vpus"), None);
        assert_eq!(parse_vpus("pv-"), None);
    }

    #[test]
    fn test_balanced_and_higher_performance() {
        assert_eq!(compute_iops("pv-10", 100, 0).unwrap().iops, 6_000);
        assert_eq!(compute_iops("pv-20", 512, 0).unwrap().iops, 38_400);
        // Per-volume cap
        assert_eq!(compute_iops("pv-20", 10_000, 0).unwrap().iops, 50_000);
    }

    #[test]
    fn test_unknown_vpu_level() {
        assert_matches!(
            compute_iops("pv-15", 100, 0),
            Err(Error::UnsupportedDriveType { provider: "oracle", .. })
        );
        assert_matches!(
            compute_iops("balanced", 100, 0),
            Err(Error::UnsupportedDriveType { .. })
        );
    }
}
