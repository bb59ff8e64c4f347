//! Distribution planner
//!
//! Chooses a drive type, per-drive size, drive count per instance and
//! instances per zone for one storage spec against a decision matrix.
//!
//! Candidate preference order: row priority, then IOPS closeness, then the
//! largest feasible instances-per-zone, then the largest feasible drive
//! count. After a candidate is accepted, instances-per-zone shrinks to the
//! smallest value still covering the per-zone minimum so zones are not
//! over-provisioned.

use crate::error::{Error, Result};
use crate::matrix::{StorageDecisionMatrix, StorageDecisionMatrixRow};
use crate::planner::{StoragePoolSpec, StorageSpec};
use tracing::debug;

/// A plan for one storage spec plus the matrix row that produced it.
#[derive(Debug, Clone)]
pub struct CandidatePlan {
    pub pool: StoragePoolSpec,
    pub row: StorageDecisionMatrixRow,
}

/// Plan drives for `spec` spread over `zone_count` zones with at most
/// `instances_per_zone` instances per zone.
///
/// Capacity divisions round up so a successful plan always covers
/// `spec.min_capacity_gib` cluster-wide.
pub fn plan_distribution(
    matrix: &StorageDecisionMatrix,
    spec: &StorageSpec,
    instances_per_zone: u64,
    zone_count: u64,
) -> Result<CandidatePlan> {
    if zone_count == 0 {
        return Err(Error::NumOfZonesCannotBeZero);
    }
    if spec.min_capacity_gib > spec.max_capacity_gib {
        return Err(Error::Configuration(format!(
            "minCapacityGib {} exceeds maxCapacityGib {}",
            spec.min_capacity_gib, spec.max_capacity_gib
        )));
    }

    let min_per_zone = spec.min_capacity_gib.div_ceil(zone_count);
    let max_per_zone = spec.max_capacity_gib / zone_count;

    let candidates = matrix
        .filter_by_drive_type(spec.drive_type.as_deref().unwrap_or(""))
        .filter_by_iops(spec.iops)
        .sort_by_iops()
        .sort_by_priority();

    for row in &candidates.rows {
        for ipz in (1..=instances_per_zone).rev() {
            let per_node = min_per_zone.div_ceil(ipz);
            let mut last_size = 0;
            for drives in (row.instance_min_drives..=row.instance_max_drives).rev() {
                let size = per_node.div_ceil(drives);
                last_size = size;
                if row.min_size <= size && size <= row.max_size {
                    return Ok(accept(row, ipz, drives, size, min_per_zone));
                }
            }
            // The spread was too fine for this row's smallest drive: retry at
            // the row's minimum size as long as the zone maximum admits it.
            if last_size < row.min_size && row.min_size * ipz < max_per_zone {
                return Ok(accept(
                    row,
                    ipz,
                    row.instance_min_drives,
                    row.min_size,
                    min_per_zone,
                ));
            }
        }
    }

    Err(Error::NoCandidate)
}

fn accept(
    row: &StorageDecisionMatrixRow,
    instances_per_zone: u64,
    drive_count: u64,
    drive_size: u64,
    min_per_zone: u64,
) -> CandidatePlan {
    // Shrink to the smallest instance spread that still covers the zone
    // minimum.
    let mut effective = instances_per_zone;
    for candidate in 1..=instances_per_zone {
        if candidate * drive_count * drive_size >= min_per_zone {
            effective = candidate;
            break;
        }
    }

    debug!(
        drive_type = %row.drive_type,
        drive_size,
        drive_count,
        instances_per_zone = effective,
        "distribution candidate accepted"
    );

    CandidatePlan {
        pool: StoragePoolSpec {
            drive_type: row.drive_type.clone(),
            drive_capacity_gib: drive_size,
            drive_count,
            instances_per_zone: effective,
            iops: row.iops,
        },
        row: row.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::tests::row;
    use assert_matches::assert_matches;

    fn spec(iops: u64, min: u64, max: u64) -> StorageSpec {
        StorageSpec {
            iops,
            min_capacity_gib: min,
            max_capacity_gib: max,
            drive_type: None,
        }
    }

    fn banded_matrix() -> StorageDecisionMatrix {
        // Fixed-size bands in the style of premium managed disks.
        StorageDecisionMatrix::new(vec![
            row("Premium_LRS", 1100, 256, 256, 8, 0),
            row("Premium_LRS", 2300, 512, 512, 8, 0),
            row("Premium_LRS", 5000, 1024, 1024, 8, 0),
            row("Premium_LRS", 7500, 2048, 2048, 8, 0),
            row("Premium_LRS", 7500, 4095, 4095, 8, 0),
        ])
        .unwrap()
    }

    #[test]
    fn test_plan_shrinks_instance_spread() {
        // 1024 GiB over 2 zones: a 256 GiB band fits 2 instances per zone,
        // not the requested 3.
        let plan = plan_distribution(&banded_matrix(), &spec(1000, 1024, 100_000), 3, 2).unwrap();
        assert_eq!(plan.pool.drive_capacity_gib, 256);
        assert_eq!(plan.pool.drive_count, 1);
        assert_eq!(plan.pool.instances_per_zone, 2);
        assert_eq!(plan.row.iops, 1100);
    }

    #[test]
    fn test_plan_exact_zone_spread() {
        let plan = plan_distribution(&banded_matrix(), &spec(5000, 9216, 9216), 3, 3).unwrap();
        assert_eq!(plan.pool.drive_capacity_gib, 1024);
        assert_eq!(plan.pool.drive_count, 1);
        assert_eq!(plan.pool.instances_per_zone, 3);
    }

    #[test]
    fn test_plan_no_candidate_when_zone_budget_too_small() {
        // Rows rated >= 7500 start at 2048 GiB, but each zone only admits
        // 2048/3 GiB.
        let err = plan_distribution(&banded_matrix(), &spec(7500, 2048, 2048), 3, 3).unwrap_err();
        assert_matches!(err, Error::NoCandidate);
    }

    #[test]
    fn test_zero_zones_rejected() {
        let err = plan_distribution(&banded_matrix(), &spec(1000, 1024, 2048), 3, 0).unwrap_err();
        assert_matches!(err, Error::NumOfZonesCannotBeZero);
    }

    #[test]
    fn test_priority_wins_over_iops_closeness() {
        let m = StorageDecisionMatrix::new(vec![
            row("close", 1000, 1, 4096, 8, 5),
            row("preferred", 4000, 1, 4096, 8, 0),
        ])
        .unwrap();
        let plan = plan_distribution(&m, &spec(1000, 300, 3000), 1, 1).unwrap();
        assert_eq!(plan.pool.drive_type, "preferred");
    }

    #[test]
    fn test_iops_closeness_breaks_priority_ties() {
        let m = StorageDecisionMatrix::new(vec![
            row("far", 9000, 1, 4096, 8, 0),
            row("near", 1200, 1, 4096, 8, 0),
        ])
        .unwrap();
        let plan = plan_distribution(&m, &spec(1000, 300, 3000), 1, 1).unwrap();
        assert_eq!(plan.pool.drive_type, "near");
    }

    #[test]
    fn test_largest_drive_count_favoured() {
        let m = StorageDecisionMatrix::new(vec![row("gp3", 3000, 1, 4096, 4, 0)]).unwrap();
        // 400 GiB on one instance in one zone: 4 drives of 100 beat 1 of 400.
        let plan = plan_distribution(&m, &spec(3000, 400, 4000), 1, 1).unwrap();
        assert_eq!(plan.pool.drive_count, 4);
        assert_eq!(plan.pool.drive_capacity_gib, 100);
    }

    #[test]
    fn test_capacity_adequacy_with_uneven_division() {
        let m = StorageDecisionMatrix::new(vec![row("gp3", 3000, 1, 4096, 4, 0)]).unwrap();
        let s = spec(3000, 1025, 4000);
        let plan = plan_distribution(&m, &s, 2, 2).unwrap();
        let total = plan.pool.drive_capacity_gib
            * plan.pool.drive_count
            * plan.pool.instances_per_zone
            * 2;
        assert!(total >= s.min_capacity_gib, "planned {total} GiB");
    }

    #[test]
    fn test_matrix_conformance() {
        let m = banded_matrix();
        let plan = plan_distribution(&m, &spec(1000, 1024, 100_000), 3, 2).unwrap();
        assert!(plan.row.min_size <= plan.pool.drive_capacity_gib);
        assert!(plan.pool.drive_capacity_gib <= plan.row.max_size);
        assert!(plan.row.instance_min_drives <= plan.pool.drive_count);
        assert!(plan.pool.drive_count <= plan.row.instance_max_drives);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let m = banded_matrix();
        let s = spec(1000, 1024, 100_000);
        let a = plan_distribution(&m, &s, 3, 2).unwrap();
        for _ in 0..10 {
            let b = plan_distribution(&m, &s, 3, 2).unwrap();
            assert_eq!(a.pool, b.pool);
        }
    }

    #[test]
    fn test_drive_type_constraint_respected() {
        let m = StorageDecisionMatrix::new(vec![
            row("gp2", 1500, 1, 4096, 8, 0),
            row("io1", 3000, 4, 4096, 8, 1),
        ])
        .unwrap();
        let mut s = spec(1000, 100, 1000);
        s.drive_type = Some("io1".into());
        let plan = plan_distribution(&m, &s, 1, 1).unwrap();
        assert_eq!(plan.pool.drive_type, "io1");
    }
}
