//! Update planner
//!
//! Given the current per-instance drive layout and a desired capacity,
//! decides between resizing the existing drives and adding new ones, and
//! returns the target layout.

use crate::error::{Error, Result};
use crate::matrix::StorageDecisionMatrix;
use crate::planner::distribution::CandidatePlan;
use crate::planner::{ResizeOperation, StoragePoolSpec, StoragePoolUpdateRequest};
use tracing::debug;

/// A chosen update plan: the target pool layout and the operation that
/// produces it.
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    pub resize_op: ResizeOperation,
    pub candidate: CandidatePlan,
}

/// Validate the update guards shared by every strategy and return the
/// current per-instance capacity.
pub fn validate_update(request: &StoragePoolUpdateRequest) -> Result<u64> {
    let current = request.current_drive_size_gib * request.current_drive_count;
    if request.desired_capacity_gib < current {
        return Err(Error::CurrentCapacityHigherThanDesired {
            current,
            desired: request.desired_capacity_gib,
        });
    }
    if request.desired_capacity_gib == current {
        return Err(Error::CurrentCapacitySameAsDesired { capacity: current });
    }
    if request.current_drive_count > 0 && request.current_drive_type.is_empty() {
        return Err(Error::InvalidUpdateRequest {
            reason: "current drives are present but the drive type is unset".into(),
        });
    }
    if request.current_drive_count > 0 && request.current_drive_size_gib == 0 {
        return Err(Error::InvalidUpdateRequest {
            reason: "current drives are present but have no size".into(),
        });
    }
    Ok(current)
}

/// Plan an update honoring `request.resize_op`; `AUTO` attempts a resize
/// first and falls back to adding drives when no row admits it.
pub fn plan_update(
    matrix: &StorageDecisionMatrix,
    request: &StoragePoolUpdateRequest,
) -> Result<UpdatePlan> {
    let current = validate_update(request)?;
    match request.resize_op {
        ResizeOperation::ResizeDisk => plan_resize(matrix, request, current),
        ResizeOperation::AddDisk => plan_add(matrix, request, current),
        ResizeOperation::Auto => match plan_resize(matrix, request, current) {
            Ok(plan) => Ok(plan),
            Err(Error::NoCandidate) => {
                debug!("no resize candidate, falling back to adding drives");
                plan_add(matrix, request, current)
            }
            Err(e) => Err(e),
        },
    }
}

/// Grow every existing drive by an equal share of the missing capacity.
fn plan_resize(
    matrix: &StorageDecisionMatrix,
    request: &StoragePoolUpdateRequest,
    current: u64,
) -> Result<UpdatePlan> {
    if request.current_drive_count == 0 {
        return Err(Error::NoCandidate);
    }

    let delta_per_drive =
        (request.desired_capacity_gib - current).div_ceil(request.current_drive_count);
    let new_size = request.current_drive_size_gib + delta_per_drive;

    let candidates = matrix
        .filter_by_drive_type(&request.current_drive_type)
        .filter_by_iops(request.current_iops)
        .filter_by_drive_size(request.current_drive_size_gib)
        .sort_by_iops();
    let row = candidates.rows.first().ok_or(Error::NoCandidate)?;

    if new_size > row.max_size {
        return Err(Error::NoCandidate);
    }

    Ok(UpdatePlan {
        resize_op: ResizeOperation::ResizeDisk,
        candidate: CandidatePlan {
            pool: StoragePoolSpec {
                drive_type: request.current_drive_type.clone(),
                drive_capacity_gib: new_size,
                drive_count: request.current_drive_count,
                instances_per_zone: 1,
                iops: row.iops,
            },
            row: row.clone(),
        },
    })
}

/// Keep the existing drives and place enough new drives of the same size to
/// cover the missing capacity. A node with no drives yet gets one drive
/// holding the whole delta.
fn plan_add(
    matrix: &StorageDecisionMatrix,
    request: &StoragePoolUpdateRequest,
    current: u64,
) -> Result<UpdatePlan> {
    let delta = request.desired_capacity_gib - current;

    let (drive_size, required_added) = if request.current_drive_size_gib == 0 {
        (delta, 1)
    } else {
        (
            request.current_drive_size_gib,
            delta.div_ceil(request.current_drive_size_gib),
        )
    };

    let candidates = matrix
        .filter_by_drive_type(&request.current_drive_type)
        .filter_by_drive_count(request.total_drives_on_node + required_added)
        .filter_by_drive_size(drive_size)
        .sort_by_iops()
        .sort_by_priority();
    let row = candidates.rows.first().ok_or(Error::NoCandidate)?;

    Ok(UpdatePlan {
        resize_op: ResizeOperation::AddDisk,
        candidate: CandidatePlan {
            pool: StoragePoolSpec {
                drive_type: row.drive_type.clone(),
                drive_capacity_gib: drive_size,
                drive_count: required_added,
                instances_per_zone: 1,
                iops: row.iops,
            },
            row: row.clone(),
        },
    })
}
