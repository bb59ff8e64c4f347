//! Per-provider storage managers and their registry
//!
//! One `StorageManager` per provider wraps the generic distribution/update
//! planners and decorates results with the provider's performance model.
//! vSphere replaces the ADD strategy with a max-drive-size layout because
//! VMDK counts, not sizes, are the scarce resource there.
//!
//! Managers are constructed through an explicit registry populated at
//! startup: `register(provider, factory)` then `manager_for(provider,
//! matrix)`.

use crate::error::{Error, Result};
use crate::matrix::{StorageDecisionMatrix, StorageDecisionMatrixRow};
use crate::perf::{self, DrivePerformance};
use crate::planner::{
    distribution, update, MaxDriveSizeRequest, ResizeOperation, StorageDistributionRequest,
    StorageDistributionResponse, StoragePoolSpec, StoragePoolUpdateRequest,
    StoragePoolUpdateResponse,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Provider Kind
// =============================================================================

/// Clouds this operator can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aws,
    Azure,
    Gce,
    Oracle,
    Vsphere,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Aws,
        ProviderKind::Azure,
        ProviderKind::Gce,
        ProviderKind::Oracle,
        ProviderKind::Vsphere,
    ];
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Aws => write!(f, "aws"),
            ProviderKind::Azure => write!(f, "azure"),
            ProviderKind::Gce => write!(f, "gce"),
            ProviderKind::Oracle => write!(f, "oracle"),
            ProviderKind::Vsphere => write!(f, "vsphere"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(ProviderKind::Aws),
            "azure" => Ok(ProviderKind::Azure),
            "gce" => Ok(ProviderKind::Gce),
            "oracle" => Ok(ProviderKind::Oracle),
            "vsphere" => Ok(ProviderKind::Vsphere),
            other => Err(Error::Configuration(format!("unknown provider: {other}"))),
        }
    }
}

// =============================================================================
// Storage Manager Trait
// =============================================================================

/// Planning capability of one provider: distribution, updates and the
/// max-drive-size query.
pub trait StorageManager: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Plan drive layouts for every spec in the request.
    fn storage_distribution(
        &self,
        request: &StorageDistributionRequest,
    ) -> Result<StorageDistributionResponse>;

    /// Plan a capacity increase for one instance's pool.
    fn storage_update(
        &self,
        request: &StoragePoolUpdateRequest,
    ) -> Result<StoragePoolUpdateResponse>;

    /// Largest drive size any matrix row admits for the requested type.
    fn max_drive_size(&self, request: &MaxDriveSizeRequest) -> Result<u64>;
}

pub type StorageManagerRef = Arc<dyn StorageManager>;

// =============================================================================
// Generic Planning Core
// =============================================================================

/// IOPS decoration applied after the generic planners run. `None` keeps the
/// matched row's rated IOPS (vSphere has no performance model).
type PerfModel = Option<fn(&str, u64, u64) -> Result<DrivePerformance>>;

struct MatrixPlanner {
    matrix: StorageDecisionMatrix,
    perf: PerfModel,
}

impl MatrixPlanner {
    fn distribution(&self, request: &StorageDistributionRequest) -> Result<StorageDistributionResponse> {
        let mut pools = Vec::with_capacity(request.specs.len());
        for spec in &request.specs {
            let plan = distribution::plan_distribution(
                &self.matrix,
                spec,
                request.instances_per_zone,
                request.zone_count,
            )?;
            pools.push(self.decorate(plan.pool, spec.iops)?);
        }
        Ok(StorageDistributionResponse {
            instance_storage: pools,
        })
    }

    fn update(&self, request: &StoragePoolUpdateRequest) -> Result<StoragePoolUpdateResponse> {
        let plan = update::plan_update(&self.matrix, request)?;
        let pool = self.decorate(plan.candidate.pool, request.current_iops)?;
        Ok(StoragePoolUpdateResponse {
            resize_op: plan.resize_op,
            instance_storage: vec![pool],
        })
    }

    fn decorate(&self, mut pool: StoragePoolSpec, requested_iops: u64) -> Result<StoragePoolSpec> {
        if let Some(model) = self.perf {
            let perf = model(&pool.drive_type, pool.drive_capacity_gib, requested_iops)?;
            pool.iops = perf.iops;
        }
        Ok(pool)
    }

    fn max_drive_size(&self, request: &MaxDriveSizeRequest) -> Result<u64> {
        if request.drive_type.is_empty() {
            return Err(Error::InvalidMaxDriveSizeRequest {
                reason: "drive type must be set".into(),
            });
        }
        max_size_row(&self.matrix, &request.drive_type, &request.region).map(|r| r.max_size)
    }
}

/// The row with the greatest `max_size` among rows matching the drive type
/// (all rows when empty) and region.
fn max_size_row(
    matrix: &StorageDecisionMatrix,
    drive_type: &str,
    region: &str,
) -> Result<StorageDecisionMatrixRow> {
    matrix
        .filter_by_drive_type(drive_type)
        .filter_by_region(region)
        .rows
        .into_iter()
        .max_by_key(|r| r.max_size)
        .ok_or(Error::MaxDriveSizeCandidateNotFound)
}

// =============================================================================
// Provider Managers
// =============================================================================

/// Generic manager for providers whose update strategy is the stock
/// resize-or-add algorithm; only the performance decoration differs.
pub struct MatrixStorageManager {
    kind: ProviderKind,
    planner: MatrixPlanner,
}

impl MatrixStorageManager {
    fn new(kind: ProviderKind, matrix: StorageDecisionMatrix, perf: PerfModel) -> Result<Self> {
        matrix.validate()?;
        Ok(Self {
            kind,
            planner: MatrixPlanner { matrix, perf },
        })
    }

    pub fn aws(matrix: StorageDecisionMatrix) -> Result<Self> {
        Self::new(ProviderKind::Aws, matrix, Some(perf::aws::compute_iops))
    }

    pub fn azure(matrix: StorageDecisionMatrix) -> Result<Self> {
        Self::new(ProviderKind::Azure, matrix, Some(perf::azure::compute_iops))
    }

    pub fn gce(matrix: StorageDecisionMatrix) -> Result<Self> {
        Self::new(ProviderKind::Gce, matrix, Some(perf::gce::compute_iops))
    }

    pub fn oracle(matrix: StorageDecisionMatrix) -> Result<Self> {
        Self::new(ProviderKind::Oracle, matrix, Some(perf::oracle::compute_iops))
    }
}

impl StorageManager for MatrixStorageManager {
    fn provider(&self) -> ProviderKind {
        self.kind
    }

    fn storage_distribution(
        &self,
        request: &StorageDistributionRequest,
    ) -> Result<StorageDistributionResponse> {
        self.planner.distribution(request)
    }

    fn storage_update(
        &self,
        request: &StoragePoolUpdateRequest,
    ) -> Result<StoragePoolUpdateResponse> {
        self.planner.update(request)
    }

    fn max_drive_size(&self, request: &MaxDriveSizeRequest) -> Result<u64> {
        self.planner.max_drive_size(request)
    }
}

/// vSphere: generic distribution, but updates lay out against the largest
/// datastore-admissible VMDK instead of multiplying the current drive size.
pub struct VsphereStorageManager {
    planner: MatrixPlanner,
}

impl VsphereStorageManager {
    pub fn new(matrix: StorageDecisionMatrix) -> Result<Self> {
        matrix.validate()?;
        Ok(Self {
            planner: MatrixPlanner { matrix, perf: None },
        })
    }

    /// ADD strategy: as many max-size VMDKs as the desired capacity fills,
    /// then level the remainder across them.
    fn plan_add_max_size(&self, request: &StoragePoolUpdateRequest) -> Result<StoragePoolUpdateResponse> {
        let row = max_size_row(&self.planner.matrix, &request.current_drive_type, "")?;
        let mut drive_count = request.desired_capacity_gib / row.max_size;
        if drive_count == 0 {
            drive_count = 1;
        }
        let drive_size = request.desired_capacity_gib.div_ceil(drive_count);
        Ok(StoragePoolUpdateResponse {
            resize_op: ResizeOperation::AddDisk,
            instance_storage: vec![StoragePoolSpec {
                drive_type: row.drive_type.clone(),
                drive_capacity_gib: drive_size,
                drive_count,
                instances_per_zone: 1,
                iops: row.iops,
            }],
        })
    }
}

impl StorageManager for VsphereStorageManager {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Vsphere
    }

    fn storage_distribution(
        &self,
        request: &StorageDistributionRequest,
    ) -> Result<StorageDistributionResponse> {
        self.planner.distribution(request)
    }

    fn storage_update(
        &self,
        request: &StoragePoolUpdateRequest,
    ) -> Result<StoragePoolUpdateResponse> {
        update::validate_update(request)?;
        match request.resize_op {
            ResizeOperation::AddDisk => self.plan_add_max_size(request),
            ResizeOperation::ResizeDisk => self.planner.update(request),
            ResizeOperation::Auto => {
                let resize = StoragePoolUpdateRequest {
                    resize_op: ResizeOperation::ResizeDisk,
                    ..request.clone()
                };
                match self.planner.update(&resize) {
                    Ok(resp) => Ok(resp),
                    Err(Error::NoCandidate) => self.plan_add_max_size(request),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn max_drive_size(&self, request: &MaxDriveSizeRequest) -> Result<u64> {
        self.planner.max_drive_size(request)
    }
}

// =============================================================================
// Registry
// =============================================================================

pub type StorageManagerFactory =
    Arc<dyn Fn(StorageDecisionMatrix) -> Result<StorageManagerRef> + Send + Sync>;

/// Explicit provider-to-factory registry.
///
/// Populated once at startup; consumers look up a factory by provider and
/// instantiate a manager against the matrix they carry.
#[derive(Default)]
pub struct StorageManagerRegistry {
    factories: RwLock<BTreeMap<ProviderKind, StorageManagerFactory>>,
}

impl StorageManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in provider registered.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(ProviderKind::Aws, Arc::new(|m| {
            Ok(Arc::new(MatrixStorageManager::aws(m)?) as StorageManagerRef)
        }));
        registry.register(ProviderKind::Azure, Arc::new(|m| {
            Ok(Arc::new(MatrixStorageManager::azure(m)?) as StorageManagerRef)
        }));
        registry.register(ProviderKind::Gce, Arc::new(|m| {
            Ok(Arc::new(MatrixStorageManager::gce(m)?) as StorageManagerRef)
        }));
        registry.register(ProviderKind::Oracle, Arc::new(|m| {
            Ok(Arc::new(MatrixStorageManager::oracle(m)?) as StorageManagerRef)
        }));
        registry.register(ProviderKind::Vsphere, Arc::new(|m| {
            Ok(Arc::new(VsphereStorageManager::new(m)?) as StorageManagerRef)
        }));
        registry
    }

    /// Register (or replace) the factory for a provider.
    pub fn register(&self, provider: ProviderKind, factory: StorageManagerFactory) {
        info!(%provider, "registering storage manager factory");
        self.factories.write().insert(provider, factory);
    }

    /// Instantiate the provider's manager against `matrix`.
    pub fn manager_for(
        &self,
        provider: ProviderKind,
        matrix: StorageDecisionMatrix,
    ) -> Result<StorageManagerRef> {
        let factory = self
            .factories
            .read()
            .get(&provider)
            .cloned()
            .ok_or_else(|| {
                Error::Configuration(format!("no storage manager registered for {provider}"))
            })?;
        factory(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::tests::row;
    use crate::planner::StorageSpec;
    use assert_matches::assert_matches;

    /// Premium managed-disk bands, fixed sizes per band.
    fn azure_matrix() -> StorageDecisionMatrix {
        StorageDecisionMatrix::new(vec![
            row("Premium_LRS", 120, 32, 32, 8, 0),
            row("Premium_LRS", 240, 64, 64, 8, 0),
            row("Premium_LRS", 500, 128, 128, 8, 0),
            row("Premium_LRS", 1100, 256, 256, 8, 0),
            row("Premium_LRS", 2300, 512, 512, 8, 0),
            row("Premium_LRS", 5000, 1024, 1024, 8, 0),
            row("Premium_LRS", 7500, 2048, 2048, 8, 0),
            row("Premium_LRS", 7500, 4095, 4095, 8, 0),
        ])
        .unwrap()
    }

    fn distribution_request(
        iops: u64,
        min: u64,
        max: u64,
        instances_per_zone: u64,
        zones: u64,
    ) -> StorageDistributionRequest {
        StorageDistributionRequest {
            specs: vec![StorageSpec {
                iops,
                min_capacity_gib: min,
                max_capacity_gib: max,
                drive_type: None,
            }],
            instances_per_zone,
            zone_count: zones,
            instance_type: String::new(),
        }
    }

    #[test]
    fn test_azure_upper_bound_iops() {
        let mgr = MatrixStorageManager::azure(azure_matrix()).unwrap();
        let resp = mgr
            .storage_distribution(&distribution_request(1000, 1024, 100_000, 3, 2))
            .unwrap();
        let pool = &resp.instance_storage[0];
        assert_eq!(pool.drive_capacity_gib, 256);
        assert_eq!(pool.drive_type, "Premium_LRS");
        assert_eq!(pool.instances_per_zone, 2);
        assert_eq!(pool.drive_count, 1);
        assert_eq!(pool.iops, 1100);
    }

    #[test]
    fn test_azure_zone_spread() {
        let mgr = MatrixStorageManager::azure(azure_matrix()).unwrap();
        let resp = mgr
            .storage_distribution(&distribution_request(5000, 9216, 9216, 3, 3))
            .unwrap();
        let pool = &resp.instance_storage[0];
        assert_eq!(pool.drive_capacity_gib, 1024);
        assert_eq!(pool.drive_type, "Premium_LRS");
        assert_eq!(pool.instances_per_zone, 3);
        assert_eq!(pool.drive_count, 1);
        assert_eq!(pool.iops, 5000);
    }

    #[test]
    fn test_azure_uniform_distribution_impossible() {
        let mgr = MatrixStorageManager::azure(azure_matrix()).unwrap();
        let err = mgr
            .storage_distribution(&distribution_request(7500, 2048, 2048, 3, 3))
            .unwrap_err();
        assert_matches!(err, Error::NoCandidate);
    }

    #[test]
    fn test_oracle_resize_update() {
        let matrix =
            StorageDecisionMatrix::new(vec![row("pv-20", 38_400, 50, 1024, 8, 0)]).unwrap();
        let mgr = MatrixStorageManager::oracle(matrix).unwrap();
        let resp = mgr
            .storage_update(&StoragePoolUpdateRequest {
                desired_capacity_gib: 1536,
                resize_op: ResizeOperation::ResizeDisk,
                current_drive_size_gib: 256,
                current_drive_count: 3,
                current_drive_type: "pv-20".into(),
                current_iops: 19_200,
                total_drives_on_node: 3,
            })
            .unwrap();
        let pool = &resp.instance_storage[0];
        assert_eq!(pool.drive_count, 3);
        assert_eq!(pool.drive_capacity_gib, 512);
        assert_eq!(pool.iops, 38_400);
    }

    #[test]
    fn test_vsphere_add_update_uses_max_drive_size() {
        let matrix = StorageDecisionMatrix::new(vec![{
            let mut r = row("thin", 0, 100, 4096, 64, 0);
            r.thin_provisioning = true;
            r
        }])
        .unwrap();
        let mgr = VsphereStorageManager::new(matrix).unwrap();
        let resp = mgr
            .storage_update(&StoragePoolUpdateRequest {
                desired_capacity_gib: 8193,
                resize_op: ResizeOperation::AddDisk,
                current_drive_size_gib: 200,
                current_drive_count: 3,
                current_drive_type: "thin".into(),
                current_iops: 0,
                total_drives_on_node: 3,
            })
            .unwrap();
        let pool = &resp.instance_storage[0];
        assert_eq!(pool.drive_count, 2);
        assert_eq!(pool.drive_capacity_gib, 4097);
        assert_eq!(pool.drive_type, "thin");
    }

    #[test]
    fn test_max_drive_size_query() {
        let matrix = StorageDecisionMatrix::new(vec![
            row("thin", 0, 100, 4096, 64, 0),
            row("thin", 0, 100, 2048, 64, 0),
        ])
        .unwrap();
        let mgr = VsphereStorageManager::new(matrix).unwrap();
        let size = mgr
            .max_drive_size(&MaxDriveSizeRequest {
                drive_type: "thin".into(),
                region: String::new(),
            })
            .unwrap();
        assert_eq!(size, 4096);

        assert_matches!(
            mgr.max_drive_size(&MaxDriveSizeRequest {
                drive_type: String::new(),
                region: String::new(),
            }),
            Err(Error::InvalidMaxDriveSizeRequest { .. })
        );
        assert_matches!(
            mgr.max_drive_size(&MaxDriveSizeRequest {
                drive_type: "lazyZeroedThick".into(),
                region: String::new(),
            }),
            Err(Error::MaxDriveSizeCandidateNotFound)
        );
    }

    #[test]
    fn test_registry_round_trip() {
        let registry = StorageManagerRegistry::with_defaults();
        let mgr = registry
            .manager_for(ProviderKind::Azure, azure_matrix())
            .unwrap();
        assert_eq!(mgr.provider(), ProviderKind::Azure);

        let empty = StorageManagerRegistry::new();
        assert!(matches!(
            empty.manager_for(ProviderKind::Aws, azure_matrix()),
            Err(Error::Configuration(_))
        ));
    }
}
