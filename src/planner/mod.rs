//! Storage Distribution & Update Planners
//!
//! Converts declarative capacity/IOPS requests into concrete per-zone,
//! per-instance drive layouts, and decides whether a capacity increase is
//! satisfied by resizing existing drives or adding new ones. Purely
//! computational; no I/O, no retries.

pub mod distribution;
pub mod managers;
pub mod update;

pub use distribution::plan_distribution;
pub use managers::{ProviderKind, StorageManager, StorageManagerRegistry};
pub use update::plan_update;

use serde::{Deserialize, Serialize};

// =============================================================================
// Distribution Types
// =============================================================================

/// One requested band of storage: cluster-wide capacity totals and a
/// performance target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Requested IOPS per drive.
    pub iops: u64,
    /// Cluster-wide minimum capacity in GiB.
    pub min_capacity_gib: u64,
    /// Cluster-wide maximum capacity in GiB.
    pub max_capacity_gib: u64,
    /// Optional drive type; when absent the planner picks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_type: Option<String>,
}

/// A full distribution request across zones and instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDistributionRequest {
    pub specs: Vec<StorageSpec>,
    /// Upper bound on instances per zone the caller will run.
    pub instances_per_zone: u64,
    pub zone_count: u64,
    #[serde(default)]
    pub instance_type: String,
}

/// The unit of storage assigned to one instance: one or more drives of
/// equal type and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePoolSpec {
    pub drive_type: String,
    pub drive_capacity_gib: u64,
    pub drive_count: u64,
    /// Effective instances per zone after the shrink pass; may be lower
    /// than requested to reduce over-provisioning.
    pub instances_per_zone: u64,
    pub iops: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDistributionResponse {
    /// One pool spec per requested storage spec, in request order.
    pub instance_storage: Vec<StoragePoolSpec>,
}

// =============================================================================
// Update Types
// =============================================================================

/// How a capacity increase should be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResizeOperation {
    ResizeDisk,
    AddDisk,
    Auto,
}

impl Default for ResizeOperation {
    fn default() -> Self {
        ResizeOperation::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePoolUpdateRequest {
    /// Desired total capacity per instance in GiB.
    pub desired_capacity_gib: u64,
    #[serde(default)]
    pub resize_op: ResizeOperation,
    pub current_drive_size_gib: u64,
    pub current_drive_count: u64,
    #[serde(default)]
    pub current_drive_type: String,
    #[serde(default)]
    pub current_iops: u64,
    /// All drives currently on the node, across pools; bounds how many more
    /// drives the ADD path may place.
    #[serde(default)]
    pub total_drives_on_node: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePoolUpdateResponse {
    /// The operation the planner actually chose (AUTO resolves to one).
    pub resize_op: ResizeOperation,
    pub instance_storage: Vec<StoragePoolSpec>,
}

// =============================================================================
// Max Drive Size
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxDriveSizeRequest {
    pub drive_type: String,
    #[serde(default)]
    pub region: String,
}
