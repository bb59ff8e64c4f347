//! Provider Ops Protocol
//!
//! The uniform volume-lifecycle capability set every provider adapter
//! implements: create, attach with device-path resolution, detach, expand,
//! snapshot, tag mutation and enumeration, plus thin instance-group
//! pass-through. All operations are synchronous from the caller's
//! perspective; long-running provider operations are polled internally.
//!
//! Provider state is eventually consistent: a successful `create` followed
//! by `inspect` without the internal wait may still miss the volume, which
//! is why every multi-step operation goes through the waiter primitives in
//! [`wait`].

pub mod device;
pub mod fixture;
pub mod retry;
pub mod wait;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Free-form labels applied to volumes and snapshots.
pub type Labels = BTreeMap<String, String>;

/// Bucket used by [`CloudOps::enumerate`] for volumes missing the
/// set-identifier label.
pub const SET_IDENTIFIER_NONE: &str = "none";

/// Prefix for operator-created snapshot names.
pub const SNAPSHOT_NAME_PREFIX: &str = "cdo-snap";

// =============================================================================
// Volume Model
// =============================================================================

/// Provider-reported volume lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Creating,
    Available,
    Deleting,
    Error,
}

/// Provider-reported attachment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
}

/// The slot a volume occupies on an instance.
///
/// `instance_id` is the provider-side reverse reference and the source of
/// truth for attachment ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub instance_id: String,
    /// Provider device slot: a LUN index or a device name.
    pub device: String,
    pub state: AttachmentState,
}

/// Provider-opaque volume observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_gib: u64,
    pub drive_type: String,
    /// Zone / availability domain the volume lives in.
    pub zone: String,
    /// Provider-native sharing mode the volume was created with.
    #[serde(default)]
    pub shared: bool,
    pub labels: Labels,
    pub state: VolumeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
}

impl Volume {
    /// Instance this volume is managed by, when attached or attaching.
    pub fn managed_by(&self) -> Option<&str> {
        self.attachment.as_ref().map(|a| a.instance_id.as_str())
    }
}

/// Template for a new volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeTemplate {
    pub name: String,
    pub size_gib: u64,
    pub drive_type: String,
    pub zone: String,
    /// Requested IOPS for tunable drive families; `None` takes the family
    /// floor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<u64>,
    #[serde(default)]
    pub labels: Labels,
    /// Provider-native sharing mode; pass-through only.
    #[serde(default)]
    pub shared: bool,
}

/// Snapshot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Creating,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub name: String,
    pub state: SnapshotState,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Instance Model
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: String,
    pub name: String,
    pub zone: String,
    pub region: String,
    #[serde(default)]
    pub labels: Labels,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupInfo {
    pub id: String,
    pub name: String,
    pub zones: Vec<String>,
    pub count: u64,
}

// =============================================================================
// Ops Configuration
// =============================================================================

/// Timeouts and intervals shared by every adapter's poll loops.
#[derive(Debug, Clone)]
pub struct OpsConfig {
    /// Deadline for any single provider operation, poll loops included.
    pub op_timeout: Duration,
    /// Interval between lifecycle polls.
    pub poll_interval: Duration,
    /// Bounded retries while waiting for the kernel to expose a device node.
    pub device_path_retries: u32,
    pub device_path_interval: Duration,
    /// Root under which device symlinks are predicted, normally `/dev`.
    pub device_root: std::path::PathBuf,
    /// Require resolved devices to be real block devices. Disabled only in
    /// tests, where symlink targets are regular files.
    pub require_block_device: bool,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            device_path_retries: 3,
            device_path_interval: Duration::from_secs(1),
            device_root: std::path::PathBuf::from("/dev"),
            require_block_device: true,
        }
    }
}

// =============================================================================
// CloudOps Trait
// =============================================================================

/// The uniform capability set of a provider adapter.
///
/// Optional operations return [`crate::error::Error::NotSupported`] rather
/// than being absent; callers branch on that error and skip.
///
/// An implementation is safe for concurrent use across operations targeting
/// distinct volumes; operations mutating attachments on the same instance
/// serialize internally.
#[async_trait]
pub trait CloudOps: Send + Sync {
    /// Provider name, e.g. `aws`.
    fn name(&self) -> &'static str;

    /// The instance this adapter runs on.
    fn instance_id(&self) -> &str;

    // -- compute ------------------------------------------------------------

    async fn inspect_instance(&self, instance_id: &str) -> Result<InstanceInfo>;

    async fn inspect_instance_group_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<InstanceGroupInfo>;

    async fn set_instance_group_size(
        &self,
        group_id: &str,
        count: u64,
        timeout: Option<Duration>,
    ) -> Result<()>;

    async fn get_instance_group_size(&self, group_id: &str) -> Result<u64>;

    // -- storage ------------------------------------------------------------

    /// Create a volume from `template`, merging `labels` over the template
    /// labels, and wait for it to become available. Rolls the volume back
    /// on any failure past submission.
    async fn create(&self, template: &VolumeTemplate, labels: &Labels) -> Result<Volume>;

    /// Delete a volume; a volume already gone is success.
    async fn delete(&self, volume_id: &str) -> Result<()>;

    /// Attach a volume to this instance and return the kernel device path.
    async fn attach(&self, volume_id: &str, options: &Labels) -> Result<String>;

    /// Detach a volume from this instance; missing disk or attachment is
    /// success.
    async fn detach(&self, volume_id: &str) -> Result<()>;

    /// Detach a volume from a specific instance.
    async fn detach_from(&self, volume_id: &str, instance_id: &str) -> Result<()>;

    /// Grow a volume to `new_size_gib` and return the resulting size.
    /// A volume already at least that large is returned unchanged.
    async fn expand(&self, volume_id: &str, new_size_gib: u64) -> Result<u64>;

    /// Inspect the given volumes; empty input means all operator volumes.
    async fn inspect(&self, volume_ids: &[String]) -> Result<Vec<Volume>>;

    /// Enumerate volumes filtered by `labels`, partitioned by the value of
    /// the `set_identifier` label ([`SET_IDENTIFIER_NONE`] when missing).
    async fn enumerate(
        &self,
        volume_ids: &[String],
        labels: &Labels,
        set_identifier: &str,
    ) -> Result<BTreeMap<String, Vec<Volume>>>;

    /// Kernel device paths of volumes attached to this instance.
    async fn device_mappings(&self) -> Result<BTreeMap<String, String>>;

    /// Kernel device path of an attached volume.
    async fn device_path(&self, volume_id: &str) -> Result<String>;

    /// Snapshot a volume. Only read-only snapshots are supported.
    async fn snapshot(&self, volume_id: &str, readonly: bool, labels: &Labels) -> Result<Snapshot>;

    /// Delete a snapshot; one already gone is success.
    async fn snapshot_delete(&self, snapshot_id: &str) -> Result<()>;

    async fn apply_tags(&self, volume_id: &str, labels: &Labels) -> Result<()>;

    async fn remove_tags(&self, volume_id: &str, keys: &[String]) -> Result<()>;

    async fn tags(&self, volume_id: &str) -> Result<Labels>;
}

pub type CloudOpsRef = Arc<dyn CloudOps>;

/// Merge template labels with caller labels; caller labels win on collision.
pub fn merge_labels(template: &Labels, caller: &Labels) -> Labels {
    let mut merged = template.clone();
    for (k, v) in caller {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Deterministic snapshot name: prefix, volume, UTC timestamp.
pub fn snapshot_name(volume_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "{SNAPSHOT_NAME_PREFIX}-{volume_id}-{}",
        now.format("%Y%m%d%H%M%S")
    )
}

/// Partition volumes by the value of the `set_identifier` label.
pub fn partition_by_set(volumes: Vec<Volume>, set_identifier: &str) -> BTreeMap<String, Vec<Volume>> {
    let mut sets: BTreeMap<String, Vec<Volume>> = BTreeMap::new();
    for volume in volumes {
        let key = volume
            .labels
            .get(set_identifier)
            .cloned()
            .unwrap_or_else(|| SET_IDENTIFIER_NONE.to_string());
        sets.entry(key).or_default().push(volume);
    }
    sets
}

/// Whether `labels` is a subset of the volume's labels.
pub fn labels_match(volume: &Volume, labels: &Labels) -> bool {
    labels
        .iter()
        .all(|(k, v)| volume.labels.get(k).map(String::as_str) == Some(v.as_str()))
}
