//! EBS Adapter
//!
//! Drives AWS Elastic Block Store through the uniform ops protocol. Device
//! slots are the classic `/dev/xvd{f..p}` letters; on current instance
//! families the kernel surfaces the volume behind an
//! `/dev/disk/by-id/nvme-Amazon_Elastic_Block_Store_<id>` symlink, which is
//! what device-path resolution predicts.

use crate::error::{Error, Result};
use crate::ops::device::wait_for_device_path;
use crate::ops::wait::wait_for;
use crate::ops::{
    merge_labels, partition_by_set, snapshot_name, AttachmentState, CloudOps, InstanceGroupInfo,
    InstanceInfo, Labels, OpsConfig, Snapshot, SnapshotState, Volume, VolumeState, VolumeTemplate,
    labels_match,
};
use crate::perf;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Device letters EBS accepts for data volumes.
const DEVICE_LETTERS: &[char] = &['f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p'];

// =============================================================================
// Configuration
// =============================================================================

/// Placement of the local instance. Credentials are resolved by the SDK
/// client (environment access/secret keys or a cluster secret) and never
/// pass through here.
#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub instance_id: String,
    pub region: String,
    pub zone: String,
}

impl AwsConfig {
    pub fn from_env() -> Result<Self> {
        let instance_id = std::env::var("AWS_INSTANCE_ID").map_err(|_| {
            Error::Configuration("AWS_INSTANCE_ID is not set".into())
        })?;
        let zone = std::env::var("AWS_ZONE").unwrap_or_default();
        let region = std::env::var("AWS_REGION")
            .ok()
            .or_else(|| zone.strip_suffix(|c: char| c.is_ascii_alphabetic()).map(String::from))
            .unwrap_or_default();
        Ok(Self {
            instance_id,
            region,
            zone,
        })
    }
}

// =============================================================================
// SDK Client Capability
// =============================================================================

/// Opaque EC2 client surface. The production implementation wraps the SDK
/// and maps its failures into the error taxonomy (HTTP 404 and
/// `InvalidVolume.NotFound` become [`Error::VolNotFound`]).
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn create_volume(&self, template: &VolumeTemplate, labels: Labels) -> Result<Volume>;
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;
    async fn describe_volume(&self, volume_id: &str) -> Result<Volume>;
    async fn describe_volumes(&self) -> Result<Vec<Volume>>;
    async fn find_volume_by_name(&self, name: &str) -> Result<Option<Volume>>;
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device_name: &str,
    ) -> Result<()>;
    async fn detach_volume(&self, volume_id: &str, instance_id: Option<&str>) -> Result<()>;
    async fn modify_volume_size(&self, volume_id: &str, size_gib: u64) -> Result<()>;
    /// `(volume_id, device_name)` pairs attached to an instance.
    async fn attachments(&self, instance_id: &str) -> Result<Vec<(String, String)>>;
    async fn create_snapshot(&self, volume_id: &str, name: &str) -> Result<Snapshot>;
    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;
    async fn create_tags(&self, volume_id: &str, labels: &Labels) -> Result<()>;
    async fn delete_tags(&self, volume_id: &str, keys: &[String]) -> Result<()>;
    async fn describe_tags(&self, volume_id: &str) -> Result<Labels>;
    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceInfo>;
}

/// Throttle classes the retry wrapper may re-drive.
pub fn is_transient(err: &Error) -> bool {
    matches!(
        err.provider_code(),
        Some("RequestLimitExceeded")
            | Some("Throttling")
            | Some("SnapshotCreationPerVolumeRateExceeded")
    )
}

// =============================================================================
// Adapter
// =============================================================================

pub struct AwsOps {
    client: Arc<dyn Ec2Api>,
    config: AwsConfig,
    ops: OpsConfig,
    /// Serializes attach/detach on this instance so two callers never pick
    /// the same device letter.
    attach_lock: Mutex<()>,
}

impl AwsOps {
    pub fn new(client: Arc<dyn Ec2Api>, config: AwsConfig, ops: OpsConfig) -> Self {
        Self {
            client,
            config,
            ops,
            attach_lock: Mutex::new(()),
        }
    }

    fn predicted_path(&self, volume_id: &str) -> PathBuf {
        self.ops.device_root.join(format!(
            "disk/by-id/nvme-Amazon_Elastic_Block_Store_{}",
            volume_id.replace('-', "")
        ))
    }

    /// Smallest free device letter on this instance.
    async fn select_device(&self) -> Result<String> {
        let attachments = self.client.attachments(&self.config.instance_id).await?;
        let used: Vec<String> = attachments.into_iter().map(|(_, d)| d).collect();
        for letter in DEVICE_LETTERS {
            let candidate = format!("/dev/xvd{letter}");
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::Provider {
            provider: "aws",
            code: "AttachmentLimitExceeded".into(),
            status: None,
            message: "no free device letters left on this instance".into(),
            detail: None,
        })
    }

    async fn wait_available(&self, volume_id: &str) -> Result<Volume> {
        wait_for(
            "create",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                match self.client.describe_volume(volume_id).await {
                    Ok(v) if v.state == VolumeState::Available => Ok(Some(v)),
                    // Creation lags describe; keep polling.
                    Ok(_) | Err(Error::VolNotFound { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    async fn wait_attached(&self, volume_id: &str) -> Result<()> {
        wait_for(
            "attach",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                let volume = self.client.describe_volume(volume_id).await?;
                match volume.attachment {
                    Some(a) if a.state == AttachmentState::Attached => Ok(Some(())),
                    _ => Ok(None),
                }
            },
        )
        .await
    }

    async fn wait_detached(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        wait_for(
            "detach",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                match self.client.describe_volume(volume_id).await {
                    Ok(v) => match v.attachment {
                        Some(a) if a.instance_id == instance_id => Ok(None),
                        _ => Ok(Some(())),
                    },
                    Err(Error::VolNotFound { .. }) => Ok(Some(())),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    async fn resolve_attached_path(&self, volume_id: &str) -> Result<String> {
        let predicted = self.predicted_path(volume_id);
        let resolved = wait_for_device_path(
            &predicted,
            self.ops.device_path_retries,
            self.ops.device_path_interval,
            self.ops.require_block_device,
        )
        .await?;
        Ok(resolved.display().to_string())
    }

    fn validate_template(&self, template: &VolumeTemplate) -> Result<()> {
        if template.name.is_empty() {
            return Err(Error::VolInval {
                reason: "volume name must be set".into(),
            });
        }
        if template.size_gib == 0 {
            return Err(Error::VolInval {
                reason: "volume size must be positive".into(),
            });
        }
        perf::aws::compute_iops(&template.drive_type, template.size_gib, 0).map_err(|_| {
            Error::VolInval {
                reason: format!("unknown EBS volume type {}", template.drive_type),
            }
        })?;
        if template.shared && !matches!(template.drive_type.as_str(), "io1" | "io2") {
            return Err(Error::VolInval {
                reason: "multi-attach requires an io1 or io2 volume".into(),
            });
        }
        Ok(())
    }

    async fn detach_internal(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        let _guard = self.attach_lock.lock().await;

        let attachments = self.client.attachments(instance_id).await?;
        if !attachments.iter().any(|(v, _)| v == volume_id) {
            debug!(volume_id, instance_id, "volume already detached");
            return Ok(());
        }

        match self.client.detach_volume(volume_id, Some(instance_id)).await {
            Ok(()) => {}
            Err(Error::VolNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.wait_detached(volume_id, instance_id).await
    }
}

#[async_trait]
impl CloudOps for AwsOps {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    async fn inspect_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        self.client.describe_instance(instance_id).await
    }

    async fn inspect_instance_group_for_instance(&self, _: &str) -> Result<InstanceGroupInfo> {
        Err(Error::NotSupported {
            operation: "InspectInstanceGroupForInstance".into(),
            reason: "auto-scaling groups are not managed by this operator".into(),
        })
    }

    async fn set_instance_group_size(&self, _: &str, _: u64, _: Option<Duration>) -> Result<()> {
        Err(Error::NotSupported {
            operation: "SetInstanceGroupSize".into(),
            reason: "auto-scaling groups are not managed by this operator".into(),
        })
    }

    async fn get_instance_group_size(&self, _: &str) -> Result<u64> {
        Err(Error::NotSupported {
            operation: "GetInstanceGroupSize".into(),
            reason: "auto-scaling groups are not managed by this operator".into(),
        })
    }

    async fn create(&self, template: &VolumeTemplate, labels: &Labels) -> Result<Volume> {
        self.validate_template(template)?;

        if self.client.find_volume_by_name(&template.name).await?.is_some() {
            return Err(Error::VolInval {
                reason: format!("volume named {} already exists", template.name),
            });
        }

        let merged = merge_labels(&template.labels, labels);
        let created = self.client.create_volume(template, merged).await?;
        info!(volume_id = %created.id, name = %template.name, "EBS volume create submitted");

        match self.wait_available(&created.id).await {
            Ok(volume) => Ok(volume),
            Err(err) => {
                // The server-side create may still land; roll it back and
                // surface the original failure.
                warn!(volume_id = %created.id, error = %err, "create failed, rolling back");
                if let Err(rollback) = self.client.delete_volume(&created.id).await {
                    warn!(volume_id = %created.id, error = %rollback, "rollback delete failed");
                }
                Err(err)
            }
        }
    }

    async fn delete(&self, volume_id: &str) -> Result<()> {
        match self.client.delete_volume(volume_id).await {
            Ok(()) => Ok(()),
            Err(Error::VolNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn attach(&self, volume_id: &str, _options: &Labels) -> Result<String> {
        let _guard = self.attach_lock.lock().await;

        let volume = self.client.describe_volume(volume_id).await?;
        match volume.managed_by() {
            Some(instance) if instance == self.config.instance_id => {
                debug!(volume_id, "volume already attached here");
            }
            Some(instance) => {
                return Err(Error::VolAttachedOnRemoteNode {
                    volume_id: volume_id.to_string(),
                    instance_id: instance.to_string(),
                });
            }
            None => {
                let device = self.select_device().await?;
                self.client
                    .attach_volume(volume_id, &self.config.instance_id, &device)
                    .await?;
            }
        }

        self.wait_attached(volume_id).await?;
        self.resolve_attached_path(volume_id).await
    }

    async fn detach(&self, volume_id: &str) -> Result<()> {
        self.detach_internal(volume_id, &self.config.instance_id).await
    }

    async fn detach_from(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        self.detach_internal(volume_id, instance_id).await
    }

    async fn expand(&self, volume_id: &str, new_size_gib: u64) -> Result<u64> {
        let volume = self.client.describe_volume(volume_id).await?;
        if volume.size_gib >= new_size_gib {
            return Ok(volume.size_gib);
        }

        self.client.modify_volume_size(volume_id, new_size_gib).await?;
        wait_for(
            "expand",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                let v = self.client.describe_volume(volume_id).await?;
                Ok((v.size_gib >= new_size_gib).then_some(v.size_gib))
            },
        )
        .await
    }

    async fn inspect(&self, volume_ids: &[String]) -> Result<Vec<Volume>> {
        if volume_ids.is_empty() {
            return self.client.describe_volumes().await;
        }
        let mut volumes = Vec::with_capacity(volume_ids.len());
        for id in volume_ids {
            volumes.push(self.client.describe_volume(id).await?);
        }
        Ok(volumes)
    }

    async fn enumerate(
        &self,
        volume_ids: &[String],
        labels: &Labels,
        set_identifier: &str,
    ) -> Result<BTreeMap<String, Vec<Volume>>> {
        let volumes = self
            .inspect(volume_ids)
            .await?
            .into_iter()
            .filter(|v| labels_match(v, labels))
            .collect();
        Ok(partition_by_set(volumes, set_identifier))
    }

    async fn device_mappings(&self) -> Result<BTreeMap<String, String>> {
        let attachments = self.client.attachments(&self.config.instance_id).await?;
        let mut mappings = BTreeMap::new();
        for (volume_id, _) in attachments {
            let path = self.resolve_attached_path(&volume_id).await?;
            mappings.insert(path, volume_id);
        }
        Ok(mappings)
    }

    async fn device_path(&self, volume_id: &str) -> Result<String> {
        let volume = self.client.describe_volume(volume_id).await?;
        match volume.managed_by() {
            None => Err(Error::VolDetached {
                volume_id: volume_id.to_string(),
            }),
            Some(instance) if instance != self.config.instance_id => {
                Err(Error::VolAttachedOnRemoteNode {
                    volume_id: volume_id.to_string(),
                    instance_id: instance.to_string(),
                })
            }
            Some(_) => self.resolve_attached_path(volume_id).await,
        }
    }

    async fn snapshot(&self, volume_id: &str, readonly: bool, labels: &Labels) -> Result<Snapshot> {
        if !readonly {
            return Err(Error::NotSupported {
                operation: "Snapshot".into(),
                reason: "EBS snapshots are always read-only".into(),
            });
        }

        let name = snapshot_name(volume_id, Utc::now());
        let snapshot = self.client.create_snapshot(volume_id, &name).await?;
        if !labels.is_empty() {
            self.client.create_tags(&snapshot.id, labels).await?;
        }

        let snapshot_id = snapshot.id.as_str();
        wait_for(
            "snapshot",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                let s = self.client.describe_snapshot(snapshot_id).await?;
                Ok((s.state == SnapshotState::Ready).then_some(s))
            },
        )
        .await
    }

    async fn snapshot_delete(&self, snapshot_id: &str) -> Result<()> {
        match self.client.delete_snapshot(snapshot_id).await {
            Ok(()) => Ok(()),
            Err(Error::VolNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn apply_tags(&self, volume_id: &str, labels: &Labels) -> Result<()> {
        self.client.create_tags(volume_id, labels).await
    }

    async fn remove_tags(&self, volume_id: &str, keys: &[String]) -> Result<()> {
        self.client.delete_tags(volume_id, keys).await
    }

    async fn tags(&self, volume_id: &str) -> Result<Labels> {
        self.client.describe_tags(volume_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::fixture::{exercise_protocol, FakeCloud};
    use crate::ops::retry::{RetryOps, RetryPolicy};
    use assert_matches::assert_matches;

    struct FakeEc2 {
        cloud: Arc<FakeCloud>,
    }

    #[async_trait]
    impl Ec2Api for FakeEc2 {
        async fn create_volume(&self, template: &VolumeTemplate, labels: Labels) -> Result<Volume> {
            self.cloud.create_volume(template, labels)
        }

        async fn delete_volume(&self, volume_id: &str) -> Result<()> {
            self.cloud.delete_volume(volume_id)
        }

        async fn describe_volume(&self, volume_id: &str) -> Result<Volume> {
            self.cloud.get_volume(volume_id)
        }

        async fn describe_volumes(&self) -> Result<Vec<Volume>> {
            self.cloud.list_volumes()
        }

        async fn find_volume_by_name(&self, name: &str) -> Result<Option<Volume>> {
            self.cloud.find_by_name(name)
        }

        async fn attach_volume(
            &self,
            volume_id: &str,
            instance_id: &str,
            device_name: &str,
        ) -> Result<()> {
            self.cloud.attach_volume(volume_id, instance_id, device_name)
        }

        async fn detach_volume(&self, volume_id: &str, instance_id: Option<&str>) -> Result<()> {
            self.cloud.detach_volume(volume_id, instance_id)
        }

        async fn modify_volume_size(&self, volume_id: &str, size_gib: u64) -> Result<()> {
            self.cloud.resize_volume(volume_id, size_gib)
        }

        async fn attachments(&self, instance_id: &str) -> Result<Vec<(String, String)>> {
            self.cloud.attachments_for_instance(instance_id)
        }

        async fn create_snapshot(&self, volume_id: &str, name: &str) -> Result<Snapshot> {
            self.cloud.create_snapshot(volume_id, name)
        }

        async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
            self.cloud.get_snapshot(snapshot_id)
        }

        async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
            self.cloud.delete_snapshot(snapshot_id)
        }

        async fn create_tags(&self, volume_id: &str, labels: &Labels) -> Result<()> {
            self.cloud.apply_tags(volume_id, labels)
        }

        async fn delete_tags(&self, volume_id: &str, keys: &[String]) -> Result<()> {
            self.cloud.remove_tags(volume_id, keys)
        }

        async fn describe_tags(&self, volume_id: &str) -> Result<Labels> {
            self.cloud.tags(volume_id)
        }

        async fn describe_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
            Ok(InstanceInfo {
                id: instance_id.to_string(),
                name: instance_id.to_string(),
                zone: "us-east-1a".into(),
                region: "us-east-1".into(),
                labels: Labels::new(),
            })
        }
    }

    fn test_ops_config(root: &std::path::Path) -> OpsConfig {
        OpsConfig {
            op_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            device_path_retries: 5,
            device_path_interval: Duration::from_millis(5),
            device_root: root.to_path_buf(),
            require_block_device: false,
        }
    }

    fn fake_stack(root: &std::path::Path) -> (Arc<FakeCloud>, AwsOps) {
        let device_root = root.to_path_buf();
        let cloud = Arc::new(FakeCloud::new(
            "aws",
            "vol",
            root,
            Vec::new(),
            Box::new(move |volume_id, _| {
                device_root.join(format!(
                    "disk/by-id/nvme-Amazon_Elastic_Block_Store_{}",
                    volume_id.replace('-', "")
                ))
            }),
        ));
        let ops = AwsOps::new(
            Arc::new(FakeEc2 {
                cloud: cloud.clone(),
            }),
            AwsConfig {
                instance_id: "i-0001".into(),
                region: "us-east-1".into(),
                zone: "us-east-1a".into(),
            },
            test_ops_config(root),
        );
        (cloud, ops)
    }

    fn template(name: &str) -> VolumeTemplate {
        VolumeTemplate {
            name: name.into(),
            size_gib: 16,
            drive_type: "gp3".into(),
            zone: "us-east-1a".into(),
            iops: None,
            labels: Labels::new(),
            shared: false,
        }
    }

    #[tokio::test]
    async fn test_full_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let (cloud, ops) = fake_stack(dir.path());
        exercise_protocol(&ops, &template("proto")).await.unwrap();
        // Two attach calls settled into exactly two mutations (one per
        // attach/detach round trip), not three.
        assert_eq!(cloud.attach_mutations(), 2);
    }

    #[tokio::test]
    async fn test_create_conflict_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());
        ops.create(&template("dup"), &Labels::new()).await.unwrap();
        let err = ops.create(&template("dup"), &Labels::new()).await.unwrap_err();
        assert_matches!(err, Error::VolInval { .. });
    }

    #[tokio::test]
    async fn test_create_validates_drive_type() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());
        let mut t = template("bad-type");
        t.drive_type = "floppy".into();
        assert_matches!(
            ops.create(&t, &Labels::new()).await.unwrap_err(),
            Error::VolInval { .. }
        );
    }

    #[tokio::test]
    async fn test_multi_attach_requires_provisioned_iops_type() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());

        let mut t = template("shared-gp3");
        t.shared = true;
        assert_matches!(
            ops.create(&t, &Labels::new()).await.unwrap_err(),
            Error::VolInval { .. }
        );

        let mut t = template("shared-io2");
        t.shared = true;
        t.drive_type = "io2".into();
        let volume = ops.create(&t, &Labels::new()).await.unwrap();
        assert!(volume.shared);
    }

    #[tokio::test]
    async fn test_attach_on_remote_node_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (cloud, ops) = fake_stack(dir.path());
        let volume = ops.create(&template("remote"), &Labels::new()).await.unwrap();
        cloud
            .attach_volume(&volume.id, "i-9999", "/dev/xvdf")
            .unwrap();

        let err = ops.attach(&volume.id, &Labels::new()).await.unwrap_err();
        assert_matches!(err, Error::VolAttachedOnRemoteNode { .. });
        let err = ops.device_path(&volume.id).await.unwrap_err();
        assert_matches!(err, Error::VolAttachedOnRemoteNode { .. });
    }

    #[tokio::test]
    async fn test_device_path_of_detached_volume() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());
        let volume = ops.create(&template("loose"), &Labels::new()).await.unwrap();
        assert_matches!(
            ops.device_path(&volume.id).await.unwrap_err(),
            Error::VolDetached { .. }
        );
    }

    #[tokio::test]
    async fn test_device_letters_increment() {
        let dir = tempfile::tempdir().unwrap();
        let (cloud, ops) = fake_stack(dir.path());
        let v1 = ops.create(&template("letters-1"), &Labels::new()).await.unwrap();
        let v2 = ops.create(&template("letters-2"), &Labels::new()).await.unwrap();
        ops.attach(&v1.id, &Labels::new()).await.unwrap();
        ops.attach(&v2.id, &Labels::new()).await.unwrap();

        let attachments = cloud.attachments_for_instance("i-0001").unwrap();
        let mut devices: Vec<String> = attachments.into_iter().map(|(_, d)| d).collect();
        devices.sort();
        assert_eq!(devices, vec!["/dev/xvdf", "/dev/xvdg"]);
    }

    #[tokio::test]
    async fn test_throttle_is_retried_by_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let (cloud, ops) = fake_stack(dir.path());
        let volume = ops.create(&template("throttle"), &Labels::new()).await.unwrap();

        cloud.inject_error(
            "resize_volume",
            Error::provider("aws", "RequestLimitExceeded", Some(503), "rate limited"),
        );

        let wrapped = RetryOps::new(
            Arc::new(fake_stack_ops_for(cloud.clone(), dir.path())),
            RetryPolicy {
                initial_delay: Duration::from_millis(1),
                factor: 2.0,
                max_retries: 3,
            },
            Arc::new(is_transient),
        );
        let size = wrapped.expand(&volume.id, 32).await.unwrap();
        assert_eq!(size, 32);
    }

    fn fake_stack_ops_for(cloud: Arc<FakeCloud>, root: &std::path::Path) -> AwsOps {
        AwsOps::new(
            Arc::new(FakeEc2 { cloud }),
            AwsConfig {
                instance_id: "i-0001".into(),
                region: "us-east-1".into(),
                zone: "us-east-1a".into(),
            },
            test_ops_config(root),
        )
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&Error::provider(
            "aws",
            "Throttling",
            Some(503),
            ""
        )));
        assert!(is_transient(&Error::provider(
            "aws",
            "SnapshotCreationPerVolumeRateExceeded",
            Some(400),
            ""
        )));
        assert!(!is_transient(&Error::provider(
            "aws",
            "AccessDenied",
            Some(403),
            ""
        )));
        assert!(!is_transient(&Error::NoCandidate));
    }
}
