//! Azure Managed Disk Adapter
//!
//! Attach and detach go through the VM's data-disk array, a read-modify-
//! write structure; a process-wide mutex guards it so concurrent updates
//! never lose edits. Device slots are LUN indexes surfaced by the kernel at
//! `/dev/disk/azure/scsi1/lun<N>`.
//!
//! A known Azure failure mode is `AttachDiskWhileBeingDetached`: a previous
//! detach is still settling on the VM. The adapter detaches the stuck disk
//! best-effort and surfaces the original error so the retry wrapper can
//! re-drive the attach.

use crate::error::{Error, Result};
use crate::ops::device::wait_for_device_path;
use crate::ops::wait::wait_for;
use crate::ops::{
    labels_match, merge_labels, partition_by_set, snapshot_name, AttachmentState, CloudOps,
    InstanceGroupInfo, InstanceInfo, Labels, OpsConfig, Snapshot, SnapshotState, Volume,
    VolumeState, VolumeTemplate,
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

/// LUNs available for data disks.
const MAX_LUNS: u32 = 64;

/// Service code raised when a disk is attached while a detach is settling.
pub const ATTACH_WHILE_DETACHING: &str = "AttachDiskWhileBeingDetached";

/// The VM data-disk array is read-modify-write; every attach/detach in this
/// process serializes here.
static DATA_DISK_LOCK: Mutex<()> = Mutex::const_new(());

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub instance_id: String,
    pub scale_set_name: String,
    pub subscription_id: String,
    pub resource_group: String,
}

impl AzureConfig {
    /// Reads `AZURE_INSTANCE_ID`, `AZURE_SCALE_SET_NAME`,
    /// `AZURE_SUBSCRIPTION_ID` and `AZURE_RESOURCE_GROUP_NAME`; SDK auth
    /// variables stay with the SDK client.
    pub fn from_env() -> Result<Self> {
        let instance_id = std::env::var("AZURE_INSTANCE_ID")
            .map_err(|_| Error::Configuration("AZURE_INSTANCE_ID is not set".into()))?;
        let subscription_id = std::env::var("AZURE_SUBSCRIPTION_ID")
            .map_err(|_| Error::Configuration("AZURE_SUBSCRIPTION_ID is not set".into()))?;
        let resource_group = std::env::var("AZURE_RESOURCE_GROUP_NAME")
            .map_err(|_| Error::Configuration("AZURE_RESOURCE_GROUP_NAME is not set".into()))?;
        Ok(Self {
            instance_id,
            scale_set_name: std::env::var("AZURE_SCALE_SET_NAME").unwrap_or_default(),
            subscription_id,
            resource_group,
        })
    }
}

// =============================================================================
// SDK Client Capability
// =============================================================================

/// Opaque Compute/Disk client surface. HTTP 404 maps to
/// [`Error::VolNotFound`]; service errors carry their code and, where the
/// service provides one, a structured detail payload.
#[async_trait]
pub trait AzureDiskApi: Send + Sync {
    async fn create_disk(&self, template: &VolumeTemplate, labels: Labels) -> Result<Volume>;
    async fn delete_disk(&self, disk_id: &str) -> Result<()>;
    async fn get_disk(&self, disk_id: &str) -> Result<Volume>;
    async fn list_disks(&self) -> Result<Vec<Volume>>;
    async fn find_disk_by_name(&self, name: &str) -> Result<Option<Volume>>;
    /// Add the disk to the VM's data-disk array at `lun`.
    async fn vm_attach_disk(&self, instance_id: &str, disk_id: &str, lun: u32) -> Result<()>;
    /// Remove the disk from the VM's data-disk array.
    async fn vm_detach_disk(&self, instance_id: &str, disk_id: &str) -> Result<()>;
    /// `(disk_id, lun)` pairs in the VM's data-disk array.
    async fn vm_data_disks(&self, instance_id: &str) -> Result<Vec<(String, u32)>>;
    async fn resize_disk(&self, disk_id: &str, size_gib: u64) -> Result<()>;
    async fn create_snapshot(&self, disk_id: &str, name: &str) -> Result<Snapshot>;
    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;
    async fn update_tags(&self, disk_id: &str, labels: &Labels) -> Result<()>;
    async fn remove_tags(&self, disk_id: &str, keys: &[String]) -> Result<()>;
    async fn get_tags(&self, disk_id: &str) -> Result<Labels>;
    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo>;
    async fn get_scale_set(&self, name: &str) -> Result<InstanceGroupInfo>;
    async fn set_scale_set_capacity(&self, name: &str, count: u64) -> Result<()>;
}

/// HTTP 429 and the attach/detach race are worth re-driving.
pub fn is_transient(err: &Error) -> bool {
    err.provider_status() == Some(429) || err.provider_code() == Some(ATTACH_WHILE_DETACHING)
}

/// Disk name embedded in an `AttachDiskWhileBeingDetached` failure: the
/// structured detail when the service provides one, otherwise the token
/// following "disk" in the message.
pub fn stuck_disk_name(err: &Error) -> Option<String> {
    if err.provider_code() != Some(ATTACH_WHILE_DETACHING) {
        return None;
    }
    if let Some(detail) = err.provider_detail() {
        if !detail.is_empty() {
            return Some(detail.to_string());
        }
    }
    if let Error::Provider { message, .. } = err {
        let mut words = message.split_whitespace();
        while let Some(word) = words.next() {
            if word.eq_ignore_ascii_case("disk") {
                return words
                    .next()
                    .map(|w| w.trim_matches(|c| c == '\'' || c == '"' || c == '.').to_string());
            }
        }
    }
    None
}

// =============================================================================
// Adapter
// =============================================================================

pub struct AzureOps {
    client: Arc<dyn AzureDiskApi>,
    config: AzureConfig,
    ops: OpsConfig,
}

impl AzureOps {
    pub fn new(client: Arc<dyn AzureDiskApi>, config: AzureConfig, ops: OpsConfig) -> Self {
        Self {
            client,
            config,
            ops,
        }
    }

    fn predicted_path(&self, lun: u32) -> PathBuf {
        self.ops
            .device_root
            .join(format!("disk/azure/scsi1/lun{lun}"))
    }

    /// Smallest LUN not present in the VM's data-disk array.
    async fn select_lun(&self) -> Result<u32> {
        let disks = self.client.vm_data_disks(&self.config.instance_id).await?;
        let used: Vec<u32> = disks.into_iter().map(|(_, lun)| lun).collect();
        (0..MAX_LUNS)
            .find(|lun| !used.contains(lun))
            .ok_or_else(|| Error::Provider {
                provider: "azure",
                code: "NoFreeLun".into(),
                status: None,
                message: "all data-disk LUNs are in use".into(),
                detail: None,
            })
    }

    async fn attached_lun(&self, disk_id: &str) -> Result<Option<u32>> {
        let disks = self.client.vm_data_disks(&self.config.instance_id).await?;
        Ok(disks.into_iter().find(|(id, _)| id == disk_id).map(|(_, lun)| lun))
    }

    async fn wait_available(&self, disk_id: &str) -> Result<Volume> {
        wait_for(
            "create",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                match self.client.get_disk(disk_id).await {
                    Ok(v) if v.state == VolumeState::Available => Ok(Some(v)),
                    Ok(_) | Err(Error::VolNotFound { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    async fn wait_attached(&self, disk_id: &str) -> Result<()> {
        wait_for(
            "attach",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                let disk = self.client.get_disk(disk_id).await?;
                match disk.attachment {
                    Some(a) if a.state == AttachmentState::Attached => Ok(Some(())),
                    _ => Ok(None),
                }
            },
        )
        .await
    }

    async fn wait_detached(&self, disk_id: &str, instance_id: &str) -> Result<()> {
        wait_for(
            "detach",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                match self.client.get_disk(disk_id).await {
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

    async fn resolve_lun_path(&self, lun: u32) -> Result<String> {
        let predicted = self.predicted_path(lun);
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
                reason: "disk name must be set".into(),
            });
        }
        if template.size_gib == 0 {
            return Err(Error::VolInval {
                reason: "disk size must be positive".into(),
            });
        }
        perf::azure::compute_iops(
            &template.drive_type,
            template.size_gib,
            template.iops.unwrap_or(0),
        )
        .map_err(|_| Error::VolInval {
            reason: format!("unknown managed-disk SKU {}", template.drive_type),
        })?;
        if template.shared
            && !matches!(
                template.drive_type.as_str(),
                "Premium_LRS" | "Premium_ZRS" | "UltraSSD_LRS" | "PremiumV2_LRS"
            )
        {
            return Err(Error::VolInval {
                reason: "shared disks require a premium or ultra SKU".into(),
            });
        }
        Ok(())
    }

    /// Best-effort detach of the disk blocking our attach, then surface the
    /// original error for the retry wrapper.
    async fn remediate_stuck_attach(&self, original: Error) -> Error {
        let Some(stuck_name) = stuck_disk_name(&original) else {
            return original;
        };
        warn!(stuck_disk = %stuck_name, "attach blocked by detaching disk, remediating");
        match self.client.find_disk_by_name(&stuck_name).await {
            Ok(Some(stuck)) => {
                if let Err(e) = self
                    .client
                    .vm_detach_disk(&self.config.instance_id, &stuck.id)
                    .await
                {
                    warn!(stuck_disk = %stuck_name, error = %e, "remediation detach failed");
                }
            }
            Ok(None) => debug!(stuck_disk = %stuck_name, "stuck disk no longer exists"),
            Err(e) => warn!(stuck_disk = %stuck_name, error = %e, "stuck disk lookup failed"),
        }
        original
    }

    async fn detach_internal(&self, disk_id: &str, instance_id: &str) -> Result<()> {
        let _guard = DATA_DISK_LOCK.lock().await;

        let disks = self.client.vm_data_disks(instance_id).await?;
        if !disks.iter().any(|(id, _)| id == disk_id) {
            debug!(disk_id, instance_id, "disk not in the data-disk array");
            return Ok(());
        }

        match self.client.vm_detach_disk(instance_id, disk_id).await {
            Ok(()) => {}
            Err(Error::VolNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.wait_detached(disk_id, instance_id).await
    }
}

#[async_trait]
impl CloudOps for AzureOps {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    async fn inspect_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        self.client.get_instance(instance_id).await
    }

    async fn inspect_instance_group_for_instance(
        &self,
        _instance_id: &str,
    ) -> Result<InstanceGroupInfo> {
        if self.config.scale_set_name.is_empty() {
            return Err(Error::NotSupported {
                operation: "InspectInstanceGroupForInstance".into(),
                reason: "instance is not part of a scale set".into(),
            });
        }
        self.client.get_scale_set(&self.config.scale_set_name).await
    }

    async fn set_instance_group_size(
        &self,
        group_id: &str,
        count: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.client.set_scale_set_capacity(group_id, count).await?;
        let deadline = timeout.unwrap_or(self.ops.op_timeout);
        wait_for("scale-set-resize", deadline, self.ops.poll_interval, || async move {
            let group = self.client.get_scale_set(group_id).await?;
            Ok((group.count == count).then_some(()))
        })
        .await
    }

    async fn get_instance_group_size(&self, group_id: &str) -> Result<u64> {
        Ok(self.client.get_scale_set(group_id).await?.count)
    }

    async fn create(&self, template: &VolumeTemplate, labels: &Labels) -> Result<Volume> {
        self.validate_template(template)?;

        if self.client.find_disk_by_name(&template.name).await?.is_some() {
            return Err(Error::VolInval {
                reason: format!("disk named {} already exists", template.name),
            });
        }

        let merged = merge_labels(&template.labels, labels);
        let created = self.client.create_disk(template, merged).await?;
        info!(disk_id = %created.id, name = %template.name, "managed disk create submitted");

        match self.wait_available(&created.id).await {
            Ok(volume) => Ok(volume),
            Err(err) => {
                warn!(disk_id = %created.id, error = %err, "create failed, rolling back");
                if let Err(rollback) = self.client.delete_disk(&created.id).await {
                    warn!(disk_id = %created.id, error = %rollback, "rollback delete failed");
                }
                Err(err)
            }
        }
    }

    async fn delete(&self, disk_id: &str) -> Result<()> {
        match self.client.delete_disk(disk_id).await {
            Ok(()) => Ok(()),
            Err(Error::VolNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn attach(&self, disk_id: &str, _options: &Labels) -> Result<String> {
        let _guard = DATA_DISK_LOCK.lock().await;

        let disk = self.client.get_disk(disk_id).await?;
        let lun = match disk.managed_by() {
            Some(instance) if instance == self.config.instance_id => {
                self.attached_lun(disk_id).await?.ok_or_else(|| Error::Internal(
                    format!("disk {disk_id} attached here but missing from the data-disk array"),
                ))?
            }
            Some(instance) => {
                return Err(Error::VolAttachedOnRemoteNode {
                    volume_id: disk_id.to_string(),
                    instance_id: instance.to_string(),
                });
            }
            None => {
                let lun = self.select_lun().await?;
                if let Err(err) = self
                    .client
                    .vm_attach_disk(&self.config.instance_id, disk_id, lun)
                    .await
                {
                    return Err(self.remediate_stuck_attach(err).await);
                }
                lun
            }
        };

        self.wait_attached(disk_id).await?;
        self.resolve_lun_path(lun).await
    }

    async fn detach(&self, disk_id: &str) -> Result<()> {
        self.detach_internal(disk_id, &self.config.instance_id).await
    }

    async fn detach_from(&self, disk_id: &str, instance_id: &str) -> Result<()> {
        self.detach_internal(disk_id, instance_id).await
    }

    async fn expand(&self, disk_id: &str, new_size_gib: u64) -> Result<u64> {
        let disk = self.client.get_disk(disk_id).await?;
        if disk.size_gib >= new_size_gib {
            return Ok(disk.size_gib);
        }

        self.client.resize_disk(disk_id, new_size_gib).await?;
        wait_for(
            "expand",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                let d = self.client.get_disk(disk_id).await?;
                Ok((d.size_gib >= new_size_gib).then_some(d.size_gib))
            },
        )
        .await
    }

    async fn inspect(&self, volume_ids: &[String]) -> Result<Vec<Volume>> {
        if volume_ids.is_empty() {
            return self.client.list_disks().await;
        }
        let mut volumes = Vec::with_capacity(volume_ids.len());
        for id in volume_ids {
            volumes.push(self.client.get_disk(id).await?);
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
        let disks = self.client.vm_data_disks(&self.config.instance_id).await?;
        let mut mappings = BTreeMap::new();
        for (disk_id, lun) in disks {
            let path = self.resolve_lun_path(lun).await?;
            mappings.insert(path, disk_id);
        }
        Ok(mappings)
    }

    async fn device_path(&self, disk_id: &str) -> Result<String> {
        let disk = self.client.get_disk(disk_id).await?;
        match disk.managed_by() {
            None => Err(Error::VolDetached {
                volume_id: disk_id.to_string(),
            }),
            Some(instance) if instance != self.config.instance_id => {
                Err(Error::VolAttachedOnRemoteNode {
                    volume_id: disk_id.to_string(),
                    instance_id: instance.to_string(),
                })
            }
            Some(_) => {
                let lun = self.attached_lun(disk_id).await?.ok_or_else(|| {
                    Error::InvalidDevicePath {
                        path: format!("no LUN recorded for disk {disk_id}"),
                    }
                })?;
                self.resolve_lun_path(lun).await
            }
        }
    }

    async fn snapshot(&self, disk_id: &str, readonly: bool, labels: &Labels) -> Result<Snapshot> {
        if !readonly {
            return Err(Error::NotSupported {
                operation: "Snapshot".into(),
                reason: "managed-disk snapshots are always read-only".into(),
            });
        }

        let name = snapshot_name(disk_id, Utc::now());
        let snapshot = self.client.create_snapshot(disk_id, &name).await?;
        if !labels.is_empty() {
            self.client.update_tags(&snapshot.id, labels).await?;
        }

        let snapshot_id = snapshot.id.as_str();
        wait_for(
            "snapshot",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                let s = self.client.get_snapshot(snapshot_id).await?;
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

    async fn apply_tags(&self, disk_id: &str, labels: &Labels) -> Result<()> {
        self.client.update_tags(disk_id, labels).await
    }

    async fn remove_tags(&self, disk_id: &str, keys: &[String]) -> Result<()> {
        self.client.remove_tags(disk_id, keys).await
    }

    async fn tags(&self, disk_id: &str) -> Result<Labels> {
        self.client.get_tags(disk_id).await
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

    struct FakeAzure {
        cloud: Arc<FakeCloud>,
    }

    #[async_trait]
    impl AzureDiskApi for FakeAzure {
        async fn create_disk(&self, template: &VolumeTemplate, labels: Labels) -> Result<Volume> {
            self.cloud.create_volume(template, labels)
        }

        async fn delete_disk(&self, disk_id: &str) -> Result<()> {
            self.cloud.delete_volume(disk_id)
        }

        async fn get_disk(&self, disk_id: &str) -> Result<Volume> {
            self.cloud.get_volume(disk_id)
        }

        async fn list_disks(&self) -> Result<Vec<Volume>> {
            self.cloud.list_volumes()
        }

        async fn find_disk_by_name(&self, name: &str) -> Result<Option<Volume>> {
            self.cloud.find_by_name(name)
        }

        async fn vm_attach_disk(&self, instance_id: &str, disk_id: &str, lun: u32) -> Result<()> {
            self.cloud
                .attach_volume(disk_id, instance_id, &lun.to_string())
        }

        async fn vm_detach_disk(&self, instance_id: &str, disk_id: &str) -> Result<()> {
            self.cloud.detach_volume(disk_id, Some(instance_id))
        }

        async fn vm_data_disks(&self, instance_id: &str) -> Result<Vec<(String, u32)>> {
            Ok(self
                .cloud
                .attachments_for_instance(instance_id)?
                .into_iter()
                .filter_map(|(id, device)| device.parse().ok().map(|lun| (id, lun)))
                .collect())
        }

        async fn resize_disk(&self, disk_id: &str, size_gib: u64) -> Result<()> {
            self.cloud.resize_volume(disk_id, size_gib)
        }

        async fn create_snapshot(&self, disk_id: &str, name: &str) -> Result<Snapshot> {
            self.cloud.create_snapshot(disk_id, name)
        }

        async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
            self.cloud.get_snapshot(snapshot_id)
        }

        async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
            self.cloud.delete_snapshot(snapshot_id)
        }

        async fn update_tags(&self, disk_id: &str, labels: &Labels) -> Result<()> {
            self.cloud.apply_tags(disk_id, labels)
        }

        async fn remove_tags(&self, disk_id: &str, keys: &[String]) -> Result<()> {
            self.cloud.remove_tags(disk_id, keys)
        }

        async fn get_tags(&self, disk_id: &str) -> Result<Labels> {
            self.cloud.tags(disk_id)
        }

        async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
            Ok(InstanceInfo {
                id: instance_id.to_string(),
                name: instance_id.to_string(),
                zone: "1".into(),
                region: "eastus".into(),
                labels: Labels::new(),
            })
        }

        async fn get_scale_set(&self, name: &str) -> Result<InstanceGroupInfo> {
            Ok(InstanceGroupInfo {
                id: name.to_string(),
                name: name.to_string(),
                zones: vec!["1".into()],
                count: self.cloud.get_group_size(name)?,
            })
        }

        async fn set_scale_set_capacity(&self, name: &str, count: u64) -> Result<()> {
            self.cloud.set_group_size(name, count)
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

    fn fake_stack(root: &std::path::Path) -> (Arc<FakeCloud>, AzureOps) {
        let device_root = root.to_path_buf();
        let cloud = Arc::new(FakeCloud::new(
            "azure",
            "disk",
            root,
            Vec::new(),
            Box::new(move |_, device| device_root.join(format!("disk/azure/scsi1/lun{device}"))),
        ));
        let ops = AzureOps::new(
            Arc::new(FakeAzure {
                cloud: cloud.clone(),
            }),
            AzureConfig {
                instance_id: "vm-0".into(),
                scale_set_name: "nodes".into(),
                subscription_id: "sub".into(),
                resource_group: "rg".into(),
            },
            test_ops_config(root),
        );
        (cloud, ops)
    }

    fn template(name: &str) -> VolumeTemplate {
        VolumeTemplate {
            name: name.into(),
            size_gib: 64,
            drive_type: "Premium_LRS".into(),
            zone: "1".into(),
            iops: None,
            labels: Labels::new(),
            shared: false,
        }
    }

    #[tokio::test]
    async fn test_full_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());
        exercise_protocol(&ops, &template("proto")).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_disk_requires_premium_sku() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());

        let mut t = template("shared-hdd");
        t.shared = true;
        t.drive_type = "Standard_LRS".into();
        assert_matches!(
            ops.create(&t, &Labels::new()).await.unwrap_err(),
            Error::VolInval { .. }
        );

        let mut t = template("shared-premium");
        t.shared = true;
        let volume = ops.create(&t, &Labels::new()).await.unwrap();
        assert!(volume.shared);
    }

    #[tokio::test]
    async fn test_lun_selection_takes_smallest_free() {
        let dir = tempfile::tempdir().unwrap();
        let (cloud, ops) = fake_stack(dir.path());
        let v1 = ops.create(&template("lun-a"), &Labels::new()).await.unwrap();
        let v2 = ops.create(&template("lun-b"), &Labels::new()).await.unwrap();

        let p1 = ops.attach(&v1.id, &Labels::new()).await.unwrap();
        let p2 = ops.attach(&v2.id, &Labels::new()).await.unwrap();
        assert!(p1.ends_with("fake-0"), "{p1}");
        assert!(p2.ends_with("fake-1"), "{p2}");

        // Freeing LUN 0 makes it the next pick again.
        ops.detach(&v1.id).await.unwrap();
        let v3 = ops.create(&template("lun-c"), &Labels::new()).await.unwrap();
        ops.attach(&v3.id, &Labels::new()).await.unwrap();
        let luns: Vec<String> = cloud
            .attachments_for_instance("vm-0")
            .unwrap()
            .into_iter()
            .map(|(_, lun)| lun)
            .collect();
        assert!(luns.contains(&"0".to_string()));
        assert!(luns.contains(&"1".to_string()));
    }

    #[tokio::test]
    async fn test_stuck_disk_is_remediated_and_error_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let (cloud, ops) = fake_stack(dir.path());

        let stuck = ops.create(&template("stuck-disk"), &Labels::new()).await.unwrap();
        ops.attach(&stuck.id, &Labels::new()).await.unwrap();

        let victim = ops.create(&template("victim"), &Labels::new()).await.unwrap();
        cloud.inject_error(
            "attach_volume",
            Error::Provider {
                provider: "azure",
                code: ATTACH_WHILE_DETACHING.into(),
                status: Some(409),
                message: "cannot attach while another disk is being detached".into(),
                detail: Some("stuck-disk".into()),
            },
        );

        let err = ops.attach(&victim.id, &Labels::new()).await.unwrap_err();
        assert_matches!(err, Error::Provider { .. });
        assert_eq!(err.provider_code(), Some(ATTACH_WHILE_DETACHING));

        // Remediation submitted a detach for the stuck disk; once it
        // settles the retry succeeds.
        let path = ops.attach(&victim.id, &Labels::new()).await.unwrap();
        assert!(!path.is_empty());
        let stuck_state = ops.inspect(&[stuck.id.clone()]).await.unwrap();
        assert!(stuck_state[0].attachment.is_none());
    }

    #[tokio::test]
    async fn test_retry_wrapper_redrives_stuck_attach() {
        let dir = tempfile::tempdir().unwrap();
        let (cloud, ops) = fake_stack(dir.path());

        let stuck = ops.create(&template("stuck-2"), &Labels::new()).await.unwrap();
        ops.attach(&stuck.id, &Labels::new()).await.unwrap();
        let victim = ops.create(&template("victim-2"), &Labels::new()).await.unwrap();

        cloud.inject_error(
            "attach_volume",
            Error::Provider {
                provider: "azure",
                code: ATTACH_WHILE_DETACHING.into(),
                status: Some(409),
                message: "cannot attach while disk stuck-2 is being detached".into(),
                detail: None,
            },
        );

        let wrapped = RetryOps::new(
            Arc::new(AzureOps::new(
                Arc::new(FakeAzure {
                    cloud: cloud.clone(),
                }),
                AzureConfig {
                    instance_id: "vm-0".into(),
                    scale_set_name: "nodes".into(),
                    subscription_id: "sub".into(),
                    resource_group: "rg".into(),
                },
                test_ops_config(dir.path()),
            )),
            RetryPolicy {
                initial_delay: Duration::from_millis(1),
                factor: 2.0,
                max_retries: 3,
            },
            Arc::new(is_transient),
        );

        let path = wrapped.attach(&victim.id, &Labels::new()).await.unwrap();
        assert!(!path.is_empty());
    }

    #[tokio::test]
    async fn test_scale_set_resize() {
        let dir = tempfile::tempdir().unwrap();
        let (cloud, ops) = fake_stack(dir.path());
        cloud.set_group_size("nodes", 3).unwrap();

        assert_eq!(ops.get_instance_group_size("nodes").await.unwrap(), 3);
        ops.set_instance_group_size("nodes", 5, None).await.unwrap();
        assert_eq!(ops.get_instance_group_size("nodes").await.unwrap(), 5);

        let group = ops.inspect_instance_group_for_instance("vm-0").await.unwrap();
        assert_eq!(group.count, 5);
    }

    #[test]
    fn test_stuck_disk_name_extraction() {
        let structured = Error::Provider {
            provider: "azure",
            code: ATTACH_WHILE_DETACHING.into(),
            status: Some(409),
            message: "conflict".into(),
            detail: Some("data-disk-7".into()),
        };
        assert_eq!(stuck_disk_name(&structured).as_deref(), Some("data-disk-7"));

        let message_only = Error::Provider {
            provider: "azure",
            code: ATTACH_WHILE_DETACHING.into(),
            status: Some(409),
            message: "cannot attach while disk 'data-disk-9' is being detached".into(),
            detail: None,
        };
        assert_eq!(stuck_disk_name(&message_only).as_deref(), Some("data-disk-9"));

        let other = Error::provider("azure", "Conflict", Some(409), "disk busy");
        assert_eq!(stuck_disk_name(&other), None);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&Error::provider("azure", "TooManyRequests", Some(429), "")));
        assert!(is_transient(&Error::provider(
            "azure",
            ATTACH_WHILE_DETACHING,
            Some(409),
            ""
        )));
        assert!(!is_transient(&Error::provider("azure", "NotFound", Some(404), "")));
    }
}
