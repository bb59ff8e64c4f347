//! GCE Persistent Disk Adapter
//!
//! Compute Engine mutations are long-running operations; every mutating
//! call returns an operation reference the adapter polls to `DONE` before
//! checking the resource lifecycle. Device slots are device names chosen
//! from the instance's free list, surfaced by the kernel at
//! `/dev/disk/by-id/google-<name>`; a name can be reserved but not yet in
//! use, so attach walks the candidates until one is accepted.

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

/// Candidate device names tried per attach before giving up.
const MAX_DEVICE_CANDIDATES: usize = 16;

/// Metadata service root when running on GCE.
pub const METADATA_BASE_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct GceConfig {
    /// Instance name; GCE addresses instances by name within a zone.
    pub instance_name: String,
    pub zone: String,
    pub project: String,
}

impl GceConfig {
    /// Environment fallback when the metadata service is unreachable.
    pub fn from_env() -> Result<Self> {
        let instance_name = std::env::var("GCE_INSTANCE_NAME")
            .map_err(|_| Error::Configuration("GCE_INSTANCE_NAME is not set".into()))?;
        let zone = std::env::var("GCE_INSTANCE_ZONE")
            .map_err(|_| Error::Configuration("GCE_INSTANCE_ZONE is not set".into()))?;
        let project = std::env::var("GCE_INSTANCE_PROJECT")
            .map_err(|_| Error::Configuration("GCE_INSTANCE_PROJECT is not set".into()))?;
        Ok(Self {
            instance_name,
            zone,
            project,
        })
    }

    /// Ask the metadata service who we are, falling back to the
    /// `GCE_INSTANCE_*` variables off-platform.
    pub async fn discover(base_url: &str) -> Result<Self> {
        match Self::from_metadata(base_url).await {
            Ok(config) => Ok(config),
            Err(err) => {
                debug!(error = %err, "metadata service unavailable, using environment");
                Self::from_env()
            }
        }
    }

    async fn from_metadata(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        let fetch = |path: &'static str| {
            let client = client.clone();
            let url = format!("{base_url}/{path}");
            async move {
                let text = client
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                Ok::<String, Error>(text)
            }
        };

        let instance_name = fetch("instance/name").await?;
        // The metadata zone is "projects/<num>/zones/<zone>".
        let zone_path = fetch("instance/zone").await?;
        let zone = zone_path
            .rsplit('/')
            .next()
            .unwrap_or(zone_path.as_str())
            .to_string();
        let project = fetch("project/project-id").await?;
        Ok(Self {
            instance_name,
            zone,
            project,
        })
    }
}

// =============================================================================
// SDK Client Capability
// =============================================================================

/// State of a Compute Engine long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Done,
    Failed(String),
}

/// Opaque Compute Engine client surface. Mutations return an operation
/// name; HTTP 404 maps to [`Error::VolNotFound`].
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn insert_disk(&self, template: &VolumeTemplate, labels: Labels) -> Result<(Volume, String)>;
    async fn delete_disk(&self, disk_id: &str) -> Result<String>;
    async fn get_disk(&self, disk_id: &str) -> Result<Volume>;
    async fn list_disks(&self) -> Result<Vec<Volume>>;
    async fn find_disk_by_name(&self, name: &str) -> Result<Option<Volume>>;
    async fn attach_disk(
        &self,
        instance_name: &str,
        disk_id: &str,
        device_name: &str,
    ) -> Result<String>;
    async fn detach_disk(&self, instance_name: &str, device_name: &str) -> Result<String>;
    async fn resize_disk(&self, disk_id: &str, size_gib: u64) -> Result<String>;
    /// Device names currently present on the instance.
    async fn instance_device_names(&self, instance_name: &str) -> Result<Vec<String>>;
    /// `(disk_id, device_name)` pairs attached to the instance.
    async fn instance_disks(&self, instance_name: &str) -> Result<Vec<(String, String)>>;
    async fn get_operation(&self, operation: &str) -> Result<OperationStatus>;
    async fn create_snapshot(&self, disk_id: &str, name: &str) -> Result<Snapshot>;
    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;
    async fn set_labels(&self, disk_id: &str, labels: &Labels) -> Result<()>;
    async fn remove_labels(&self, disk_id: &str, keys: &[String]) -> Result<()>;
    async fn get_labels(&self, disk_id: &str) -> Result<Labels>;
    async fn get_instance(&self, instance_name: &str) -> Result<InstanceInfo>;
    async fn instance_group_for_instance(&self, instance_name: &str) -> Result<InstanceGroupInfo>;
    async fn get_instance_group(&self, group_id: &str) -> Result<InstanceGroupInfo>;
    async fn resize_instance_group(&self, group_id: &str, count: u64) -> Result<String>;
}

/// Compute Engine rate limits answer 429.
pub fn is_transient(err: &Error) -> bool {
    err.provider_status() == Some(429)
}

fn device_in_use(err: &Error) -> bool {
    matches!(err.provider_code(), Some("DeviceInUse") | Some("alreadyInUse"))
}

// =============================================================================
// Adapter
// =============================================================================

pub struct GceOps {
    client: Arc<dyn ComputeApi>,
    config: GceConfig,
    ops: OpsConfig,
    /// Serializes attach/detach on this instance so concurrent callers
    /// never race for the same device name.
    attach_lock: Mutex<()>,
}

impl GceOps {
    pub fn new(client: Arc<dyn ComputeApi>, config: GceConfig, ops: OpsConfig) -> Self {
        Self {
            client,
            config,
            ops,
            attach_lock: Mutex::new(()),
        }
    }

    fn predicted_path(&self, device_name: &str) -> PathBuf {
        self.ops
            .device_root
            .join(format!("disk/by-id/google-{device_name}"))
    }

    async fn wait_operation(&self, operation: &str) -> Result<()> {
        wait_for(
            "operation",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                match self.client.get_operation(operation).await? {
                    OperationStatus::Done => Ok(Some(())),
                    OperationStatus::Pending => Ok(None),
                    OperationStatus::Failed(message) => Err(Error::Provider {
                        provider: "gce",
                        code: "OperationFailed".into(),
                        status: None,
                        message,
                        detail: None,
                    }),
                }
            },
        )
        .await
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

    async fn wait_detached(&self, disk_id: &str, instance: &str) -> Result<()> {
        wait_for(
            "detach",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                match self.client.get_disk(disk_id).await {
                    Ok(v) => match v.attachment {
                        Some(a) if a.instance_id == instance => Ok(None),
                        _ => Ok(Some(())),
                    },
                    Err(Error::VolNotFound { .. }) => Ok(Some(())),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    async fn resolve_device(&self, device_name: &str) -> Result<String> {
        let predicted = self.predicted_path(device_name);
        let resolved = wait_for_device_path(
            &predicted,
            self.ops.device_path_retries,
            self.ops.device_path_interval,
            self.ops.require_block_device,
        )
        .await?;
        Ok(resolved.display().to_string())
    }

    /// Walk free device-name candidates until the provider accepts one.
    /// A candidate can be reserved between our listing and the attach call;
    /// an in-use rejection moves to the next candidate.
    async fn attach_free_device(&self, disk_id: &str) -> Result<String> {
        let used = self
            .client
            .instance_device_names(&self.config.instance_name)
            .await?;
        let mut last_err = None;
        let mut tried = 0usize;
        for index in 0.. {
            if tried >= MAX_DEVICE_CANDIDATES {
                break;
            }
            let candidate = format!("persistent-disk-{index}");
            if used.contains(&candidate) {
                continue;
            }
            tried += 1;
            match self
                .client
                .attach_disk(&self.config.instance_name, disk_id, &candidate)
                .await
            {
                Ok(operation) => {
                    self.wait_operation(&operation).await?;
                    return Ok(candidate);
                }
                Err(e) if device_in_use(&e) => {
                    debug!(candidate, "device name raced into use, trying next");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: "gce",
            code: "NoFreeDevice".into(),
            status: None,
            message: "no attachable device name found".into(),
            detail: None,
        }))
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
        perf::gce::compute_iops(
            &template.drive_type,
            template.size_gib,
            template.iops.unwrap_or(0),
        )
        .map_err(|_| Error::VolInval {
            reason: format!("unknown persistent-disk type {}", template.drive_type),
        })?;
        if template.shared && template.drive_type != "pd-ssd" {
            return Err(Error::VolInval {
                reason: "multi-writer mode requires a pd-ssd disk".into(),
            });
        }
        Ok(())
    }

    async fn device_name_of(&self, disk_id: &str) -> Result<Option<String>> {
        let disks = self.client.instance_disks(&self.config.instance_name).await?;
        Ok(disks
            .into_iter()
            .find(|(id, _)| id == disk_id)
            .map(|(_, device)| device))
    }

    async fn detach_internal(&self, disk_id: &str, instance: &str) -> Result<()> {
        let _guard = self.attach_lock.lock().await;

        let disks = self.client.instance_disks(instance).await?;
        let Some((_, device_name)) = disks.into_iter().find(|(id, _)| id == disk_id) else {
            debug!(disk_id, instance, "disk not attached");
            return Ok(());
        };

        match self.client.detach_disk(instance, &device_name).await {
            Ok(operation) => self.wait_operation(&operation).await?,
            Err(Error::VolNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.wait_detached(disk_id, instance).await
    }
}

#[async_trait]
impl CloudOps for GceOps {
    fn name(&self) -> &'static str {
        "gce"
    }

    fn instance_id(&self) -> &str {
        &self.config.instance_name
    }

    async fn inspect_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        self.client.get_instance(instance_id).await
    }

    async fn inspect_instance_group_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<InstanceGroupInfo> {
        self.client.instance_group_for_instance(instance_id).await
    }

    async fn set_instance_group_size(
        &self,
        group_id: &str,
        count: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let operation = self.client.resize_instance_group(group_id, count).await?;
        self.wait_operation(&operation).await?;
        let deadline = timeout.unwrap_or(self.ops.op_timeout);
        wait_for("group-resize", deadline, self.ops.poll_interval, || async move {
            let group = self.client.get_instance_group(group_id).await?;
            Ok((group.count == count).then_some(()))
        })
        .await
    }

    async fn get_instance_group_size(&self, group_id: &str) -> Result<u64> {
        Ok(self.client.get_instance_group(group_id).await?.count)
    }

    async fn create(&self, template: &VolumeTemplate, labels: &Labels) -> Result<Volume> {
        self.validate_template(template)?;

        if self.client.find_disk_by_name(&template.name).await?.is_some() {
            return Err(Error::VolInval {
                reason: format!("disk named {} already exists", template.name),
            });
        }

        let merged = merge_labels(&template.labels, labels);
        let (created, operation) = self.client.insert_disk(template, merged).await?;
        info!(disk_id = %created.id, name = %template.name, "persistent disk create submitted");

        let outcome = async {
            self.wait_operation(&operation).await?;
            self.wait_available(&created.id).await
        }
        .await;

        match outcome {
            Ok(volume) => Ok(volume),
            Err(err) => {
                warn!(disk_id = %created.id, error = %err, "create failed, rolling back");
                match self.client.delete_disk(&created.id).await {
                    Ok(op) => {
                        if let Err(rollback) = self.wait_operation(&op).await {
                            warn!(disk_id = %created.id, error = %rollback, "rollback wait failed");
                        }
                    }
                    Err(rollback) => {
                        warn!(disk_id = %created.id, error = %rollback, "rollback delete failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn delete(&self, disk_id: &str) -> Result<()> {
        match self.client.delete_disk(disk_id).await {
            Ok(operation) => self.wait_operation(&operation).await,
            Err(Error::VolNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn attach(&self, disk_id: &str, _options: &Labels) -> Result<String> {
        let _guard = self.attach_lock.lock().await;

        let disk = self.client.get_disk(disk_id).await?;
        let device_name = match disk.managed_by() {
            Some(instance) if instance == self.config.instance_name => self
                .device_name_of(disk_id)
                .await?
                .ok_or_else(|| Error::Internal(
                    format!("disk {disk_id} attached here but missing from the instance"),
                ))?,
            Some(instance) => {
                return Err(Error::VolAttachedOnRemoteNode {
                    volume_id: disk_id.to_string(),
                    instance_id: instance.to_string(),
                });
            }
            None => self.attach_free_device(disk_id).await?,
        };

        self.wait_attached(disk_id).await?;
        self.resolve_device(&device_name).await
    }

    async fn detach(&self, disk_id: &str) -> Result<()> {
        self.detach_internal(disk_id, &self.config.instance_name).await
    }

    async fn detach_from(&self, disk_id: &str, instance_id: &str) -> Result<()> {
        self.detach_internal(disk_id, instance_id).await
    }

    async fn expand(&self, disk_id: &str, new_size_gib: u64) -> Result<u64> {
        let disk = self.client.get_disk(disk_id).await?;
        if disk.size_gib >= new_size_gib {
            return Ok(disk.size_gib);
        }

        let operation = self.client.resize_disk(disk_id, new_size_gib).await?;
        self.wait_operation(&operation).await?;
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
        let disks = self.client.instance_disks(&self.config.instance_name).await?;
        let mut mappings = BTreeMap::new();
        for (disk_id, device_name) in disks {
            let path = self.resolve_device(&device_name).await?;
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
            Some(instance) if instance != self.config.instance_name => {
                Err(Error::VolAttachedOnRemoteNode {
                    volume_id: disk_id.to_string(),
                    instance_id: instance.to_string(),
                })
            }
            Some(_) => {
                let device_name = self.device_name_of(disk_id).await?.ok_or_else(|| {
                    Error::InvalidDevicePath {
                        path: format!("no device name recorded for disk {disk_id}"),
                    }
                })?;
                self.resolve_device(&device_name).await
            }
        }
    }

    async fn snapshot(&self, disk_id: &str, readonly: bool, labels: &Labels) -> Result<Snapshot> {
        if !readonly {
            return Err(Error::NotSupported {
                operation: "Snapshot".into(),
                reason: "persistent-disk snapshots are always read-only".into(),
            });
        }

        let name = snapshot_name(disk_id, Utc::now());
        let snapshot = self.client.create_snapshot(disk_id, &name).await?;
        if !labels.is_empty() {
            self.client.set_labels(&snapshot.id, labels).await?;
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
        self.client.set_labels(disk_id, labels).await
    }

    async fn remove_tags(&self, disk_id: &str, keys: &[String]) -> Result<()> {
        self.client.remove_labels(disk_id, keys).await
    }

    async fn tags(&self, disk_id: &str) -> Result<Labels> {
        self.client.get_labels(disk_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================
