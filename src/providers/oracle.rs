//! Oracle Block Volume Adapter
//!
//! Block volumes attach through explicit attachment objects; the adapter
//! keeps a `volume_id -> attachment_id` cache so detach does not need a
//! list round trip on the happy path, but the cache is always reconciled
//! against the provider's attachment list before a detach is submitted.
//! Device slots come from the provider-maintained free-device list
//! (`/dev/oracleoci/oraclevd*`); a device can be reserved between listing
//! and attach, so an in-use rejection moves to the next candidate.
//!
//! The canonical drive-type scheme is `pv-<vpus>` (volume performance
//! units).

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
use parking_lot::Mutex as SyncMutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub instance_id: String,
    pub compartment_id: String,
    pub availability_domain: String,
    pub region: String,
    pub tenancy: String,
}

fn env_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .or_else(|_| std::env::var(fallback))
        .ok()
}

impl OracleConfig {
    /// Reads `ORACLE_*` variables with `PX_ORACLE_*` fallbacks; tenancy and
    /// region are re-exported for the SDK client.
    pub fn from_env() -> Result<Self> {
        let instance_id = env_with_fallback("ORACLE_INSTANCE_ID", "PX_ORACLE_INSTANCE_ID")
            .ok_or_else(|| Error::Configuration("ORACLE_INSTANCE_ID is not set".into()))?;
        let compartment_id =
            env_with_fallback("ORACLE_COMPARTMENT_ID", "PX_ORACLE_COMPARTMENT_ID")
                .ok_or_else(|| Error::Configuration("ORACLE_COMPARTMENT_ID is not set".into()))?;
        let availability_domain = env_with_fallback(
            "ORACLE_AVAILABILITY_DOMAIN",
            "PX_ORACLE_AVAILABILITY_DOMAIN",
        )
        .unwrap_or_default();
        let region =
            env_with_fallback("ORACLE_REGION", "PX_ORACLE_REGION").unwrap_or_default();
        let tenancy =
            env_with_fallback("ORACLE_TENANCY", "PX_ORACLE_TENANCY").unwrap_or_default();

        if !region.is_empty() {
            std::env::set_var("OCI_REGION", &region);
        }
        if !tenancy.is_empty() {
            std::env::set_var("OCI_TENANCY", &tenancy);
        }

        Ok(Self {
            instance_id,
            compartment_id,
            availability_domain,
            region,
            tenancy,
        })
    }
}

// =============================================================================
// SDK Client Capability
// =============================================================================

/// One attachment object as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeAttachmentInfo {
    pub attachment_id: String,
    pub volume_id: String,
    pub device: String,
}

/// Opaque OCI client surface. HTTP 404 maps to [`Error::VolNotFound`].
#[async_trait]
pub trait OciApi: Send + Sync {
    async fn create_volume(&self, template: &VolumeTemplate, labels: Labels) -> Result<Volume>;
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;
    async fn get_volume(&self, volume_id: &str) -> Result<Volume>;
    async fn list_volumes(&self) -> Result<Vec<Volume>>;
    async fn find_volume_by_name(&self, name: &str) -> Result<Option<Volume>>;
    /// Attach at `device` and return the attachment id.
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
        shared: bool,
    ) -> Result<String>;
    async fn detach_attachment(&self, attachment_id: &str) -> Result<()>;
    async fn list_attachments(&self, instance_id: &str) -> Result<Vec<VolumeAttachmentInfo>>;
    /// Devices the provider considers free on the instance.
    async fn free_devices(&self, instance_id: &str) -> Result<Vec<String>>;
    async fn resize_volume(&self, volume_id: &str, size_gib: u64) -> Result<()>;
    async fn create_backup(&self, volume_id: &str, name: &str) -> Result<Snapshot>;
    async fn get_backup(&self, backup_id: &str) -> Result<Snapshot>;
    async fn delete_backup(&self, backup_id: &str) -> Result<()>;
    async fn update_tags(&self, volume_id: &str, labels: &Labels) -> Result<()>;
    async fn remove_tags(&self, volume_id: &str, keys: &[String]) -> Result<()>;
    async fn get_tags(&self, volume_id: &str) -> Result<Labels>;
    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo>;
}

/// OCI rate limits answer 429.
pub fn is_transient(err: &Error) -> bool {
    err.provider_status() == Some(429) || err.provider_code() == Some("TooManyRequests")
}

fn device_in_use(err: &Error) -> bool {
    err.provider_code() == Some("DeviceInUse")
}

// =============================================================================
// Adapter
// =============================================================================

pub struct OracleOps {
    client: Arc<dyn OciApi>,
    config: OracleConfig,
    ops: OpsConfig,
    /// Serializes attach/detach on this instance; free-device selection is
    /// read-then-attach and would race otherwise.
    attach_lock: Mutex<()>,
    /// volume_id -> attachment_id. An optimization only: reconciled against
    /// the provider list before every detach.
    attachment_cache: SyncMutex<HashMap<String, String>>,
}

impl OracleOps {
    pub fn new(client: Arc<dyn OciApi>, config: OracleConfig, ops: OpsConfig) -> Self {
        Self {
            client,
            config,
            ops,
            attach_lock: Mutex::new(()),
            attachment_cache: SyncMutex::new(HashMap::new()),
        }
    }

    fn predicted_path(&self, device: &str) -> PathBuf {
        let relative = device.strip_prefix("/dev/").unwrap_or(device);
        self.ops.device_root.join(relative)
    }

    async fn wait_available(&self, volume_id: &str) -> Result<Volume> {
        wait_for(
            "create",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                match self.client.get_volume(volume_id).await {
                    Ok(v) if v.state == VolumeState::Available => Ok(Some(v)),
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
                let volume = self.client.get_volume(volume_id).await?;
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
                match self.client.get_volume(volume_id).await {
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

    async fn resolve_device(&self, device: &str) -> Result<String> {
        let predicted = self.predicted_path(device);
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
        perf::oracle::compute_iops(&template.drive_type, template.size_gib, 0).map_err(|_| {
            Error::VolInval {
                reason: format!(
                    "drive type {} is not a pv-<vpus> performance tier",
                    template.drive_type
                ),
            }
        })?;
        Ok(())
    }

    /// Walk the provider's free-device list until an attach is accepted.
    async fn attach_free_device(&self, volume_id: &str, shared: bool) -> Result<String> {
        let devices = self.client.free_devices(&self.config.instance_id).await?;
        let mut last_err = None;
        for device in devices {
            match self
                .client
                .attach_volume(volume_id, &self.config.instance_id, &device, shared)
                .await
            {
                Ok(attachment_id) => {
                    self.attachment_cache
                        .lock()
                        .insert(volume_id.to_string(), attachment_id);
                    return Ok(device);
                }
                Err(e) if device_in_use(&e) => {
                    debug!(device, "device raced into use, trying next");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: "oracle",
            code: "NoFreeDevice".into(),
            status: None,
            message: "the instance has no free devices left".into(),
            detail: None,
        }))
    }

    /// Attachment id for a volume, from the cache when it agrees with the
    /// provider, otherwise from the provider list.
    async fn reconciled_attachment(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<Option<VolumeAttachmentInfo>> {
        let attachments = self.client.list_attachments(instance_id).await?;
        let actual = attachments.into_iter().find(|a| a.volume_id == volume_id);

        let mut cache = self.attachment_cache.lock();
        match &actual {
            Some(attachment) => {
                cache.insert(volume_id.to_string(), attachment.attachment_id.clone());
            }
            None => {
                cache.remove(volume_id);
            }
        }
        Ok(actual)
    }

    async fn detach_internal(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        let _guard = self.attach_lock.lock().await;

        let Some(attachment) = self.reconciled_attachment(volume_id, instance_id).await? else {
            debug!(volume_id, instance_id, "volume already detached");
            return Ok(());
        };

        match self.client.detach_attachment(&attachment.attachment_id).await {
            Ok(()) => {}
            Err(Error::VolNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.wait_detached(volume_id, instance_id).await?;
        self.attachment_cache.lock().remove(volume_id);
        Ok(())
    }
}

#[async_trait]
impl CloudOps for OracleOps {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    async fn inspect_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        self.client.get_instance(instance_id).await
    }

    async fn inspect_instance_group_for_instance(&self, _: &str) -> Result<InstanceGroupInfo> {
        Err(Error::NotSupported {
            operation: "InspectInstanceGroupForInstance".into(),
            reason: "instance pools are not managed by this operator".into(),
        })
    }

    async fn set_instance_group_size(&self, _: &str, _: u64, _: Option<Duration>) -> Result<()> {
        Err(Error::NotSupported {
            operation: "SetInstanceGroupSize".into(),
            reason: "instance pools are not managed by this operator".into(),
        })
    }

    async fn get_instance_group_size(&self, _: &str) -> Result<u64> {
        Err(Error::NotSupported {
            operation: "GetInstanceGroupSize".into(),
            reason: "instance pools are not managed by this operator".into(),
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
        info!(volume_id = %created.id, name = %template.name, "block volume create submitted");

        match self.wait_available(&created.id).await {
            Ok(volume) => Ok(volume),
            Err(err) => {
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

        let volume = self.client.get_volume(volume_id).await?;
        let device = match volume.managed_by() {
            Some(instance) if instance == self.config.instance_id => {
                let attachment = self
                    .reconciled_attachment(volume_id, instance)
                    .await?
                    .ok_or_else(|| Error::Internal(
                        format!("volume {volume_id} attached here without an attachment object"),
                    ))?;
                attachment.device
            }
            Some(instance) => {
                return Err(Error::VolAttachedOnRemoteNode {
                    volume_id: volume_id.to_string(),
                    instance_id: instance.to_string(),
                });
            }
            None => self.attach_free_device(volume_id, volume.shared).await?,
        };

        self.wait_attached(volume_id).await?;
        self.resolve_device(&device).await
    }

    async fn detach(&self, volume_id: &str) -> Result<()> {
        self.detach_internal(volume_id, &self.config.instance_id).await
    }

    async fn detach_from(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        self.detach_internal(volume_id, instance_id).await
    }

    async fn expand(&self, volume_id: &str, new_size_gib: u64) -> Result<u64> {
        let volume = self.client.get_volume(volume_id).await?;
        if volume.size_gib >= new_size_gib {
            return Ok(volume.size_gib);
        }

        self.client.resize_volume(volume_id, new_size_gib).await?;
        wait_for(
            "expand",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                let v = self.client.get_volume(volume_id).await?;
                Ok((v.size_gib >= new_size_gib).then_some(v.size_gib))
            },
        )
        .await
    }

    async fn inspect(&self, volume_ids: &[String]) -> Result<Vec<Volume>> {
        if volume_ids.is_empty() {
            return self.client.list_volumes().await;
        }
        let mut volumes = Vec::with_capacity(volume_ids.len());
        for id in volume_ids {
            volumes.push(self.client.get_volume(id).await?);
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
        let attachments = self.client.list_attachments(&self.config.instance_id).await?;
        let mut mappings = BTreeMap::new();
        for attachment in attachments {
            let path = self.resolve_device(&attachment.device).await?;
            mappings.insert(path, attachment.volume_id);
        }
        Ok(mappings)
    }

    async fn device_path(&self, volume_id: &str) -> Result<String> {
        let volume = self.client.get_volume(volume_id).await?;
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
            Some(instance) => {
                let attachment = self
                    .reconciled_attachment(volume_id, instance)
                    .await?
                    .ok_or_else(|| Error::InvalidDevicePath {
                        path: format!("no attachment object for volume {volume_id}"),
                    })?;
                self.resolve_device(&attachment.device).await
            }
        }
    }

    async fn snapshot(&self, volume_id: &str, readonly: bool, labels: &Labels) -> Result<Snapshot> {
        if !readonly {
            return Err(Error::NotSupported {
                operation: "Snapshot".into(),
                reason: "block-volume backups are always read-only".into(),
            });
        }

        let name = snapshot_name(volume_id, Utc::now());
        let backup = self.client.create_backup(volume_id, &name).await?;
        if !labels.is_empty() {
            self.client.update_tags(&backup.id, labels).await?;
        }

        let backup_id = backup.id.as_str();
        wait_for(
            "snapshot",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                let b = self.client.get_backup(backup_id).await?;
                Ok((b.state == SnapshotState::Ready).then_some(b))
            },
        )
        .await
    }

    async fn snapshot_delete(&self, backup_id: &str) -> Result<()> {
        match self.client.delete_backup(backup_id).await {
            Ok(()) => Ok(()),
            Err(Error::VolNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn apply_tags(&self, volume_id: &str, labels: &Labels) -> Result<()> {
        self.client.update_tags(volume_id, labels).await
    }

    async fn remove_tags(&self, volume_id: &str, keys: &[String]) -> Result<()> {
        self.client.remove_tags(volume_id, keys).await
    }

    async fn tags(&self, volume_id: &str) -> Result<Labels> {
        self.client.get_tags(volume_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================
