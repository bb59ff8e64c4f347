//! vSphere VMDK Adapter
//!
//! vCenter connection objects age out, so a session is acquired at the
//! boundary of every public method and the `VirtualMachine` handle is
//! refreshed before any mutation. When the target datastore is a datastore
//! cluster (storage pod), Storage DRS is consulted with the prospective
//! disk's spec and the top-ranked concrete datastore is used.
//!
//! Device slots come from the VM's free-device list; a slot can be
//! reserved between our listing and the reconfigure, so an in-use
//! rejection moves to the next candidate.
//!
//! The template's `zone` carries the datastore (or storage pod) name;
//! vSphere has no availability zones. Snapshots of raw VMDKs and
//! multi-writer sharing are not offered through this protocol.

use crate::error::{Error, Result};
use crate::ops::device::wait_for_device_path;
use crate::ops::wait::wait_for;
use crate::ops::{
    labels_match, merge_labels, partition_by_set, AttachmentState, CloudOps, InstanceGroupInfo,
    InstanceInfo, Labels, OpsConfig, Snapshot, Volume, VolumeState, VolumeTemplate,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Disk provisioning formats vCenter accepts.
const DISK_FORMATS: &[&str] = &["thin", "zeroedthick", "eagerzeroedthick", "lazyzeroedthick"];

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct VsphereConfig {
    pub vcenter_host: String,
    pub vcenter_port: u16,
    pub user: String,
    pub password: String,
    pub insecure: bool,
    /// BIOS UUID of the VM this operator runs in.
    pub vm_uuid: String,
    /// Datastore or storage-pod name used when a template names none.
    pub default_datastore: String,
}

impl VsphereConfig {
    pub fn from_env() -> Result<Self> {
        let vcenter_host = std::env::var("VSPHERE_VCENTER")
            .map_err(|_| Error::Configuration("VSPHERE_VCENTER is not set".into()))?;
        let user = std::env::var("VSPHERE_USER")
            .map_err(|_| Error::Configuration("VSPHERE_USER is not set".into()))?;
        let password = std::env::var("VSPHERE_PWD")
            .map_err(|_| Error::Configuration("VSPHERE_PWD is not set".into()))?;
        let vm_uuid = std::env::var("VSPHERE_VM_UUID")
            .map_err(|_| Error::Configuration("VSPHERE_VM_UUID is not set".into()))?;
        let vcenter_port = std::env::var("VSPHERE_VCENTER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(443);
        let insecure = std::env::var("VSPHERE_INSECURE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        Ok(Self {
            vcenter_host,
            vcenter_port,
            user,
            password,
            insecure,
            vm_uuid,
            default_datastore: std::env::var("VSPHERE_DATASTORE").unwrap_or_default(),
        })
    }
}

// =============================================================================
// SDK Client Capability
// =============================================================================

/// Spec handed to Storage DRS when asking for a placement recommendation.
#[derive(Debug, Clone)]
pub struct DiskSpec {
    pub size_gib: u64,
    pub format: String,
}

/// One live vCenter session. Short-lived: acquired per public method.
#[async_trait]
pub trait VimSession: Send + Sync {
    /// Refresh the VM handle; connection objects age out.
    async fn find_vm(&self, vm_uuid: &str) -> Result<String>;
    async fn is_storage_pod(&self, name: &str) -> Result<bool>;
    /// Top-ranked concrete datastore for the prospective disk.
    async fn recommend_datastore(&self, pod: &str, spec: &DiskSpec) -> Result<String>;
    async fn create_disk(
        &self,
        datastore: &str,
        template: &VolumeTemplate,
        labels: Labels,
    ) -> Result<Volume>;
    async fn delete_disk(&self, disk_id: &str) -> Result<()>;
    async fn get_disk(&self, disk_id: &str) -> Result<Volume>;
    async fn list_disks(&self) -> Result<Vec<Volume>>;
    async fn find_disk_by_name(&self, name: &str) -> Result<Option<Volume>>;
    /// Device slots the VM can still take, as the wwn nodes they will
    /// surface under `/dev/disk/by-id`.
    async fn free_devices(&self, vm_ref: &str) -> Result<Vec<String>>;
    /// Reconfigure the VM to add the disk at `device`.
    async fn attach_disk(&self, vm_ref: &str, disk_id: &str, device: &str) -> Result<()>;
    async fn detach_disk(&self, vm_ref: &str, disk_id: &str) -> Result<()>;
    /// `(disk_id, device wwn)` pairs in the VM's virtual device list.
    async fn vm_disks(&self, vm_ref: &str) -> Result<Vec<(String, String)>>;
    async fn resize_disk(&self, disk_id: &str, size_gib: u64) -> Result<()>;
    async fn set_attributes(&self, disk_id: &str, labels: &Labels) -> Result<()>;
    async fn remove_attributes(&self, disk_id: &str, keys: &[String]) -> Result<()>;
    async fn get_attributes(&self, disk_id: &str) -> Result<Labels>;
    async fn vm_info(&self, vm_ref: &str) -> Result<InstanceInfo>;
}

/// Connection factory; every public adapter method acquires a fresh
/// session through it.
#[async_trait]
pub trait VsphereApi: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn VimSession>>;
}

/// vCenter throttling surfaces as 429 from the REST endpoints.
pub fn is_transient(err: &Error) -> bool {
    err.provider_status() == Some(429)
}

fn device_in_use(err: &Error) -> bool {
    err.provider_code() == Some("DeviceInUse")
}

// =============================================================================
// Adapter
// =============================================================================

pub struct VsphereOps {
    api: Arc<dyn VsphereApi>,
    config: VsphereConfig,
    ops: OpsConfig,
    /// Serializes attach/detach: both edit the VM's virtual device list.
    reconfigure_lock: Mutex<()>,
}

impl VsphereOps {
    pub fn new(api: Arc<dyn VsphereApi>, config: VsphereConfig, ops: OpsConfig) -> Self {
        Self {
            api,
            config,
            ops,
            reconfigure_lock: Mutex::new(()),
        }
    }

    fn predicted_path(&self, device: &str) -> PathBuf {
        self.ops.device_root.join(format!("disk/by-id/{device}"))
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
        if !DISK_FORMATS.contains(&template.drive_type.as_str()) {
            return Err(Error::VolInval {
                reason: format!("unknown disk format {}", template.drive_type),
            });
        }
        if template.shared {
            return Err(Error::NotSupported {
                operation: "Create".into(),
                reason: "multi-writer VMDK sharing is not offered through this protocol".into(),
            });
        }
        Ok(())
    }

    /// Resolve the target datastore, consulting Storage DRS when the name
    /// refers to a datastore cluster.
    async fn placement(
        &self,
        session: &Arc<dyn VimSession>,
        template: &VolumeTemplate,
    ) -> Result<String> {
        let requested = if template.zone.is_empty() {
            self.config.default_datastore.clone()
        } else {
            template.zone.clone()
        };
        if requested.is_empty() {
            return Err(Error::VolInval {
                reason: "no datastore named in the template or configuration".into(),
            });
        }

        if session.is_storage_pod(&requested).await? {
            let spec = DiskSpec {
                size_gib: template.size_gib,
                format: template.drive_type.clone(),
            };
            let recommended = session.recommend_datastore(&requested, &spec).await?;
            debug!(pod = %requested, datastore = %recommended, "storage DRS recommendation");
            return Ok(recommended);
        }
        Ok(requested)
    }

    async fn wait_available(
        &self,
        session: &Arc<dyn VimSession>,
        disk_id: &str,
    ) -> Result<Volume> {
        wait_for(
            "create",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                match session.get_disk(disk_id).await {
                    Ok(v) if v.state == VolumeState::Available => Ok(Some(v)),
                    Ok(_) | Err(Error::VolNotFound { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    async fn wait_attached(&self, session: &Arc<dyn VimSession>, disk_id: &str) -> Result<()> {
        wait_for(
            "attach",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                let disk = session.get_disk(disk_id).await?;
                match disk.attachment {
                    Some(a) if a.state == AttachmentState::Attached => Ok(Some(())),
                    _ => Ok(None),
                }
            },
        )
        .await
    }

    async fn wait_detached(
        &self,
        session: &Arc<dyn VimSession>,
        disk_id: &str,
        vm_ref: &str,
    ) -> Result<()> {
        wait_for(
            "detach",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                match session.get_disk(disk_id).await {
                    Ok(v) => match v.attachment {
                        Some(a) if a.instance_id == vm_ref => Ok(None),
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

    /// Walk the VM's free device slots until a reconfigure is accepted.
    async fn attach_free_device(
        &self,
        session: &Arc<dyn VimSession>,
        vm_ref: &str,
        disk_id: &str,
    ) -> Result<String> {
        let devices = session.free_devices(vm_ref).await?;
        let mut last_err = None;
        for device in devices {
            match session.attach_disk(vm_ref, disk_id, &device).await {
                Ok(()) => return Ok(device),
                Err(e) if device_in_use(&e) => {
                    debug!(device, "device slot raced into use, trying next");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: "vsphere",
            code: "NoFreeDevice".into(),
            status: None,
            message: "the VM has no free device slots left".into(),
            detail: None,
        }))
    }

    async fn detach_internal(&self, disk_id: &str, vm_uuid_override: Option<&str>) -> Result<()> {
        let _guard = self.reconfigure_lock.lock().await;
        let session = self.api.connect().await?;
        let vm_uuid = vm_uuid_override.unwrap_or(&self.config.vm_uuid);
        let vm_ref = session.find_vm(vm_uuid).await?;

        let disks = session.vm_disks(&vm_ref).await?;
        if !disks.iter().any(|(id, _)| id == disk_id) {
            debug!(disk_id, vm_ref, "disk not in the virtual device list");
            return Ok(());
        }

        match session.detach_disk(&vm_ref, disk_id).await {
            Ok(()) => {}
            Err(Error::VolNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.wait_detached(&session, disk_id, &vm_ref).await
    }
}

#[async_trait]
impl CloudOps for VsphereOps {
    fn name(&self) -> &'static str {
        "vsphere"
    }

    fn instance_id(&self) -> &str {
        &self.config.vm_uuid
    }

    async fn inspect_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        let session = self.api.connect().await?;
        let vm_ref = session.find_vm(instance_id).await?;
        session.vm_info(&vm_ref).await
    }

    async fn inspect_instance_group_for_instance(&self, _: &str) -> Result<InstanceGroupInfo> {
        Err(Error::NotSupported {
            operation: "InspectInstanceGroupForInstance".into(),
            reason: "vSphere exposes no instance-group primitive".into(),
        })
    }

    async fn set_instance_group_size(&self, _: &str, _: u64, _: Option<Duration>) -> Result<()> {
        Err(Error::NotSupported {
            operation: "SetInstanceGroupSize".into(),
            reason: "vSphere exposes no instance-group primitive".into(),
        })
    }

    async fn get_instance_group_size(&self, _: &str) -> Result<u64> {
        Err(Error::NotSupported {
            operation: "GetInstanceGroupSize".into(),
            reason: "vSphere exposes no instance-group primitive".into(),
        })
    }

    async fn create(&self, template: &VolumeTemplate, labels: &Labels) -> Result<Volume> {
        self.validate_template(template)?;
        let session = self.api.connect().await?;

        if session.find_disk_by_name(&template.name).await?.is_some() {
            return Err(Error::VolInval {
                reason: format!("disk named {} already exists", template.name),
            });
        }

        let datastore = self.placement(&session, template).await?;
        let merged = merge_labels(&template.labels, labels);
        let created = session.create_disk(&datastore, template, merged).await?;
        info!(disk_id = %created.id, name = %template.name, datastore = %datastore, "VMDK create submitted");

        match self.wait_available(&session, &created.id).await {
            Ok(volume) => Ok(volume),
            Err(err) => {
                warn!(disk_id = %created.id, error = %err, "create failed, rolling back");
                if let Err(rollback) = session.delete_disk(&created.id).await {
                    warn!(disk_id = %created.id, error = %rollback, "rollback delete failed");
                }
                Err(err)
            }
        }
    }

    async fn delete(&self, disk_id: &str) -> Result<()> {
        let session = self.api.connect().await?;
        match session.delete_disk(disk_id).await {
            Ok(()) => Ok(()),
            Err(Error::VolNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn attach(&self, disk_id: &str, _options: &Labels) -> Result<String> {
        let _guard = self.reconfigure_lock.lock().await;
        let session = self.api.connect().await?;
        let vm_ref = session.find_vm(&self.config.vm_uuid).await?;

        let disk = session.get_disk(disk_id).await?;
        let device = match disk.managed_by() {
            Some(vm) if vm == vm_ref => {
                let disks = session.vm_disks(&vm_ref).await?;
                disks
                    .into_iter()
                    .find(|(id, _)| id == disk_id)
                    .map(|(_, device)| device)
                    .ok_or_else(|| Error::Internal(
                        format!("disk {disk_id} attached here but missing from the device list"),
                    ))?
            }
            Some(vm) => {
                return Err(Error::VolAttachedOnRemoteNode {
                    volume_id: disk_id.to_string(),
                    instance_id: vm.to_string(),
                });
            }
            None => self.attach_free_device(&session, &vm_ref, disk_id).await?,
        };

        self.wait_attached(&session, disk_id).await?;
        self.resolve_device(&device).await
    }

    async fn detach(&self, disk_id: &str) -> Result<()> {
        self.detach_internal(disk_id, None).await
    }

    async fn detach_from(&self, disk_id: &str, instance_id: &str) -> Result<()> {
        self.detach_internal(disk_id, Some(instance_id)).await
    }

    async fn expand(&self, disk_id: &str, new_size_gib: u64) -> Result<u64> {
        let session = self.api.connect().await?;
        let disk = session.get_disk(disk_id).await?;
        if disk.size_gib >= new_size_gib {
            return Ok(disk.size_gib);
        }

        session.resize_disk(disk_id, new_size_gib).await?;
        let session = &session;
        wait_for(
            "expand",
            self.ops.op_timeout,
            self.ops.poll_interval,
            || async move {
                let d = session.get_disk(disk_id).await?;
                Ok((d.size_gib >= new_size_gib).then_some(d.size_gib))
            },
        )
        .await
    }

    async fn inspect(&self, volume_ids: &[String]) -> Result<Vec<Volume>> {
        let session = self.api.connect().await?;
        if volume_ids.is_empty() {
            return session.list_disks().await;
        }
        let mut volumes = Vec::with_capacity(volume_ids.len());
        for id in volume_ids {
            volumes.push(session.get_disk(id).await?);
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
        let session = self.api.connect().await?;
        let vm_ref = session.find_vm(&self.config.vm_uuid).await?;
        let disks = session.vm_disks(&vm_ref).await?;
        let mut mappings = BTreeMap::new();
        for (disk_id, device) in disks {
            let path = self.resolve_device(&device).await?;
            mappings.insert(path, disk_id);
        }
        Ok(mappings)
    }

    async fn device_path(&self, disk_id: &str) -> Result<String> {
        let session = self.api.connect().await?;
        let vm_ref = session.find_vm(&self.config.vm_uuid).await?;
        let disk = session.get_disk(disk_id).await?;
        match disk.managed_by() {
            None => Err(Error::VolDetached {
                volume_id: disk_id.to_string(),
            }),
            Some(vm) if vm != vm_ref => Err(Error::VolAttachedOnRemoteNode {
                volume_id: disk_id.to_string(),
                instance_id: vm.to_string(),
            }),
            Some(_) => {
                let disks = session.vm_disks(&vm_ref).await?;
                let device = disks
                    .into_iter()
                    .find(|(id, _)| id == disk_id)
                    .map(|(_, device)| device)
                    .ok_or_else(|| Error::InvalidDevicePath {
                        path: format!("no device recorded for disk {disk_id}"),
                    })?;
                self.resolve_device(&device).await
            }
        }
    }

    async fn snapshot(&self, _: &str, _: bool, _: &Labels) -> Result<Snapshot> {
        Err(Error::NotSupported {
            operation: "Snapshot".into(),
            reason: "raw VMDK snapshots are not offered through this protocol".into(),
        })
    }

    async fn snapshot_delete(&self, _: &str) -> Result<()> {
        Ok(())
    }

    async fn apply_tags(&self, disk_id: &str, labels: &Labels) -> Result<()> {
        let session = self.api.connect().await?;
        session.set_attributes(disk_id, labels).await
    }

    async fn remove_tags(&self, disk_id: &str, keys: &[String]) -> Result<()> {
        let session = self.api.connect().await?;
        session.remove_attributes(disk_id, keys).await
    }

    async fn tags(&self, disk_id: &str) -> Result<Labels> {
        let session = self.api.connect().await?;
        session.get_attributes(disk_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::fixture::{exercise_protocol, FakeCloud};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeVim {
        cloud: Arc<FakeCloud>,
        pods: Vec<String>,
    }

    #[async_trait]
    impl VimSession for FakeVim {
        async fn find_vm(&self, vm_uuid: &str) -> Result<String> {
            Ok(format!("vm-ref-{vm_uuid}"))
        }

        async fn is_storage_pod(&self, name: &str) -> Result<bool> {
            Ok(self.pods.contains(&name.to_string()))
        }

        async fn recommend_datastore(&self, pod: &str, _spec: &DiskSpec) -> Result<String> {
            Ok(format!("{pod}-member-1"))
        }

        async fn create_disk(
            &self,
            datastore: &str,
            template: &VolumeTemplate,
            labels: Labels,
        ) -> Result<Volume> {
            let mut template = template.clone();
            template.zone = datastore.to_string();
            self.cloud.create_volume(&template, labels)
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

        async fn free_devices(&self, vm_ref: &str) -> Result<Vec<String>> {
            self.cloud.free_devices(vm_ref)
        }

        async fn attach_disk(&self, vm_ref: &str, disk_id: &str, device: &str) -> Result<()> {
            self.cloud.attach_volume(disk_id, vm_ref, device)
        }

        async fn detach_disk(&self, vm_ref: &str, disk_id: &str) -> Result<()> {
            self.cloud.detach_volume(disk_id, Some(vm_ref))
        }

        async fn vm_disks(&self, vm_ref: &str) -> Result<Vec<(String, String)>> {
            self.cloud.attachments_for_instance(vm_ref)
        }

        async fn resize_disk(&self, disk_id: &str, size_gib: u64) -> Result<()> {
            self.cloud.resize_volume(disk_id, size_gib)
        }

        async fn set_attributes(&self, disk_id: &str, labels: &Labels) -> Result<()> {
            self.cloud.apply_tags(disk_id, labels)
        }

        async fn remove_attributes(&self, disk_id: &str, keys: &[String]) -> Result<()> {
            self.cloud.remove_tags(disk_id, keys)
        }

        async fn get_attributes(&self, disk_id: &str) -> Result<Labels> {
            self.cloud.tags(disk_id)
        }

        async fn vm_info(&self, vm_ref: &str) -> Result<InstanceInfo> {
            Ok(InstanceInfo {
                id: vm_ref.to_string(),
                name: vm_ref.to_string(),
                zone: "ds-1".into(),
                region: "dc-1".into(),
                labels: Labels::new(),
            })
        }
    }

    struct FakeVsphereApi {
        cloud: Arc<FakeCloud>,
        pods: Vec<String>,
        connects: AtomicU32,
    }

    #[async_trait]
    impl VsphereApi for FakeVsphereApi {
        async fn connect(&self) -> Result<Arc<dyn VimSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeVim {
                cloud: self.cloud.clone(),
                pods: self.pods.clone(),
            }))
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

    fn fake_stack(root: &std::path::Path) -> (Arc<FakeVsphereApi>, VsphereOps) {
        let device_root = root.to_path_buf();
        let cloud = Arc::new(FakeCloud::new(
            "vsphere",
            "vmdk",
            root,
            vec![
                "wwn-0x6000c29000000a01".into(),
                "wwn-0x6000c29000000a02".into(),
            ],
            Box::new(move |_, device| device_root.join(format!("disk/by-id/{device}"))),
        ));
        let api = Arc::new(FakeVsphereApi {
            cloud,
            pods: vec!["pod-1".into()],
            connects: AtomicU32::new(0),
        });
        let ops = VsphereOps::new(
            api.clone(),
            VsphereConfig {
                vcenter_host: "vc.local".into(),
                vcenter_port: 443,
                user: "admin".into(),
                password: "secret".into(),
                insecure: true,
                vm_uuid: "4213-aaaa".into(),
                default_datastore: "ds-1".into(),
            },
            test_ops_config(root),
        );
        (api, ops)
    }

    fn template(name: &str) -> VolumeTemplate {
        VolumeTemplate {
            name: name.into(),
            size_gib: 200,
            drive_type: "thin".into(),
            zone: String::new(),
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
    async fn test_every_public_method_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let (api, ops) = fake_stack(dir.path());

        let volume = ops.create(&template("conn"), &Labels::new()).await.unwrap();
        let after_create = api.connects.load(Ordering::SeqCst);
        assert!(after_create >= 1);

        ops.attach(&volume.id, &Labels::new()).await.unwrap();
        ops.detach(&volume.id).await.unwrap();
        ops.delete(&volume.id).await.unwrap();
        // One fresh session per public call, never a cached one.
        assert_eq!(api.connects.load(Ordering::SeqCst), after_create + 3);
    }

    #[tokio::test]
    async fn test_concurrent_attaches_pick_distinct_devices() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());

        let v1 = ops.create(&template("slot-1"), &Labels::new()).await.unwrap();
        let v2 = ops.create(&template("slot-2"), &Labels::new()).await.unwrap();
        let v3 = ops.create(&template("slot-3"), &Labels::new()).await.unwrap();

        let labels_a = Labels::new();
        let labels_b = Labels::new();
        let (a, b) = tokio::join!(ops.attach(&v1.id, &labels_a), ops.attach(&v2.id, &labels_b),);
        let path_a = a.unwrap();
        let path_b = b.unwrap();
        assert_ne!(path_a, path_b);

        // Both device slots are taken; a third attach finds nothing.
        let err = ops.attach(&v3.id, &Labels::new()).await.unwrap_err();
        assert_matches!(err, Error::Provider { .. });
    }

    #[tokio::test]
    async fn test_device_slot_race_moves_to_next_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let (api, ops) = fake_stack(dir.path());

        let volume = ops.create(&template("race"), &Labels::new()).await.unwrap();
        // The first slot is claimed between listing and the reconfigure.
        api.cloud.inject_error(
            "attach_volume",
            Error::provider("vsphere", "DeviceInUse", Some(409), "unit already assigned"),
        );

        let path = ops.attach(&volume.id, &Labels::new()).await.unwrap();
        assert!(path.ends_with("fake-wwn-0x6000c29000000a02"), "{path}");
    }

    #[tokio::test]
    async fn test_shared_template_is_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());
        let mut t = template("multi-writer");
        t.shared = true;
        let err = ops.create(&t, &Labels::new()).await.unwrap_err();
        assert!(err.is_not_supported());
    }

    #[tokio::test]
    async fn test_storage_pod_uses_drs_recommendation() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());

        let mut t = template("pod-disk");
        t.zone = "pod-1".into();
        let volume = ops.create(&t, &Labels::new()).await.unwrap();
        assert_eq!(volume.zone, "pod-1-member-1");
    }

    #[tokio::test]
    async fn test_plain_datastore_skips_drs() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());
        let volume = ops.create(&template("plain"), &Labels::new()).await.unwrap();
        assert_eq!(volume.zone, "ds-1");
    }

    #[tokio::test]
    async fn test_snapshot_is_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());
        let err = ops.snapshot("vmdk-1", true, &Labels::new()).await.unwrap_err();
        assert!(err.is_not_supported());
    }

    #[tokio::test]
    async fn test_unknown_disk_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, ops) = fake_stack(dir.path());
        let mut t = template("format");
        t.drive_type = "sparse".into();
        assert_matches!(
            ops.create(&t, &Labels::new()).await.unwrap_err(),
            Error::VolInval { .. }
        );
    }
}
