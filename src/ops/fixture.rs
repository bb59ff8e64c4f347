//! Protocol conformance fixture
//!
//! [`FakeCloud`] simulates one provider's control plane: volumes and
//! snapshots with lifecycle lag, attachment settling, device symlink
//! creation under a configurable root, and one-shot error injection. The
//! per-provider adapter tests back their SDK-client traits with it, and
//! [`exercise_protocol`] drives any [`CloudOps`] implementation through the
//! full volume lifecycle.
//!
//! Lifecycle lags are deliberate: a freshly created volume stays invisible
//! for one poll and a submitted attach reports `attaching` before
//! `attached`, so adapters that skip the waiter primitives fail here.

use crate::error::{Error, Result};
use crate::ops::{
    Attachment, AttachmentState, CloudOps, Labels, Snapshot, SnapshotState, Volume,
    VolumeState, VolumeTemplate,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

/// Predicts the symlink location an adapter will look for after an attach.
pub type LinkPathFn = Box<dyn Fn(&str, &str) -> PathBuf + Send + Sync>;

// =============================================================================
// Fake Provider State
// =============================================================================

struct FakeVolume {
    volume: Volume,
    /// Polls during which lookups still miss the volume (eventual
    /// consistency between create and inspect).
    visibility_lag: u32,
    /// Polls before `creating` settles to `available`.
    creating_lag: u32,
    /// Polls before a submitted attach/detach settles.
    attachment_lag: u32,
}

struct FakeSnapshot {
    snapshot: Snapshot,
    creating_lag: u32,
}

#[derive(Default)]
struct FakeState {
    volumes: BTreeMap<String, FakeVolume>,
    snapshots: BTreeMap<String, FakeSnapshot>,
    groups: BTreeMap<String, u64>,
    next_id: u64,
    attach_mutations: u64,
}

/// In-memory provider control plane used by adapter tests.
pub struct FakeCloud {
    provider: &'static str,
    id_prefix: &'static str,
    device_root: PathBuf,
    device_pool: Vec<String>,
    link_path: LinkPathFn,
    state: Mutex<FakeState>,
    injected: Mutex<BTreeMap<String, VecDeque<Error>>>,
}

impl FakeCloud {
    pub fn new(
        provider: &'static str,
        id_prefix: &'static str,
        device_root: &Path,
        device_pool: Vec<String>,
        link_path: LinkPathFn,
    ) -> Self {
        Self {
            provider,
            id_prefix,
            device_root: device_root.to_path_buf(),
            device_pool,
            link_path,
            state: Mutex::new(FakeState::default()),
            injected: Mutex::new(BTreeMap::new()),
        }
    }

    /// Queue an error returned by the next call to `op`.
    pub fn inject_error(&self, op: &str, err: Error) {
        self.injected
            .lock()
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    fn take_injected(&self, op: &str) -> Result<()> {
        if let Some(queue) = self.injected.lock().get_mut(op) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Attach mutations observed so far; attach idempotence tests read this.
    pub fn attach_mutations(&self) -> u64 {
        self.state.lock().attach_mutations
    }

    fn not_found(volume_id: &str) -> Error {
        Error::VolNotFound {
            volume_id: volume_id.to_string(),
        }
    }

    /// Advance one volume's lifecycle by one observation.
    fn step(&self, fake: &mut FakeVolume) {
        if fake.creating_lag > 0 {
            fake.creating_lag -= 1;
            if fake.creating_lag == 0 {
                fake.volume.state = VolumeState::Available;
            }
        }
        let mut settled_attach: Option<Attachment> = None;
        let mut clear_attachment = false;
        if let Some(attachment) = fake.volume.attachment.as_mut() {
            if fake.attachment_lag > 0 {
                fake.attachment_lag -= 1;
                if fake.attachment_lag == 0 {
                    match attachment.state {
                        AttachmentState::Attaching => {
                            attachment.state = AttachmentState::Attached;
                            settled_attach = Some(attachment.clone());
                        }
                        AttachmentState::Detaching => clear_attachment = true,
                        AttachmentState::Attached => {}
                    }
                }
            }
        }
        if let Some(attachment) = settled_attach {
            self.create_device_link(&fake.volume.id, &attachment.device);
        }
        if clear_attachment {
            if let Some(attachment) = fake.volume.attachment.take() {
                self.remove_device_link(&fake.volume.id, &attachment.device);
            }
        }
    }

    fn create_device_link(&self, volume_id: &str, device: &str) {
        let link = (self.link_path)(volume_id, device);
        if let Some(parent) = link.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let leaf = device.rsplit('/').next().unwrap_or(device);
        let target = self.device_root.join(format!("fake-{leaf}"));
        let _ = std::fs::write(&target, b"");
        let _ = std::fs::remove_file(&link);
        let _ = std::os::unix::fs::symlink(&target, &link);
    }

    fn remove_device_link(&self, volume_id: &str, device: &str) {
        let _ = std::fs::remove_file((self.link_path)(volume_id, device));
    }

    // -- volume API ----------------------------------------------------------

    pub fn create_volume(&self, template: &VolumeTemplate, labels: Labels) -> Result<Volume> {
        self.take_injected("create_volume")?;
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("{}-{:04}", self.id_prefix, state.next_id);
        let volume = Volume {
            id: id.clone(),
            name: template.name.clone(),
            size_gib: template.size_gib,
            drive_type: template.drive_type.clone(),
            zone: template.zone.clone(),
            shared: template.shared,
            labels,
            state: VolumeState::Creating,
            attachment: None,
            created_at: Utc::now(),
        };
        state.volumes.insert(
            id,
            FakeVolume {
                volume: volume.clone(),
                visibility_lag: 1,
                creating_lag: 1,
                attachment_lag: 0,
            },
        );
        Ok(volume)
    }

    pub fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        self.take_injected("get_volume")?;
        let mut state = self.state.lock();
        let fake = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Self::not_found(volume_id))?;
        if fake.visibility_lag > 0 {
            fake.visibility_lag -= 1;
            return Err(Self::not_found(volume_id));
        }
        let mut fake = state.volumes.remove(volume_id).unwrap();
        self.step(&mut fake);
        let observed = fake.volume.clone();
        state.volumes.insert(volume_id.to_string(), fake);
        Ok(observed)
    }

    pub fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.take_injected("list_volumes")?;
        let mut state = self.state.lock();
        let ids: Vec<String> = state.volumes.keys().cloned().collect();
        let mut observed = Vec::new();
        for id in ids {
            let mut fake = state.volumes.remove(&id).unwrap();
            if fake.visibility_lag > 0 {
                fake.visibility_lag -= 1;
            } else {
                self.step(&mut fake);
                observed.push(fake.volume.clone());
            }
            state.volumes.insert(id, fake);
        }
        Ok(observed)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Volume>> {
        Ok(self.list_volumes()?.into_iter().find(|v| v.name == name))
    }

    pub fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.take_injected("delete_volume")?;
        let mut state = self.state.lock();
        let fake = state
            .volumes
            .remove(volume_id)
            .ok_or_else(|| Self::not_found(volume_id))?;
        if let Some(attachment) = fake.volume.attachment {
            self.remove_device_link(volume_id, &attachment.device);
        }
        Ok(())
    }

    pub fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        self.take_injected("attach_volume")?;
        let mut state = self.state.lock();

        let in_use = state.volumes.values().any(|f| {
            f.volume
                .attachment
                .as_ref()
                .map(|a| a.instance_id == instance_id && a.device == device)
                .unwrap_or(false)
        });
        if in_use {
            return Err(Error::Provider {
                provider: self.provider,
                code: "DeviceInUse".into(),
                status: Some(409),
                message: format!("device {device} is already in use"),
                detail: None,
            });
        }

        let fake = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Self::not_found(volume_id))?;
        if let Some(attachment) = &fake.volume.attachment {
            return Err(Error::Provider {
                provider: self.provider,
                code: "VolumeInUse".into(),
                status: Some(409),
                message: format!("attached to {}", attachment.instance_id),
                detail: None,
            });
        }
        fake.volume.attachment = Some(Attachment {
            instance_id: instance_id.to_string(),
            device: device.to_string(),
            state: AttachmentState::Attaching,
        });
        fake.attachment_lag = 1;
        state.attach_mutations += 1;
        Ok(())
    }

    pub fn detach_volume(&self, volume_id: &str, instance_id: Option<&str>) -> Result<()> {
        self.take_injected("detach_volume")?;
        let mut state = self.state.lock();
        let fake = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Self::not_found(volume_id))?;
        match fake.volume.attachment.as_mut() {
            Some(attachment) => {
                if let Some(instance) = instance_id {
                    if attachment.instance_id != instance {
                        return Err(Error::Provider {
                            provider: self.provider,
                            code: "InvalidAttachment".into(),
                            status: Some(400),
                            message: format!("not attached to {instance}"),
                            detail: None,
                        });
                    }
                }
                attachment.state = AttachmentState::Detaching;
                fake.attachment_lag = 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn resize_volume(&self, volume_id: &str, new_size_gib: u64) -> Result<()> {
        self.take_injected("resize_volume")?;
        let mut state = self.state.lock();
        let fake = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Self::not_found(volume_id))?;
        fake.volume.size_gib = new_size_gib;
        Ok(())
    }

    /// Devices from the provider-maintained pool not in use on `instance`.
    pub fn free_devices(&self, instance_id: &str) -> Result<Vec<String>> {
        self.take_injected("free_devices")?;
        let state = self.state.lock();
        let used: Vec<&str> = state
            .volumes
            .values()
            .filter_map(|f| f.volume.attachment.as_ref())
            .filter(|a| a.instance_id == instance_id)
            .map(|a| a.device.as_str())
            .collect();
        Ok(self
            .device_pool
            .iter()
            .filter(|d| !used.contains(&d.as_str()))
            .cloned()
            .collect())
    }

    pub fn attachments_for_instance(&self, instance_id: &str) -> Result<Vec<(String, String)>> {
        self.take_injected("attachments_for_instance")?;
        let state = self.state.lock();
        Ok(state
            .volumes
            .values()
            .filter_map(|f| {
                f.volume
                    .attachment
                    .as_ref()
                    .filter(|a| a.instance_id == instance_id)
                    .map(|a| (f.volume.id.clone(), a.device.clone()))
            })
            .collect())
    }

    // -- tags ----------------------------------------------------------------

    pub fn apply_tags(&self, volume_id: &str, labels: &Labels) -> Result<()> {
        self.take_injected("apply_tags")?;
        let mut state = self.state.lock();
        let fake = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Self::not_found(volume_id))?;
        for (k, v) in labels {
            fake.volume.labels.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    pub fn remove_tags(&self, volume_id: &str, keys: &[String]) -> Result<()> {
        self.take_injected("remove_tags")?;
        let mut state = self.state.lock();
        let fake = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Self::not_found(volume_id))?;
        for key in keys {
            fake.volume.labels.remove(key);
        }
        Ok(())
    }

    pub fn tags(&self, volume_id: &str) -> Result<Labels> {
        self.take_injected("tags")?;
        let state = self.state.lock();
        state
            .volumes
            .get(volume_id)
            .map(|f| f.volume.labels.clone())
            .ok_or_else(|| Self::not_found(volume_id))
    }

    // -- snapshots -----------------------------------------------------------

    pub fn create_snapshot(&self, volume_id: &str, name: &str) -> Result<Snapshot> {
        self.take_injected("create_snapshot")?;
        let mut state = self.state.lock();
        if !state.volumes.contains_key(volume_id) {
            return Err(Self::not_found(volume_id));
        }
        state.next_id += 1;
        let snapshot = Snapshot {
            id: format!("snap-{:04}", state.next_id),
            volume_id: volume_id.to_string(),
            name: name.to_string(),
            state: SnapshotState::Creating,
            created_at: Utc::now(),
        };
        state.snapshots.insert(
            snapshot.id.clone(),
            FakeSnapshot {
                snapshot: snapshot.clone(),
                creating_lag: 1,
            },
        );
        Ok(snapshot)
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.take_injected("get_snapshot")?;
        let mut state = self.state.lock();
        let fake = state.snapshots.get_mut(snapshot_id).ok_or_else(|| {
            Error::VolNotFound {
                volume_id: snapshot_id.to_string(),
            }
        })?;
        if fake.creating_lag > 0 {
            fake.creating_lag -= 1;
            if fake.creating_lag == 0 {
                fake.snapshot.state = SnapshotState::Ready;
            }
        }
        Ok(fake.snapshot.clone())
    }

    pub fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.take_injected("delete_snapshot")?;
        let mut state = self.state.lock();
        state.snapshots.remove(snapshot_id);
        Ok(())
    }

    // -- instance groups -----------------------------------------------------

    pub fn set_group_size(&self, group_id: &str, count: u64) -> Result<()> {
        self.take_injected("set_group_size")?;
        self.state
            .lock()
            .groups
            .insert(group_id.to_string(), count);
        Ok(())
    }

    pub fn get_group_size(&self, group_id: &str) -> Result<u64> {
        self.take_injected("get_group_size")?;
        self.state
            .lock()
            .groups
            .get(group_id)
            .copied()
            .ok_or_else(|| Error::Provider {
                provider: self.provider,
                code: "GroupNotFound".into(),
                status: Some(404),
                message: format!("instance group {group_id} not found"),
                detail: None,
            })
    }
}

// =============================================================================
// Conformance Harness
// =============================================================================

fn ensure(condition: bool, what: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Internal(format!("protocol check failed: {what}")))
    }
}

/// Drive an adapter through the full protocol:
/// create, tag round trip, attach twice (same path), device mappings,
/// expand (plus idempotent re-expand), snapshot when supported,
/// detach/attach round trip, idempotent detach and delete.
pub async fn exercise_protocol(ops: &dyn CloudOps, template: &VolumeTemplate) -> Result<()> {
    let mut caller_labels = Labels::new();
    caller_labels.insert("managed-by".into(), "cloud-drive-operator".into());

    let volume = ops.create(template, &caller_labels).await?;
    ensure(!volume.id.is_empty(), "created volume has an id")?;
    ensure(
        volume.labels.get("managed-by").map(String::as_str) == Some("cloud-drive-operator"),
        "caller labels applied at create",
    )?;
    ensure(
        volume.shared == template.shared,
        "sharing mode recorded on the volume",
    )?;

    // Tag round trip
    let mut extra = Labels::new();
    extra.insert("pool".into(), "alpha".into());
    ops.apply_tags(&volume.id, &extra).await?;
    let tags = ops.tags(&volume.id).await?;
    ensure(tags.get("pool").map(String::as_str) == Some("alpha"), "tag applied")?;
    ops.remove_tags(&volume.id, &["pool".into()]).await?;
    let tags = ops.tags(&volume.id).await?;
    ensure(!tags.contains_key("pool"), "tag removed")?;

    // Attach is idempotent from the same instance
    let first_path = ops.attach(&volume.id, &Labels::new()).await?;
    ensure(!first_path.is_empty(), "attach yields a device path")?;
    let second_path = ops.attach(&volume.id, &Labels::new()).await?;
    ensure(first_path == second_path, "repeat attach yields the same path")?;

    let resolved = ops.device_path(&volume.id).await?;
    ensure(resolved == first_path, "device path matches attach result")?;
    let mappings = ops.device_mappings().await?;
    ensure(
        mappings.get(&first_path).map(String::as_str) == Some(volume.id.as_str()),
        "device mappings cover the attachment",
    )?;

    // Expand grows once, then short-circuits
    let grown = ops.expand(&volume.id, template.size_gib + 8).await?;
    ensure(grown >= template.size_gib + 8, "expand reaches the target")?;
    let again = ops.expand(&volume.id, template.size_gib).await?;
    ensure(again == grown, "expand is idempotent at or below current size")?;

    // Snapshot where the provider supports it
    match ops.snapshot(&volume.id, true, &Labels::new()).await {
        Ok(snapshot) => {
            ops.snapshot_delete(&snapshot.id).await?;
            // Already gone is success
            ops.snapshot_delete(&snapshot.id).await?;
        }
        Err(e) if e.is_not_supported() => {}
        Err(e) => return Err(e),
    }

    // Detach / attach round trip
    ops.detach(&volume.id).await?;
    let inspected = ops.inspect(&[volume.id.clone()]).await?;
    ensure(
        inspected.first().map(|v| v.attachment.is_none()) == Some(true),
        "detach clears the attachment",
    )?;
    let reattached = ops.attach(&volume.id, &Labels::new()).await?;
    ensure(!reattached.is_empty(), "reattach yields a device path")?;

    // Idempotent teardown
    ops.detach(&volume.id).await?;
    ops.detach(&volume.id).await?;
    ops.delete(&volume.id).await?;
    ops.delete(&volume.id).await?;

    match ops.inspect(&[volume.id.clone()]).await {
        Err(Error::VolNotFound { .. }) => Ok(()),
        Ok(_) => Err(Error::Internal("deleted volume still visible".into())),
        Err(e) => Err(e),
    }
}
