//! Retry/backoff decorator
//!
//! Wraps any [`CloudOps`] implementation and retries a configured subset of
//! operations with exponential backoff when a provider-specific classifier
//! marks the error as transient (rate limits, mid-flight detach races).
//! Non-classified errors return immediately, and retries happen only at
//! this outermost boundary so partial multi-step mutations are never
//! repeated.

use crate::error::Result;
use crate::ops::{
    CloudOps, CloudOpsRef, InstanceGroupInfo, InstanceInfo, Labels, Snapshot, Volume,
    VolumeTemplate,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Policy
// =============================================================================

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    /// Retries after the first attempt; the operation runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            factor: 2.0,
            max_retries: 4,
        }
    }
}

/// Provider-specific transient-error predicate.
pub type TransientClassifier = Arc<dyn Fn(&crate::error::Error) -> bool + Send + Sync>;

/// Operations the wrapper may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpName {
    Create,
    Delete,
    Attach,
    Detach,
    Expand,
    Inspect,
    Enumerate,
    Snapshot,
    SnapshotDelete,
    ApplyTags,
    RemoveTags,
    Tags,
    DeviceMappings,
}

/// Mutating operations retried by default; read paths surface errors to
/// their callers' own poll loops.
pub fn default_retry_ops() -> HashSet<OpName> {
    [
        OpName::Create,
        OpName::Delete,
        OpName::Attach,
        OpName::Detach,
        OpName::Expand,
        OpName::Snapshot,
        OpName::SnapshotDelete,
        OpName::ApplyTags,
        OpName::RemoveTags,
    ]
    .into_iter()
    .collect()
}

// =============================================================================
// Decorator
// =============================================================================

/// [`CloudOps`] decorator adding selective exponential-backoff retries.
pub struct RetryOps {
    inner: CloudOpsRef,
    policy: RetryPolicy,
    classifier: TransientClassifier,
    retried_ops: HashSet<OpName>,
}

impl RetryOps {
    pub fn new(inner: CloudOpsRef, policy: RetryPolicy, classifier: TransientClassifier) -> Self {
        Self {
            inner,
            policy,
            classifier,
            retried_ops: default_retry_ops(),
        }
    }

    /// Override the set of operations the wrapper retries.
    pub fn with_ops(mut self, ops: HashSet<OpName>) -> Self {
        self.retried_ops = ops;
        self
    }

    async fn call<T, F, Fut>(&self, op: OpName, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.retried_ops.contains(&op) {
            return f().await;
        }

        let mut delay = self.policy.initial_delay;
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.policy.max_retries && (self.classifier)(&err) => {
                    attempt += 1;
                    warn!(
                        provider = self.inner.name(),
                        ?op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(self.policy.factor);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl CloudOps for RetryOps {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn instance_id(&self) -> &str {
        self.inner.instance_id()
    }

    async fn inspect_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        self.inner.inspect_instance(instance_id).await
    }

    async fn inspect_instance_group_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<InstanceGroupInfo> {
        self.inner.inspect_instance_group_for_instance(instance_id).await
    }

    async fn set_instance_group_size(
        &self,
        group_id: &str,
        count: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.inner.set_instance_group_size(group_id, count, timeout).await
    }

    async fn get_instance_group_size(&self, group_id: &str) -> Result<u64> {
        self.inner.get_instance_group_size(group_id).await
    }

    async fn create(&self, template: &VolumeTemplate, labels: &Labels) -> Result<Volume> {
        self.call(OpName::Create, || self.inner.create(template, labels))
            .await
    }

    async fn delete(&self, volume_id: &str) -> Result<()> {
        self.call(OpName::Delete, || self.inner.delete(volume_id)).await
    }

    async fn attach(&self, volume_id: &str, options: &Labels) -> Result<String> {
        self.call(OpName::Attach, || self.inner.attach(volume_id, options))
            .await
    }

    async fn detach(&self, volume_id: &str) -> Result<()> {
        self.call(OpName::Detach, || self.inner.detach(volume_id)).await
    }

    async fn detach_from(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        self.call(OpName::Detach, || self.inner.detach_from(volume_id, instance_id))
            .await
    }

    async fn expand(&self, volume_id: &str, new_size_gib: u64) -> Result<u64> {
        self.call(OpName::Expand, || self.inner.expand(volume_id, new_size_gib))
            .await
    }

    async fn inspect(&self, volume_ids: &[String]) -> Result<Vec<Volume>> {
        self.call(OpName::Inspect, || self.inner.inspect(volume_ids)).await
    }

    async fn enumerate(
        &self,
        volume_ids: &[String],
        labels: &Labels,
        set_identifier: &str,
    ) -> Result<BTreeMap<String, Vec<Volume>>> {
        self.call(OpName::Enumerate, || {
            self.inner.enumerate(volume_ids, labels, set_identifier)
        })
        .await
    }

    async fn device_mappings(&self) -> Result<BTreeMap<String, String>> {
        self.call(OpName::DeviceMappings, || self.inner.device_mappings())
            .await
    }

    async fn device_path(&self, volume_id: &str) -> Result<String> {
        // Never retried here: the adapter's own bounded device wait owns
        // this path.
        self.inner.device_path(volume_id).await
    }

    async fn snapshot(&self, volume_id: &str, readonly: bool, labels: &Labels) -> Result<Snapshot> {
        self.call(OpName::Snapshot, || {
            self.inner.snapshot(volume_id, readonly, labels)
        })
        .await
    }

    async fn snapshot_delete(&self, snapshot_id: &str) -> Result<()> {
        self.call(OpName::SnapshotDelete, || self.inner.snapshot_delete(snapshot_id))
            .await
    }

    async fn apply_tags(&self, volume_id: &str, labels: &Labels) -> Result<()> {
        self.call(OpName::ApplyTags, || self.inner.apply_tags(volume_id, labels))
            .await
    }

    async fn remove_tags(&self, volume_id: &str, keys: &[String]) -> Result<()> {
        self.call(OpName::RemoveTags, || self.inner.remove_tags(volume_id, keys))
            .await
    }

    async fn tags(&self, volume_id: &str) -> Result<Labels> {
        self.call(OpName::Tags, || self.inner.tags(volume_id)).await
    }
}
