//! Metadata Store
//!
//! Locked key/value access used by the outer cluster coordinator to
//! serialize cluster-wide decisions (e.g. which node owns a drive name).
//! Two bindings share one store implementation: an in-memory/distributed
//! KV backend and a Kubernetes config-map backend.
//!
//! Locks are bounded on both sides: acquisition gives up after the lock-try
//! window, and a holder that exceeds the hold bound is treated as
//! deadlocked and its lock released.

pub mod configmap;
pub mod kv;

pub use kv::{KvBackend, KvMetadataStore, MemoryKv};

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// How long lock acquisition keeps trying before giving up.
pub const LOCK_TRY_TIMEOUT: Duration = Duration::from_secs(60);

/// A holder older than this is considered deadlocked and loses the lock.
pub const LOCK_HOLD_TIMEOUT: Duration = Duration::from_secs(180);

/// Pause between lock acquisition attempts.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Total backoff budget for mutations retried on leader changes.
pub const MUTATION_RETRY_TOTAL: Duration = Duration::from_secs(16);

/// Proof of lock ownership; surrender it to [`MetadataStore::unlock`].
#[derive(Debug)]
pub struct LockHandle {
    pub key: String,
    pub owner: String,
    pub(crate) token: u64,
}

/// Locked key/value access.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Take the store-wide lock.
    async fn lock(&self, owner: &str) -> Result<LockHandle>;

    /// Take a named lock.
    async fn lock_with_key(&self, owner: &str, key: &str) -> Result<LockHandle>;

    async fn unlock(&self, handle: LockHandle) -> Result<()>;

    /// Whether `key` is currently locked, and by whom.
    async fn is_key_locked(&self, key: &str) -> Result<(bool, String)>;

    /// Store a value at a new key; fails if the key exists.
    async fn create_key(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn put_key(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn get_key(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove a key; a key already gone is success.
    async fn delete_key(&self, key: &str) -> Result<()>;

    async fn enumerate_with_key_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

pub type MetadataStoreRef = Arc<dyn MetadataStore>;
