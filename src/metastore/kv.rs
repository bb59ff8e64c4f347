//! Generic KV metadata-store binding
//!
//! [`KvMetadataStore`] implements the locked store contract over any
//! [`KvBackend`]. Locks are lease records created atomically; a record
//! older than the hold bound is treated as a deadlocked holder and
//! released. Mutations retry on leader-changed errors with exponential
//! backoff bounded by [`super::MUTATION_RETRY_TOTAL`].

use crate::error::{Error, Result};
use crate::metastore::{
    LockHandle, MetadataStore, LOCK_HOLD_TIMEOUT, LOCK_RETRY_INTERVAL, LOCK_TRY_TIMEOUT,
    MUTATION_RETRY_TOTAL,
};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DATA_PREFIX: &str = "data/";
const LOCK_PREFIX: &str = "locks/";
const STORE_LOCK_KEY: &str = "store";

// =============================================================================
// Backend Capability
// =============================================================================

/// Minimal surface a backing KV store must provide. `create` must be
/// atomic (fails with [`Error::KeyExists`] when the key is present);
/// `delete` is idempotent.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn create(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-process backend for tests and standalone mode.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn create(&self, key: &str, value: &[u8]) -> Result<()> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::KeyExists {
                key: key.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(value.to_vec());
                Ok(())
            }
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| Error::KeyNotFound {
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// =============================================================================
// Lock Records
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    owner: String,
    token: u64,
    acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn expired(&self, hold_timeout: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.acquired_at);
        age.num_milliseconds() >= hold_timeout.as_millis() as i64
    }
}

// =============================================================================
// Store
// =============================================================================

/// Locked KV store over any [`KvBackend`].
pub struct KvMetadataStore {
    backend: Arc<dyn KvBackend>,
    lock_try_timeout: Duration,
    lock_hold_timeout: Duration,
    lock_retry_interval: Duration,
    next_token: AtomicU64,
}

impl KvMetadataStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self::with_timeouts(backend, LOCK_TRY_TIMEOUT, LOCK_HOLD_TIMEOUT, LOCK_RETRY_INTERVAL)
    }

    pub fn with_timeouts(
        backend: Arc<dyn KvBackend>,
        lock_try_timeout: Duration,
        lock_hold_timeout: Duration,
        lock_retry_interval: Duration,
    ) -> Self {
        Self {
            backend,
            lock_try_timeout,
            lock_hold_timeout,
            lock_retry_interval,
            next_token: AtomicU64::new(1),
        }
    }

    fn data_key(key: &str) -> String {
        format!("{DATA_PREFIX}{key}")
    }

    fn lock_key(key: &str) -> String {
        format!("{LOCK_PREFIX}{key}")
    }

    /// Retry a backend mutation on leader changes, bounded in time.
    async fn with_leader_retry<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_elapsed_time(Some(MUTATION_RETRY_TOTAL))
            .build();
        let f = &f;
        backoff::future::retry(policy, || async move {
            f().await.map_err(|err| match err {
                Error::StoreLeaderChanged(_) => {
                    warn!(error = %err, "store leader changed, retrying mutation");
                    backoff::Error::transient(err)
                }
                err => backoff::Error::permanent(err),
            })
        })
        .await
    }

    async fn read_lock_record(&self, lock_key: &str) -> Result<Option<LockRecord>> {
        match self.backend.get(lock_key).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(Error::KeyNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl MetadataStore for KvMetadataStore {
    async fn lock(&self, owner: &str) -> Result<LockHandle> {
        self.lock_with_key(owner, STORE_LOCK_KEY).await
    }

    async fn lock_with_key(&self, owner: &str, key: &str) -> Result<LockHandle> {
        let lock_key = Self::lock_key(key);
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.lock_try_timeout;

        loop {
            let record = LockRecord {
                owner: owner.to_string(),
                token,
                acquired_at: Utc::now(),
            };
            let raw = serde_json::to_vec(&record)?;
            let attempt = self
                .with_leader_retry(|| self.backend.create(&lock_key, &raw))
                .await;
            match attempt {
                Ok(()) => {
                    debug!(key, owner, "lock acquired");
                    return Ok(LockHandle {
                        key: key.to_string(),
                        owner: owner.to_string(),
                        token,
                    });
                }
                Err(Error::KeyExists { .. }) => {
                    // A holder past the hold bound is deadlocked; break its
                    // lock and retry.
                    if let Some(held) = self.read_lock_record(&lock_key).await? {
                        if held.expired(self.lock_hold_timeout, Utc::now()) {
                            warn!(key, stale_owner = %held.owner, "breaking expired lock");
                            self.with_leader_retry(|| self.backend.delete(&lock_key))
                                .await?;
                            continue;
                        }
                    }
                }
                Err(e) => return Err(e),
            }

            if tokio::time::Instant::now() + self.lock_retry_interval > deadline {
                return Err(Error::LockTimeout {
                    key: key.to_string(),
                    waited_secs: self.lock_try_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.lock_retry_interval).await;
        }
    }

    async fn unlock(&self, handle: LockHandle) -> Result<()> {
        let lock_key = Self::lock_key(&handle.key);
        match self.read_lock_record(&lock_key).await? {
            Some(record) if record.owner == handle.owner && record.token == handle.token => {
                self.with_leader_retry(|| self.backend.delete(&lock_key)).await
            }
            // Broken by a hold-timeout steal or already released.
            Some(_) | None => {
                debug!(key = %handle.key, "lock no longer held by this handle");
                Ok(())
            }
        }
    }

    async fn is_key_locked(&self, key: &str) -> Result<(bool, String)> {
        match self.read_lock_record(&Self::lock_key(key)).await? {
            Some(record) => {
                let live = !record.expired(self.lock_hold_timeout, Utc::now());
                Ok((live, record.owner))
            }
            None => Ok((false, String::new())),
        }
    }

    async fn create_key(&self, key: &str, value: &[u8]) -> Result<()> {
        let data_key = Self::data_key(key);
        self.with_leader_retry(|| self.backend.create(&data_key, value))
            .await
            .map_err(|e| match e {
                Error::KeyExists { .. } => Error::KeyExists {
                    key: key.to_string(),
                },
                e => e,
            })
    }

    async fn put_key(&self, key: &str, value: &[u8]) -> Result<()> {
        let data_key = Self::data_key(key);
        self.with_leader_retry(|| self.backend.put(&data_key, value)).await
    }

    async fn get_key(&self, key: &str) -> Result<Vec<u8>> {
        self.backend.get(&Self::data_key(key)).await.map_err(|e| match e {
            Error::KeyNotFound { .. } => Error::KeyNotFound {
                key: key.to_string(),
            },
            e => e,
        })
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        let data_key = Self::data_key(key);
        self.with_leader_retry(|| self.backend.delete(&data_key)).await
    }

    async fn enumerate_with_key_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = Self::data_key(prefix);
        Ok(self
            .backend
            .keys_with_prefix(&full_prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(DATA_PREFIX).map(str::to_string))
            .collect())
    }
}
