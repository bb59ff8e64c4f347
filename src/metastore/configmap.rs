//! Config-map metadata-store binding
//!
//! Backs the KV store contract with a single Kubernetes ConfigMap. Caller
//! keys are sanitized to the config-map data-key charset without losing
//! uniqueness: the original key rides along inside the stored entry, and a
//! short hash suffix disambiguates keys that collapse to the same sanitized
//! form. Mutations are optimistic (resourceVersion) and retry on write
//! conflicts with the same bounded backoff as leader changes.

use crate::error::{Error, Result};
use crate::metastore::kv::{KvBackend, KvMetadataStore};
use crate::metastore::MUTATION_RETRY_TOTAL;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A stored entry carries the caller's original key so enumeration can
/// undo sanitization.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: Vec<u8>,
}

/// Sanitize a name to DNS-1123 label form (config-map object names).
pub fn sanitize_dns1123(name: &str) -> String {
    let mut sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    sanitized.truncate(63);
    let trimmed = sanitized.trim_matches('-').to_string();
    if trimmed.is_empty() {
        format!("k{:08x}", short_hash(name))
    } else if trimmed != name {
        // Keep distinct originals distinct after lossy mapping.
        format!("{}-{:08x}", &trimmed[..trimmed.len().min(54)], short_hash(name))
    } else {
        trimmed
    }
}

/// Sanitize a caller key to the config-map data-key charset
/// (`[-._a-zA-Z0-9]`), preserving uniqueness with a hash suffix whenever
/// the mapping was lossy.
pub fn sanitize_data_key(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if sanitized == key && !sanitized.is_empty() {
        sanitized
    } else {
        format!("{}-{:08x}", sanitized, short_hash(key))
    }
}

fn short_hash(input: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    hasher.finish() as u32
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

// =============================================================================
// Backend
// =============================================================================

/// [`KvBackend`] over one namespaced ConfigMap.
pub struct ConfigMapBackend {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapBackend {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: sanitize_dns1123(name),
        }
    }

    async fn load(&self) -> Result<ConfigMap> {
        match self.api.get(&self.name).await {
            Ok(cm) => Ok(cm),
            Err(e) if is_not_found(&e) => self.create_empty().await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create_empty(&self) -> Result<ConfigMap> {
        let cm = ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        match self.api.create(&PostParams::default(), &cm).await {
            Ok(created) => Ok(created),
            // Lost the creation race; the other writer's map is fine.
            Err(e) if is_conflict(&e) => self.api.get(&self.name).await.map_err(Into::into),
            Err(e) => Err(e.into()),
        }
    }

    /// Optimistic read-modify-write with bounded conflict retries.
    async fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: Fn(&mut BTreeMap<String, ByteString>) -> Result<()>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_elapsed_time(Some(MUTATION_RETRY_TOTAL))
            .build();
        let apply = &apply;
        backoff::future::retry(policy, || async move {
            let mut cm = self.load().await.map_err(backoff::Error::permanent)?;
            let mut data = cm.binary_data.take().unwrap_or_default();
            apply(&mut data).map_err(backoff::Error::permanent)?;
            cm.binary_data = Some(data);
            match self.api.replace(&self.name, &PostParams::default(), &cm).await {
                Ok(_) => Ok(()),
                Err(e) if is_conflict(&e) => {
                    debug!(configmap = %self.name, "write conflict, retrying");
                    Err(backoff::Error::transient(Error::from(e)))
                }
                Err(e) => Err(backoff::Error::permanent(Error::from(e))),
            }
        })
        .await
    }

    fn decode(raw: &ByteString) -> Result<StoredEntry> {
        Ok(serde_json::from_slice(&raw.0)?)
    }

    fn encode(key: &str, value: &[u8]) -> Result<ByteString> {
        let entry = StoredEntry {
            key: key.to_string(),
            value: value.to_vec(),
        };
        Ok(ByteString(serde_json::to_vec(&entry)?))
    }
}

#[async_trait]
impl KvBackend for ConfigMapBackend {
    async fn create(&self, key: &str, value: &[u8]) -> Result<()> {
        let data_key = sanitize_data_key(key);
        let encoded = Self::encode(key, value)?;
        self.mutate(move |data| {
            if data.contains_key(&data_key) {
                return Err(Error::KeyExists {
                    key: data_key.clone(),
                });
            }
            data.insert(data_key.clone(), encoded.clone());
            Ok(())
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let data_key = sanitize_data_key(key);
        let encoded = Self::encode(key, value)?;
        self.mutate(move |data| {
            data.insert(data_key.clone(), encoded.clone());
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let data_key = sanitize_data_key(key);
        let cm = self.load().await?;
        let data = cm.binary_data.unwrap_or_default();
        let raw = data.get(&data_key).ok_or_else(|| Error::KeyNotFound {
            key: key.to_string(),
        })?;
        let entry = Self::decode(raw)?;
        if entry.key != key {
            return Err(Error::KeyNotFound {
                key: key.to_string(),
            });
        }
        Ok(entry.value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let data_key = sanitize_data_key(key);
        self.mutate(move |data| {
            data.remove(&data_key);
            Ok(())
        })
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let cm = self.load().await?;
        let data = cm.binary_data.unwrap_or_default();
        let mut keys = Vec::new();
        for raw in data.values() {
            let entry = Self::decode(raw)?;
            if entry.key.starts_with(prefix) {
                keys.push(entry.key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// The config-map binding of the metadata store.
pub fn config_map_store(client: Client, namespace: &str, name: &str) -> KvMetadataStore {
    KvMetadataStore::new(Arc::new(ConfigMapBackend::new(client, namespace, name)))
}
