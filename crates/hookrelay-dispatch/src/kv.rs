//! Low-latency shared key-value store with expiry, used for circuit breaker state.
//!
//! Writers use optimistic compare-and-set on a per-key version so concurrent
//! dispatchers, in one process or many, never need a lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::WebhookError;

/// A stored value and the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: String,
    pub version: u64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, WebhookError>;

    /// Write `value` if the key is still at `expected_version` (`None` means
    /// absent). Returns false when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, WebhookError>;

    /// Unconditionally overwrite a batch of keys with the same TTL.
    async fn set_many(&self, entries: Vec<(String, String)>, ttl: Duration)
        -> Result<(), WebhookError>;

    async fn delete_many(&self, keys: &[String]) -> Result<(), WebhookError>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    version: u64,
    expires_at: Instant,
}

/// In-process implementation for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
    }

    /// Drop expired entries. Runs on every write.
    fn purge_expired(entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of stored entries, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, WebhookError> {
        let entries = self.entries.lock().await;
        Ok(Self::live(&entries, key).map(|entry| VersionedValue {
            value: entry.value.clone(),
            version: entry.version,
        }))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, WebhookError> {
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries);
        let current = Self::live(&entries, key).map(|entry| entry.version);
        if current != expected_version {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                version: expected_version.unwrap_or(0) + 1,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn set_many(
        &self,
        new_entries: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<(), WebhookError> {
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries);
        let expires_at = Instant::now() + ttl;
        for (key, value) in new_entries {
            let version = Self::live(&entries, &key).map_or(0, |entry| entry.version) + 1;
            entries.insert(
                key,
                Entry {
                    value,
                    version,
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), WebhookError> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}
