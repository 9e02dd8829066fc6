//! In-memory store.

use dashmap::DashMap;

use super::{entry_size, DurableStore, StorageError, StorageResult};

/// A process-lifetime store with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: DashMap<String, String>,
    quota: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes once `quota` bytes are used.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            inner: DashMap::new(),
            quota: Some(quota),
        }
    }

    fn used_bytes_excluding(&self, key: &str) -> usize {
        self.inner
            .iter()
            .filter(|r| r.key() != key)
            .map(|r| entry_size(r.key(), r.value()))
            .sum()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.inner.get(key).map(|r| r.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        if let Some(quota) = self.quota {
            let needed = self.used_bytes_excluding(key) + entry_size(key, value);
            if needed > quota {
                return Err(StorageError::QuotaExceeded { needed, quota });
            }
        }
        self.inner.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.inner.remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.inner.iter().map(|r| r.key().clone()).collect()
    }
}
