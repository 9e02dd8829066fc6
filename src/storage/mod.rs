//! Durable key/value storage.
//!
//! # Data Flow
//! ```text
//! degradation (fallback entries)      ┐
//! consistency (field timestamps)      ├─→ DurableStore ─→ memory.rs (process lifetime)
//! consistency (version mismatches)    ┘                └→ file.rs   (JSON document on disk)
//! ```
//!
//! # Design Decisions
//! - String keys and string values, like browser local storage
//! - Callers own the layout of keys and values
//! - Errors are returned, never swallowed here; callers decide to log and continue

pub mod file;
pub mod memory;

use std::sync::Arc;

use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::StorageConfig;

/// Errors raised by a durable store or while decoding its contents.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage quota exceeded: {needed} bytes needed, quota is {quota}")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("malformed value at {key}: {reason}")]
    Malformed { key: String, reason: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Same-origin durable storage consumed by the resilience services.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    fn remove(&self, key: &str) -> StorageResult<()>;

    /// All keys currently stored, in no particular order.
    fn keys(&self) -> Vec<String>;
}

/// Open the store described by the configuration.
///
/// A file store that fails to load falls back to memory so startup is never blocked.
pub fn open_store(config: &StorageConfig) -> Arc<dyn DurableStore> {
    match &config.path {
        Some(path) => match FileStore::open(path, config.quota_bytes) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Failed to open durable store, using in-memory storage");
                Arc::new(MemoryStore::with_quota(config.quota_bytes))
            }
        },
        None => Arc::new(MemoryStore::with_quota(config.quota_bytes)),
    }
}

/// Size a key/value pair contributes toward a quota.
pub(crate) fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}
