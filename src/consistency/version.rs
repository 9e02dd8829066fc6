//! API version negotiation and mismatch tracking.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::now_millis;
use crate::config::VersionConfig;
use crate::storage::{DurableStore, StorageError, StorageResult};

/// Durable key holding the most recent version mismatches.
pub const MISMATCH_LOG_KEY: &str = "api_version_mismatches";

/// Mismatch records kept in the durable log.
pub const MISMATCH_LOG_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersion {
    pub version: String,
    pub supported: bool,
    pub deprecated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMismatch {
    pub client_version: String,
    pub server_version: String,
    pub compatible: bool,
    pub message: String,
}

/// A mismatch as stored in the durable log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedMismatch {
    #[serde(flatten)]
    pub mismatch: VersionMismatch,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

pub struct ApiVersionManager {
    current: RwLock<String>,
    supported: RwLock<Vec<String>>,
    cache: DashMap<String, ApiVersion>,
    store: Arc<dyn DurableStore>,
}

impl ApiVersionManager {
    pub fn new(config: &VersionConfig, store: Arc<dyn DurableStore>) -> Self {
        Self {
            current: RwLock::new(config.current.clone()),
            supported: RwLock::new(config.supported.clone()),
            cache: DashMap::new(),
            store,
        }
    }

    fn current_guard(&self) -> RwLockReadGuard<'_, String> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn supported_guard(&self) -> RwLockReadGuard<'_, Vec<String>> {
        self.supported.read().unwrap_or_else(|e| e.into_inner())
    }

    fn supported_mut(&self) -> RwLockWriteGuard<'_, Vec<String>> {
        self.supported.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_version(&self) -> String {
        self.current_guard().clone()
    }

    pub fn is_supported(&self, version: &str) -> bool {
        self.supported_guard().iter().any(|v| v == version)
    }

    /// Switch to `version` if it is supported; otherwise keep the current one.
    pub fn set_version(&self, version: &str) {
        if !self.is_supported(version) {
            tracing::warn!(
                version = %version,
                current = %self.current_version(),
                "Unsupported API version, keeping current"
            );
            return;
        }
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = version.to_string();
    }

    pub fn check_compatibility(&self, client_version: &str, server_version: &str) -> VersionMismatch {
        let compatible = self.is_supported(server_version);
        let message = if compatible {
            "Versions are compatible".to_string()
        } else {
            format!("Version mismatch: Client {} vs Server {}", client_version, server_version)
        };
        VersionMismatch {
            client_version: client_version.to_string(),
            server_version: server_version.to_string(),
            compatible,
            message,
        }
    }

    /// Pick the highest version both sides support and make it current.
    ///
    /// Versions compare lexically. Falls back to the current version when
    /// nothing is shared.
    pub fn negotiate_version(&self, server_versions: &[String]) -> String {
        let negotiated = server_versions
            .iter()
            .filter(|v| self.is_supported(v))
            .max()
            .cloned();

        match negotiated {
            Some(version) => {
                self.set_version(&version);
                tracing::debug!(version = %version, "Negotiated API version");
                version
            }
            None => {
                let current = self.current_version();
                tracing::warn!(current = %current, ?server_versions, "No compatible API version, using current");
                current
            }
        }
    }

    /// Append a mismatch to the durable log, keeping the latest records only.
    pub fn log_version_mismatch(&self, mismatch: &VersionMismatch) {
        tracing::warn!(
            client = %mismatch.client_version,
            server = %mismatch.server_version,
            compatible = mismatch.compatible,
            "API version mismatch"
        );

        let record = LoggedMismatch {
            mismatch: mismatch.clone(),
            timestamp: now_millis(),
        };
        if let Err(e) = self.append_mismatch(record) {
            tracing::warn!(error = %e, "Failed to log version mismatch");
        }
    }

    fn append_mismatch(&self, record: LoggedMismatch) -> StorageResult<()> {
        let mut log = self.read_mismatches().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Discarding unreadable mismatch log");
            Vec::new()
        });
        log.push(record);
        let excess = log.len().saturating_sub(MISMATCH_LOG_CAPACITY);
        log.drain(..excess);

        let encoded = serde_json::to_string(&log)?;
        self.store.set(MISMATCH_LOG_KEY, &encoded)
    }

    fn read_mismatches(&self) -> StorageResult<Vec<LoggedMismatch>> {
        match self.store.get(MISMATCH_LOG_KEY)? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StorageError::Malformed {
                key: MISMATCH_LOG_KEY.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Logged mismatches, oldest first.
    pub fn version_mismatches(&self) -> Vec<LoggedMismatch> {
        self.read_mismatches().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read version mismatches");
            Vec::new()
        })
    }

    pub fn version_info(&self, version: &str) -> ApiVersion {
        if let Some(cached) = self.cache.get(version) {
            return cached.clone();
        }
        let info = ApiVersion {
            version: version.to_string(),
            supported: self.is_supported(version),
            deprecated: false,
        };
        self.cache.insert(version.to_string(), info.clone());
        info
    }

    pub fn add_supported_version(&self, version: &str) {
        let mut supported = self.supported_mut();
        if !supported.iter().any(|v| v == version) {
            supported.push(version.to_string());
            self.cache.remove(version);
        }
    }

    pub fn supported_versions(&self) -> Vec<String> {
        self.supported_guard().clone()
    }
}
