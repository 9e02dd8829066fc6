//! Graceful degradation.
//!
//! # Responsibilities
//! - Report per-service availability from the service's circuit breaker
//! - Track forced and platform-reported offline mode
//! - Store and serve time-boxed fallback payloads for services that allow it
//!
//! # Design Decisions
//! - Services are addressed by name; their breaker is the endpoint `/{name}`
//! - Fallback expiry is checked on read, entries are never swept
//! - Storage failures are logged and reported as a miss

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::now_millis;
use crate::config::DegradationConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::observability::metrics;
use crate::resilience::{CircuitBreakerRegistry, CircuitState};
use crate::storage::{DurableStore, StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    pub available: bool,
    pub circuit_state: CircuitState,
    /// Epoch milliseconds.
    pub last_check: u64,
    pub fallback_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationOptions {
    pub use_fallback: bool,
    pub show_offline_mode: bool,
    pub allow_manual_sync: bool,
}

/// A cached payload as written to the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub value: Value,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

pub fn service_endpoint(service: &str) -> String {
    format!("/{}", service)
}

fn fallback_key(service: &str, key: &str) -> String {
    format!("fallback_{}_{}", service, key)
}

fn is_available(state: CircuitState) -> bool {
    matches!(state, CircuitState::Closed | CircuitState::HalfOpen)
}

pub struct GracefulDegradationService {
    registry: Arc<CircuitBreakerRegistry>,
    config: ArcSwap<DegradationConfig>,
    connectivity: ConnectivityMonitor,
    store: Arc<dyn DurableStore>,
    forced_offline: AtomicBool,
}

impl GracefulDegradationService {
    pub fn new(
        config: DegradationConfig,
        registry: Arc<CircuitBreakerRegistry>,
        connectivity: ConnectivityMonitor,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            registry,
            config: ArcSwap::from_pointee(config),
            connectivity,
            store,
            forced_offline: AtomicBool::new(false),
        }
    }

    /// Replace the fallback allow-list and TTL.
    pub fn update_config(&self, config: DegradationConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn is_service_available(&self, service: &str) -> bool {
        is_available(self.registry.state_of(&service_endpoint(service)))
    }

    pub fn service_status(&self, service: &str) -> ServiceStatus {
        let circuit_state = self.registry.state_of(&service_endpoint(service));
        ServiceStatus {
            service: service.to_string(),
            available: is_available(circuit_state),
            circuit_state,
            last_check: now_millis(),
            fallback_available: self.has_fallback(service),
        }
    }

    /// Status of every service named in the fallback allow-list.
    pub fn all_service_statuses(&self) -> Vec<ServiceStatus> {
        let config = self.config.load();
        config
            .fallback_services
            .keys()
            .map(|service| self.service_status(service))
            .collect()
    }

    pub fn is_offline_mode(&self) -> bool {
        self.forced_offline.load(Ordering::Relaxed) || !self.connectivity.is_online()
    }

    /// Force offline mode on or off. Platform connectivity still applies.
    pub fn set_offline_mode(&self, offline: bool) {
        let previous = self.forced_offline.swap(offline, Ordering::Relaxed);
        if previous != offline {
            tracing::info!(offline, "Offline mode changed");
        }
    }

    /// Whether `service` may be served from fallback data. Unknown services may not.
    pub fn has_fallback(&self, service: &str) -> bool {
        self.config
            .load()
            .fallback_services
            .get(service)
            .copied()
            .unwrap_or(false)
    }

    /// Cached payload for `service`/`key`, if present and younger than the TTL.
    pub fn fallback_data(&self, service: &str, key: &str) -> Option<Value> {
        if !self.has_fallback(service) {
            return None;
        }

        let ttl = self.config.load().fallback_ttl();
        match self.read_fallback(service, key) {
            Ok(Some(entry)) => {
                let age = Duration::from_millis(now_millis().saturating_sub(entry.timestamp));
                if age < ttl {
                    metrics::record_fallback_lookup(service, "hit");
                    Some(entry.value)
                } else {
                    tracing::debug!(service = %service, key = %key, age_secs = age.as_secs(), "Fallback data expired");
                    metrics::record_fallback_lookup(service, "expired");
                    None
                }
            }
            Ok(None) => {
                metrics::record_fallback_lookup(service, "miss");
                None
            }
            Err(e) => {
                tracing::warn!(service = %service, key = %key, error = %e, "Failed to get fallback data");
                metrics::record_fallback_lookup(service, "miss");
                None
            }
        }
    }

    fn read_fallback(&self, service: &str, key: &str) -> StorageResult<Option<FallbackEntry>> {
        let storage_key = fallback_key(service, key);
        match self.store.get(&storage_key)? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StorageError::Malformed {
                    key: storage_key,
                    reason: e.to_string(),
                }),
        }
    }

    /// Cache a payload with a fresh timestamp. Skipped for services without fallback support.
    pub fn store_fallback_data(&self, service: &str, key: &str, value: Value) {
        if !self.has_fallback(service) {
            tracing::trace!(service = %service, "Service has no fallback support, not caching");
            return;
        }

        let entry = FallbackEntry {
            value,
            timestamp: now_millis(),
        };
        let result = serde_json::to_string(&entry)
            .map_err(StorageError::from)
            .and_then(|encoded| self.store.set(&fallback_key(service, key), &encoded));

        if let Err(e) = result {
            tracing::warn!(service = %service, key = %key, error = %e, "Failed to store fallback data");
        }
    }

    pub fn degradation_options(&self) -> DegradationOptions {
        let offline = self.is_offline_mode();
        DegradationOptions {
            use_fallback: offline,
            show_offline_mode: offline,
            allow_manual_sync: true,
        }
    }
}
