//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the resilience layer.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the resilience layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Circuit breaker defaults and per-endpoint overrides.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Health probing and query recovery.
    pub recovery: RecoveryConfig,

    /// Fallback cache and offline behavior.
    pub degradation: DegradationConfig,

    /// Durable storage location.
    pub storage: StorageConfig,

    /// API version negotiation.
    pub versions: VersionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin status surface.
    pub admin: AdminConfig,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring window before the circuit opens.
    pub failure_threshold: usize,

    /// Time after the last failure before a trial call is allowed, in milliseconds.
    pub reset_timeout_ms: u64,

    /// Sliding window over which failures are counted, in milliseconds.
    pub monitoring_window_ms: u64,

    /// Successful trial calls needed to close a half-open circuit.
    pub half_open_max_calls: usize,

    /// Per-endpoint overrides, applied when the endpoint's breaker is first created.
    pub endpoints: Vec<EndpointOverride>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            monitoring_window_ms: 60_000,
            half_open_max_calls: 3,
            endpoints: Vec::new(),
        }
    }
}

/// Override of breaker options for one endpoint. Unset fields inherit the defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointOverride {
    /// Endpoint identifier (e.g. "/credit-scoring").
    pub endpoint: String,

    #[serde(default)]
    pub failure_threshold: Option<usize>,

    #[serde(default)]
    pub reset_timeout_ms: Option<u64>,

    #[serde(default)]
    pub monitoring_window_ms: Option<u64>,

    #[serde(default)]
    pub half_open_max_calls: Option<usize>,
}

/// Recovery coordinator configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Enable periodic liveness probing.
    pub health_check_enabled: bool,

    /// Probe interval in seconds.
    pub health_check_interval_secs: u64,

    /// Base URL of the API gateway.
    pub probe_base_url: String,

    /// Lightweight path to probe.
    pub probe_path: String,

    /// Probe timeout in seconds.
    pub probe_timeout_secs: u64,

    /// Optional API key sent as `X-API-Key` with probes.
    pub api_key: Option<String>,

    /// Enable the periodic sweep for queries stuck in an error state.
    pub stuck_sweep_enabled: bool,

    /// Stuck sweep interval in seconds.
    pub stuck_sweep_interval_secs: u64,

    /// Age after which an errored query counts as stuck, in seconds.
    pub stuck_error_threshold_secs: u64,

    /// Enable the periodic sweep for stale data.
    pub stale_sweep_enabled: bool,

    /// Stale sweep interval in seconds.
    pub stale_sweep_interval_secs: u64,

    /// Age after which fetched data counts as stale, in seconds.
    pub stale_threshold_secs: u64,

    /// Delay between a reconnect and bulk recovery, in milliseconds.
    pub stabilization_delay_ms: u64,
}

impl RecoveryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn stuck_error_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_error_threshold_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            health_check_enabled: true,
            health_check_interval_secs: 120,
            probe_base_url: "http://localhost:8080".to_string(),
            probe_path: "/health".to_string(),
            probe_timeout_secs: 5,
            api_key: None,
            stuck_sweep_enabled: true,
            stuck_sweep_interval_secs: 120,
            stuck_error_threshold_secs: 300,
            stale_sweep_enabled: true,
            stale_sweep_interval_secs: 120,
            stale_threshold_secs: 300,
            stabilization_delay_ms: 1000,
        }
    }
}

/// Graceful degradation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Maximum age of a fallback entry before it is treated as absent, in seconds.
    pub fallback_ttl_secs: u64,

    /// Services that may be served from the fallback cache.
    pub fallback_services: BTreeMap<String, bool>,
}

impl DegradationConfig {
    pub fn fallback_ttl(&self) -> Duration {
        Duration::from_secs(self.fallback_ttl_secs)
    }
}

impl Default for DegradationConfig {
    fn default() -> Self {
        let mut fallback_services = BTreeMap::new();
        // Cached scores, locally stored customer data and default rules are acceptable.
        fallback_services.insert("credit-scoring".to_string(), true);
        fallback_services.insert("customer-360".to_string(), true);
        fallback_services.insert("rules-engine".to_string(), true);
        // Audit writes must be queued, never served stale.
        fallback_services.insert("audit".to_string(), false);

        Self {
            fallback_ttl_secs: 24 * 60 * 60,
            fallback_services,
        }
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file backing the store. In-memory when unset.
    pub path: Option<String>,

    /// Maximum serialized size of the store in bytes.
    pub quota_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            quota_bytes: 5 * 1024 * 1024, // 5MB
        }
    }
}

/// API version configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VersionConfig {
    /// Version used until negotiation picks another.
    pub current: String,

    /// Versions this client can speak.
    pub supported: Vec<String>,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            current: "v1".to_string(),
            supported: vec!["v1".to_string()],
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Admin status surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin HTTP surface.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
