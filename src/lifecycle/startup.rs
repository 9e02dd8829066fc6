//! Startup wiring.
//!
//! # Responsibilities
//! - Build every resilience service from one validated configuration
//! - Share the breaker registry, durable store and connectivity signal between them
//! - Apply reloaded configuration to the services that support it
//!
//! # Design Decisions
//! - One `ResilienceLayer` per process; services are injected, not global
//! - Probe construction is the only fallible step

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::broadcast::{LocalBroadcaster, TopicBroadcaster};
use crate::config::ResilienceConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::consistency::{ApiVersionManager, DataConsistencyService};
use crate::degradation::GracefulDegradationService;
use crate::recovery::{ProbeError, QueryStore, RecoveryCoordinator};
use crate::resilience::{execute_with, CallError, CircuitBreakerRegistry, RequestDeduplicator, SharedOutcome};
use crate::storage::{self, DurableStore};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("recovery probe setup failed: {0}")]
    Probe(#[from] ProbeError),
}

/// Deduplicator for JSON calls guarded by a circuit breaker.
pub type GuardedDeduplicator = RequestDeduplicator<Value, CallError<String>>;

/// Every resilience service, wired together.
pub struct ResilienceLayer {
    pub store: Arc<dyn DurableStore>,
    pub broadcaster: Arc<dyn TopicBroadcaster>,
    pub connectivity: ConnectivityMonitor,
    pub registry: Arc<CircuitBreakerRegistry>,
    pub deduplicator: Arc<GuardedDeduplicator>,
    pub consistency: Arc<DataConsistencyService>,
    pub versions: Arc<ApiVersionManager>,
    pub degradation: Arc<GracefulDegradationService>,
    pub recovery: Arc<RecoveryCoordinator>,
}

impl ResilienceLayer {
    /// Build the layer with the configured durable store.
    pub fn build(config: &ResilienceConfig, queries: Arc<dyn QueryStore>) -> Result<Self, StartupError> {
        let store = storage::open_store(&config.storage);
        Self::with_store(config, queries, store)
    }

    /// Build the layer on an explicit durable store.
    pub fn with_store(
        config: &ResilienceConfig,
        queries: Arc<dyn QueryStore>,
        store: Arc<dyn DurableStore>,
    ) -> Result<Self, StartupError> {
        let broadcaster: Arc<dyn TopicBroadcaster> = Arc::new(LocalBroadcaster::new());
        let connectivity = ConnectivityMonitor::default();
        let registry = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));

        let recovery = RecoveryCoordinator::new(config.recovery.clone(), queries, connectivity.clone())?;
        let degradation = GracefulDegradationService::new(
            config.degradation.clone(),
            registry.clone(),
            connectivity.clone(),
            store.clone(),
        );

        tracing::info!(
            endpoint_overrides = config.circuit_breaker.endpoints.len(),
            durable_store = config.storage.path.as_deref().unwrap_or("memory"),
            api_version = %config.versions.current,
            "Resilience layer initialized"
        );

        Ok(Self {
            consistency: Arc::new(DataConsistencyService::new(store.clone(), broadcaster.clone())),
            versions: Arc::new(ApiVersionManager::new(&config.versions, store.clone())),
            degradation: Arc::new(degradation),
            recovery: Arc::new(recovery),
            deduplicator: Arc::new(RequestDeduplicator::new()),
            store,
            broadcaster,
            connectivity,
            registry,
        })
    }

    /// Apply a reloaded configuration.
    ///
    /// Breaker defaults only reach breakers created afterwards. Storage and
    /// version settings need a restart.
    pub fn apply_config(&self, config: &ResilienceConfig) {
        self.registry.update_config(config.circuit_breaker.clone());
        self.degradation.update_config(config.degradation.clone());
        if let Err(e) = self.recovery.update_config(config.recovery.clone()) {
            tracing::error!(error = %e, "Keeping previous recovery settings");
        }
        tracing::info!("Configuration reloaded");
    }

    /// Run `f` under the breaker for `endpoint`, collapsing concurrent identical requests.
    pub fn guarded_fetch<F, Fut>(
        &self,
        endpoint: &str,
        url: &str,
        params: Option<&Value>,
        f: F,
    ) -> SharedOutcome<Value, CallError<String>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let breaker = self.registry.get(endpoint);
        self.deduplicator
            .deduplicate(url, params, move || async move { execute_with(&breaker, f).await })
    }

    /// Fetch through the breaker of `service`, caching successes and serving
    /// fallback data when the call is refused or fails.
    pub async fn fetch_with_fallback<F, Fut>(
        &self,
        service: &str,
        key: &str,
        f: F,
    ) -> Result<Served, CallError<String>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let endpoint = crate::degradation::service_endpoint(service);
        match self.guarded_fetch(&endpoint, &endpoint, Some(&Value::String(key.to_string())), f).await {
            Ok(value) => {
                self.degradation.store_fallback_data(service, key, value.clone());
                Ok(Served::Live(value))
            }
            Err(e) => match self.degradation.fallback_data(service, key) {
                Some(cached) => {
                    tracing::info!(service = %service, key = %key, error = %e, "Serving fallback data");
                    Ok(Served::Cached(cached))
                }
                None => Err(e),
            },
        }
    }
}

/// A payload and whether it came from the live backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Served {
    Live(Value),
    /// Fallback data; must be presented as non-live.
    Cached(Value),
}

impl Served {
    pub fn value(&self) -> &Value {
        match self {
            Served::Live(v) | Served::Cached(v) => v,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Served::Cached(_))
    }
}
