//! Per-endpoint breaker registry.
//!
//! # Responsibilities
//! - Create one breaker per endpoint on first access
//! - Apply configured per-endpoint overrides at creation
//! - Wrap calls so they short-circuit while a circuit is open

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerOptions, CircuitSnapshot, CircuitState,
};

/// Registry of circuit breakers keyed by endpoint identifier.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: ArcSwap<CircuitBreakerConfig>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config: ArcSwap::from_pointee(config),
        }
    }

    /// Replace defaults and overrides. Existing breakers keep their options.
    pub fn update_config(&self, config: CircuitBreakerConfig) {
        self.config.store(Arc::new(config));
    }

    /// Options a breaker for `endpoint` would be created with.
    pub fn options_for(&self, endpoint: &str) -> CircuitBreakerOptions {
        let config = self.config.load();
        let defaults = CircuitBreakerOptions::from(config.as_ref());
        match config.endpoints.iter().find(|o| o.endpoint == endpoint) {
            Some(o) => defaults.with_override(o),
            None => defaults,
        }
    }

    /// Get or create the breaker for `endpoint` using configured options.
    pub fn get(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(endpoint) {
            return existing.clone();
        }
        let options = self.options_for(endpoint);
        self.get_with_options(endpoint, options)
    }

    /// Get or create the breaker for `endpoint`. `options` only apply on creation.
    pub fn get_with_options(&self, endpoint: &str, options: CircuitBreakerOptions) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                tracing::debug!(endpoint = %endpoint, ?options, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(endpoint, options))
            })
            .clone()
    }

    /// Existing breaker for `endpoint`, without creating one.
    pub fn peek(&self, endpoint: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(endpoint).map(|r| r.value().clone())
    }

    /// State of the breaker for `endpoint`.
    pub fn state_of(&self, endpoint: &str) -> CircuitState {
        self.get(endpoint).state()
    }

    /// Run `f` under the breaker for `endpoint`.
    ///
    /// Fails with [`CallError::CircuitOpen`] without invoking `f` when the circuit
    /// refuses the call; otherwise records the outcome and passes it through.
    pub async fn execute<T, E, F, Fut>(&self, endpoint: &str, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let breaker = self.get(endpoint);
        execute_with(&breaker, f).await
    }

    /// Snapshots of every breaker, sorted by endpoint.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.iter().map(|r| r.value().clone()).collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        snapshots
    }

    /// Reset one breaker. Returns false if it does not exist.
    pub fn reset(&self, endpoint: &str) -> bool {
        match self.peek(endpoint) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

/// Run `f` under an already resolved breaker.
pub async fn execute_with<T, E, F, Fut>(breaker: &CircuitBreaker, f: F) -> Result<T, CallError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    if !breaker.can_execute() {
        metrics::record_circuit_rejected(breaker.endpoint());
        tracing::debug!(endpoint = %breaker.endpoint(), "Call short-circuited");
        return Err(CallError::CircuitOpen {
            endpoint: breaker.endpoint().to_string(),
        });
    }

    match f().await {
        Ok(value) => {
            breaker.record_success();
            Ok(value)
        }
        Err(e) => {
            breaker.record_failure(&e);
            Err(CallError::Transport(e))
        }
    }
}
