//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, intervals > 0)
//! - Check that URLs and socket addresses parse
//! - Detect duplicate per-endpoint overrides
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ResilienceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ResilienceConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: String },

    #[error("{field} is not a valid URL: {value}")]
    InvalidUrl { field: String, value: String },

    #[error("{field} is not a valid socket address: {value}")]
    InvalidAddress { field: String, value: String },

    #[error("duplicate circuit breaker override for endpoint {0}")]
    DuplicateEndpoint(String),

    #[error("current API version {0} is not in the supported list")]
    UnsupportedCurrentVersion(String),

    #[error("supported API versions must not be empty")]
    NoSupportedVersions,
}

fn zero(field: &str) -> ValidationError {
    ValidationError::Zero { field: field.to_string() }
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let cb = &config.circuit_breaker;
    if cb.failure_threshold == 0 {
        errors.push(zero("circuit_breaker.failure_threshold"));
    }
    if cb.reset_timeout_ms == 0 {
        errors.push(zero("circuit_breaker.reset_timeout_ms"));
    }
    if cb.monitoring_window_ms == 0 {
        errors.push(zero("circuit_breaker.monitoring_window_ms"));
    }
    if cb.half_open_max_calls == 0 {
        errors.push(zero("circuit_breaker.half_open_max_calls"));
    }

    let mut seen = HashSet::new();
    for o in &cb.endpoints {
        if !seen.insert(o.endpoint.as_str()) {
            errors.push(ValidationError::DuplicateEndpoint(o.endpoint.clone()));
        }
        if o.failure_threshold == Some(0) {
            errors.push(zero(&format!("circuit_breaker.endpoints[{}].failure_threshold", o.endpoint)));
        }
        if o.half_open_max_calls == Some(0) {
            errors.push(zero(&format!("circuit_breaker.endpoints[{}].half_open_max_calls", o.endpoint)));
        }
        if o.reset_timeout_ms == Some(0) {
            errors.push(zero(&format!("circuit_breaker.endpoints[{}].reset_timeout_ms", o.endpoint)));
        }
        if o.monitoring_window_ms == Some(0) {
            errors.push(zero(&format!("circuit_breaker.endpoints[{}].monitoring_window_ms", o.endpoint)));
        }
    }

    let rc = &config.recovery;
    if rc.health_check_enabled {
        if rc.health_check_interval_secs == 0 {
            errors.push(zero("recovery.health_check_interval_secs"));
        }
        if rc.probe_timeout_secs == 0 {
            errors.push(zero("recovery.probe_timeout_secs"));
        }
        if url::Url::parse(&rc.probe_base_url).is_err() {
            errors.push(ValidationError::InvalidUrl {
                field: "recovery.probe_base_url".to_string(),
                value: rc.probe_base_url.clone(),
            });
        }
    }
    if rc.stuck_sweep_enabled && rc.stuck_sweep_interval_secs == 0 {
        errors.push(zero("recovery.stuck_sweep_interval_secs"));
    }
    if rc.stale_sweep_enabled && rc.stale_sweep_interval_secs == 0 {
        errors.push(zero("recovery.stale_sweep_interval_secs"));
    }

    if config.degradation.fallback_ttl_secs == 0 {
        errors.push(zero("degradation.fallback_ttl_secs"));
    }
    if config.storage.quota_bytes == 0 {
        errors.push(zero("storage.quota_bytes"));
    }

    if config.versions.supported.is_empty() {
        errors.push(ValidationError::NoSupportedVersions);
    } else if !config.versions.supported.contains(&config.versions.current) {
        errors.push(ValidationError::UnsupportedCurrentVersion(config.versions.current.clone()));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address".to_string(),
            value: config.observability.metrics_address.clone(),
        });
    }
    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "admin.bind_address".to_string(),
            value: config.admin.bind_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
