//! Metrics collection and exposition.
//!
//! # Metrics
//! - `resilience_circuit_state` (gauge): 0=closed, 1=half_open, 2=open, by endpoint
//! - `resilience_circuit_rejections_total` (counter): short-circuited calls by endpoint
//! - `resilience_dedup_requests_total` (counter): by outcome (started, shared)
//! - `resilience_conflicts_detected_total` (counter)
//! - `resilience_fallback_lookups_total` (counter): by service, result (hit, miss, expired)
//! - `resilience_recovered_queries_total` (counter): by kind (stuck, stale, reconnect)
//! - `resilience_probe_total` (counter): by result (reachable, unreachable)
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels stay low-cardinality (endpoint and service names only)

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus exporter with an HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_circuit_state(endpoint: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    metrics::gauge!("resilience_circuit_state", "endpoint" => endpoint.to_string()).set(value);
}

pub fn record_circuit_rejected(endpoint: &str) {
    metrics::counter!("resilience_circuit_rejections_total", "endpoint" => endpoint.to_string())
        .increment(1);
}

pub fn record_dedup(outcome: &'static str) {
    metrics::counter!("resilience_dedup_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_conflicts_detected(count: usize) {
    metrics::counter!("resilience_conflicts_detected_total").increment(count as u64);
}

pub fn record_fallback_lookup(service: &str, result: &'static str) {
    metrics::counter!(
        "resilience_fallback_lookups_total",
        "service" => service.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_recovered_queries(kind: &'static str, count: usize) {
    metrics::counter!("resilience_recovered_queries_total", "kind" => kind).increment(count as u64);
}

pub fn record_probe(reachable: bool) {
    let result = if reachable { "reachable" } else { "unreachable" };
    metrics::counter!("resilience_probe_total", "result" => result).increment(1);
}
