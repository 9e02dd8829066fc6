use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::AdminState;
use crate::degradation::{DegradationOptions, ServiceStatus};
use crate::recovery::QueryHealthReport;
use crate::resilience::{CircuitSnapshot, CircuitState};

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    /// `operational`, `degraded` (some circuit open) or `offline`.
    pub status: String,
    pub reachable: bool,
    pub offline: bool,
    pub open_circuits: usize,
    pub api_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OfflineStatus {
    pub offline: bool,
    pub options: DegradationOptions,
}

#[derive(Debug, Deserialize)]
pub struct ResetParams {
    pub endpoint: String,
}

#[derive(Debug, Deserialize)]
pub struct OfflineParams {
    pub enabled: bool,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let layer = &state.layer;
    let open_circuits = layer
        .registry
        .snapshots()
        .iter()
        .filter(|s| s.state == CircuitState::Open)
        .count();
    let offline = layer.degradation.is_offline_mode();

    let status = if offline {
        "offline"
    } else if open_circuits > 0 {
        "degraded"
    } else {
        "operational"
    };

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: status.to_string(),
        reachable: layer.recovery.is_reachable(),
        offline,
        open_circuits,
        api_version: layer.versions.current_version(),
    })
}

pub async fn get_services(State(state): State<AdminState>) -> Json<Vec<ServiceStatus>> {
    Json(state.layer.degradation.all_service_statuses())
}

pub async fn get_circuits(State(state): State<AdminState>) -> Json<Vec<CircuitSnapshot>> {
    Json(state.layer.registry.snapshots())
}

pub async fn reset_circuit(
    State(state): State<AdminState>,
    Query(params): Query<ResetParams>,
) -> Result<Json<CircuitSnapshot>, StatusCode> {
    if !state.layer.registry.reset(&params.endpoint) {
        return Err(StatusCode::NOT_FOUND);
    }
    tracing::info!(endpoint = %params.endpoint, "Circuit reset by admin");
    state
        .layer
        .registry
        .peek(&params.endpoint)
        .map(|b| Json(b.snapshot()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Manual sync: one stuck/stale sweep pass.
pub async fn post_sync(State(state): State<AdminState>) -> Json<QueryHealthReport> {
    let report = state.layer.recovery.perform_health_check();
    tracing::info!(recovered = report.total_recovered, "Manual sync requested");
    Json(report)
}

pub async fn get_offline(State(state): State<AdminState>) -> Json<OfflineStatus> {
    let degradation = &state.layer.degradation;
    Json(OfflineStatus {
        offline: degradation.is_offline_mode(),
        options: degradation.degradation_options(),
    })
}

pub async fn set_offline(
    State(state): State<AdminState>,
    Query(params): Query<OfflineParams>,
) -> Json<OfflineStatus> {
    state.layer.degradation.set_offline_mode(params.enabled);
    get_offline(State(state)).await
}
