//! Authenticated admin HTTP surface.
//!
//! # Endpoints
//! - `GET  /admin/status`
//! - `GET  /admin/services`
//! - `GET  /admin/circuits`
//! - `POST /admin/circuits/reset?endpoint=/name`
//! - `POST /admin/sync`
//! - `GET  /admin/offline`, `POST /admin/offline?enabled=bool`

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::lifecycle::{ResilienceLayer, Shutdown};

#[derive(Clone)]
pub struct AdminState {
    pub layer: Arc<ResilienceLayer>,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/services", get(get_services))
        .route("/admin/circuits", get(get_circuits))
        .route("/admin/circuits/reset", post(reset_circuit))
        .route("/admin/sync", post(post_sync))
        .route("/admin/offline", get(get_offline).post(set_offline))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin router until shutdown.
pub async fn serve(listener: TcpListener, router: Router, shutdown: Shutdown) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.wait())
        .await?;

    tracing::info!("Admin server stopped");
    Ok(())
}
