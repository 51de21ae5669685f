//! Push API Server
//!
//! HTTP side channel between sites. Downstream sites POST their
//! `ServiceTableUpdate` here; the rest of the routes are for operators.

use crate::domain::services::{LocalServices, ServiceTable};
use crate::domain::{EdgeSite, ServiceTableUpdate};
use crate::infrastructure::metrics::RouterMetrics;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

/// Reply to an accepted update.
#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub applied: bool,
    pub origin: EdgeSite,
    pub services: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub site: EdgeSite,
    pub local_services: Vec<String>,
    pub table_entries: usize,
}

/// Shared handler state.
#[derive(Clone)]
pub struct PushState {
    pub site: EdgeSite,
    pub table: Arc<ServiceTable>,
    pub local: Arc<LocalServices>,
    pub metrics: Arc<RouterMetrics>,
}

/// Routes of the push listener.
pub fn push_router(state: PushState) -> Router {
    Router::new()
        .route("/", post(update_handler))
        .route("/update", post(update_handler))
        .route("/table", get(table_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    listen_addr: SocketAddr,
    state: PushState,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, state: PushState) -> Self {
        Self { listen_addr, state }
    }

    /// Serve until `shutdown` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        tracing::info!("push listener on {}", self.listen_addr);

        axum::serve(listener, push_router(self.state.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;
        Ok(())
    }
}

async fn update_handler(State(state): State<PushState>, body: Bytes) -> impl IntoResponse {
    let update: ServiceTableUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            tracing::warn!("discarding malformed table update: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    if !update.origin.location.is_valid() {
        tracing::warn!("discarding table update from {}: bad coordinates", update.origin);
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "coordinates out of range" })),
        )
            .into_response();
    }

    state.table.apply(&update);
    Json(UpdateResponse {
        applied: true,
        origin: update.origin,
        services: update.services.len(),
    })
    .into_response()
}

async fn table_handler(State(state): State<PushState>) -> impl IntoResponse {
    Json(state.table.snapshot())
}

async fn health_handler(State(state): State<PushState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        site: state.site,
        local_services: state.local.snapshot(),
        table_entries: state.table.len(),
    })
}

async fn metrics_handler(State(state): State<PushState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export_prometheus(),
    )
}
