//! HTTP surface for the live-vault query.
//!
//!   GET /health                → JSON liveness + tracked vault count
//!   GET /api/live-vaults       → JSON LiveVaultReport
//!   GET /api/live-vaults/text  → the same report rendered as chat HTML

use crate::chain::ChainReader;
use crate::query::LiveVaultService;
use crate::store::SnapshotStore;
use axum::extract::State;
use axum::response::{Html, IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub struct ApiState<R: ChainReader> {
    pub service: Arc<LiveVaultService<R>>,
    pub store: Arc<SnapshotStore>,
}

impl<R: ChainReader> Clone for ApiState<R> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            store: self.store.clone(),
        }
    }
}

pub fn build_router<R: ChainReader + 'static>(state: ApiState<R>) -> Router {
    Router::new()
        .route("/health", get(health::<R>))
        .route("/api/live-vaults", get(live_vaults::<R>))
        .route("/api/live-vaults/text", get(live_vaults_text::<R>))
        .with_state(state)
}

pub async fn serve<R: ChainReader + 'static>(
    state: ApiState<R>,
    bind_addr: &str,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "query api listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health<R: ChainReader + 'static>(State(state): State<ApiState<R>>) -> impl IntoResponse {
    let vaults = state.store.vaults().await.len();
    let last_block = state.store.last_processed_block().await;
    Json(json!({
        "status": "ok",
        "vaults": vaults,
        "lastProcessedBlock": last_block,
    }))
}

async fn live_vaults<R: ChainReader + 'static>(
    State(state): State<ApiState<R>>,
) -> impl IntoResponse {
    let report = state.service.list_live_vaults().await;
    Json(report.as_ref().clone())
}

async fn live_vaults_text<R: ChainReader + 'static>(
    State(state): State<ApiState<R>>,
) -> impl IntoResponse {
    let report = state.service.list_live_vaults().await;
    Html(report.rendered().to_string())
}
