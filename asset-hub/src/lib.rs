//! HTTP surface of the projector process: liveness and projection counters.

use asset_hub_core::projector::{ProjectorStats, StatsSnapshot};
use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(stats: Arc<ProjectorStats>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(stats)
}

async fn stats_handler(State(stats): State<Arc<ProjectorStats>>) -> Json<StatsSnapshot> {
    Json(stats.snapshot())
}
