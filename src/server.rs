// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Health probe and prometheus endpoint.

use crate::metrics::GuardianMetrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Registry, TextEncoder};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    registry: Registry,
    metrics: Arc<GuardianMetrics>,
}

pub fn build_router(registry: Registry, metrics: Arc<GuardianMetrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(AppState { registry, metrics })
}

pub async fn serve(
    port: u16,
    registry: Registry,
    metrics: Arc<GuardianMetrics>,
    cancel: CancellationToken,
) {
    let router = build_router(registry, metrics);
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("[Server] cannot bind port {}: {}", port, e);
            cancel.cancel();
            return;
        }
    };
    info!("[Server] health and metrics listening on port {}", port);
    let shutdown = cancel.clone();
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        error!("[Server] serve error: {}", e);
    }
}

pub fn health_payload(metrics: &GuardianMetrics) -> Value {
    json!({
        "status": "ok",
        "headBlock": metrics.head_block.get(),
        "lastProcessedBlock": metrics.last_processed_block.get(),
        "cacheWatermark": metrics.cache_watermark.get(),
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(health_payload(&state.metrics))
}

async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    match TextEncoder::new().encode_to_string(&state.registry.gather()) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {}", e),
        ),
    }
}
